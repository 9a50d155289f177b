//! LLM Port: text generation with timeout, bounded retry, and fallback.
//!
//! [`LlmPort`] is the trait the Dialog Engine programs against. The default
//! implementation, [`OllamaLlmPort`], targets a local Ollama-compatible HTTP
//! endpoint (`POST {base_url}/api/generate`) and applies the retry/timeout/
//! fallback policy itself rather than leaning on a wrapper, treating those
//! as properties of the port.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tutor_config::LlmConfig;

/// Sampling/generation knobs passed through to the backend, if it supports them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// A single generation request.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    pub system: Option<String>,
    pub options: GenerationOptions,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system: None,
            options: GenerationOptions::default(),
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

/// Provenance attached to every generation, degraded or not.
#[derive(Debug, Clone)]
pub struct GenerationProvenance {
    pub model: String,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub elapsed: Duration,
}

/// Result of a `generate` call.
///
/// `error` is `Some(..)` exactly when the port fell through to its fallback
/// text — the Dialog Engine must still treat the turn as completed, but may
/// want to log or surface the degradation.
#[derive(Debug, Clone)]
pub struct GenerationResponse {
    pub text: String,
    pub provenance: GenerationProvenance,
    pub error: Option<String>,
}

impl GenerationResponse {
    pub fn is_degraded(&self) -> bool {
        self.error.is_some()
    }
}

/// Errors a backend can report to the retry/fallback layer.
///
/// Only [`LlmError::Transport`] and [`LlmError::Timeout`] are retryable;
/// [`LlmError::ModelMissing`] is surfaced immediately, never retried, and
/// never papered over by the fallback policy.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LlmError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("generation timed out after {0:?}")]
    Timeout(Duration),
    #[error("model not found: {0}")]
    ModelMissing(String),
}

impl LlmError {
    fn is_retryable(&self) -> bool {
        matches!(self, LlmError::Transport(_) | LlmError::Timeout(_))
    }
}

/// Abstracts text generation so the Dialog Engine never talks to an HTTP
/// client directly.
///
/// `cancel` is the request-scoped cancellation token threaded through the
/// pipeline. A port should race its underlying call against
/// `cancel.cancelled()` and report a cancellation as [`LlmError::Transport`]
/// so the retry/fallback policy treats it exactly like any other transport
/// failure.
#[async_trait]
pub trait LlmPort: Send + Sync {
    async fn generate(
        &self,
        request: GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<GenerationResponse, LlmError>;
}

/// Default [`LlmPort`] backed by a local Ollama-compatible inference server.
///
/// Wire shape: request is
/// `{model, prompt, system?, options, stream: false}`, response carries
/// `{response, model, done, prompt_eval_count, eval_count}`. A 404 from the
/// endpoint means the configured model name doesn't exist there and maps to
/// [`LlmError::ModelMissing`] — never retried.
pub struct OllamaLlmPort {
    client: reqwest::Client,
    config: LlmConfig,
}

impl OllamaLlmPort {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/api/generate", self.config.base_url.trim_end_matches('/'))
    }

    async fn attempt(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerationResponse, LlmError> {
        let started = std::time::Instant::now();
        let payload = json!({
            "model": self.config.model,
            "prompt": request.prompt,
            "system": request.system,
            "options": request.options,
            "stream": false,
        });

        let call = self
            .client
            .post(self.endpoint())
            .json(&payload)
            .timeout(Duration::from_secs(self.config.timeout_seconds));

        let response = tokio::select! {
            result = call.send() => result.map_err(|error| {
                if error.is_timeout() {
                    LlmError::Timeout(Duration::from_secs(self.config.timeout_seconds))
                } else {
                    LlmError::Transport(error.to_string())
                }
            })?,
            _ = cancel.cancelled() => return Err(LlmError::Transport("cancelled".to_string())),
        };

        let status = response.status();
        if status.as_u16() == 404 {
            return Err(LlmError::ModelMissing(self.config.model.clone()));
        }
        if status.is_server_error() {
            return Err(LlmError::Transport(format!("server error: {status}")));
        }
        if !status.is_success() {
            return Err(LlmError::Transport(format!("unexpected status: {status}")));
        }

        let body: OllamaGenerateResponse = response
            .json()
            .await
            .map_err(|error| LlmError::Transport(error.to_string()))?;

        Ok(GenerationResponse {
            text: body.response,
            provenance: GenerationProvenance {
                model: body.model,
                input_tokens: body.prompt_eval_count,
                output_tokens: body.eval_count,
                elapsed: started.elapsed(),
            },
            error: None,
        })
    }

    fn fallback_response(&self, reason: &str) -> GenerationResponse {
        GenerationResponse {
            text: self.config.fallback_text.clone(),
            provenance: GenerationProvenance {
                model: self.config.model.clone(),
                input_tokens: None,
                output_tokens: None,
                elapsed: Duration::ZERO,
            },
            error: Some(reason.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct OllamaGenerateResponse {
    response: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    #[allow(dead_code)]
    done: bool,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
}

#[async_trait]
impl LlmPort for OllamaLlmPort {
    async fn generate(
        &self,
        request: GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<GenerationResponse, LlmError> {
        if cancel.is_cancelled() {
            return Err(LlmError::Transport("cancelled".to_string()));
        }

        let mut last_error = None;

        for attempt in 0..=self.config.max_retries {
            match self.attempt(&request, &cancel).await {
                Ok(response) => {
                    debug!(attempt, model = %self.config.model, "llm generation succeeded");
                    return Ok(response);
                }
                Err(error @ LlmError::ModelMissing(_)) => {
                    warn!(error = %error, "llm model missing — not retrying");
                    return Err(error);
                }
                Err(error) if !error.is_retryable() => return Err(error),
                Err(error) => {
                    warn!(attempt, max = self.config.max_retries, error = %error, "llm transport failure");
                    last_error = Some(error);
                }
            }
            if cancel.is_cancelled() {
                last_error = Some(LlmError::Transport("cancelled".to_string()));
                break;
            }
        }

        let reason = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "exhausted retries".to_string());

        if self.config.enable_fallback {
            info!(reason = %reason, "llm falling back to degraded response");
            Ok(self.fallback_response(&reason))
        } else {
            Err(LlmError::Transport(reason))
        }
    }
}

/// Deterministic test double: returns scripted text or a fixed failure.
#[derive(Debug, Default)]
pub struct FakeLlmPort {
    pub responses: std::sync::Mutex<std::collections::VecDeque<String>>,
    pub fail: bool,
    pub fallback_text: String,
    pub hard_error: Option<LlmErrorKind>,
}

/// Cloneable stand-in for [`LlmError`], since the fake port needs to return
/// the same error repeatedly and `LlmError` itself isn't `Clone`.
#[derive(Debug, Clone)]
pub enum LlmErrorKind {
    ModelMissing(String),
}

impl From<LlmErrorKind> for LlmError {
    fn from(kind: LlmErrorKind) -> Self {
        match kind {
            LlmErrorKind::ModelMissing(model) => LlmError::ModelMissing(model),
        }
    }
}

impl FakeLlmPort {
    pub fn with_responses(responses: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            responses: std::sync::Mutex::new(responses.into_iter().map(Into::into).collect()),
            fail: false,
            fallback_text: String::new(),
            hard_error: None,
        }
    }

    pub fn always_fails_with_fallback(fallback_text: impl Into<String>) -> Self {
        Self {
            responses: std::sync::Mutex::new(Default::default()),
            fail: true,
            fallback_text: fallback_text.into(),
            hard_error: None,
        }
    }

    /// Always returns `error` as a hard `Err`, bypassing the fallback path
    /// entirely — used to exercise `LlmError::ModelMissing` propagation.
    pub fn always_fails_with(error: LlmErrorKind) -> Self {
        Self {
            responses: std::sync::Mutex::new(Default::default()),
            fail: false,
            fallback_text: String::new(),
            hard_error: Some(error),
        }
    }
}

#[async_trait]
impl LlmPort for FakeLlmPort {
    async fn generate(
        &self,
        _request: GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<GenerationResponse, LlmError> {
        if cancel.is_cancelled() {
            return Err(LlmError::Transport("cancelled".to_string()));
        }

        if let Some(error) = &self.hard_error {
            return Err(error.clone().into());
        }

        if self.fail {
            return Ok(GenerationResponse {
                text: self.fallback_text.clone(),
                provenance: GenerationProvenance {
                    model: "fake".to_string(),
                    input_tokens: None,
                    output_tokens: None,
                    elapsed: Duration::ZERO,
                },
                error: Some("fake transport failure".to_string()),
            });
        }

        let mut responses = self.responses.lock().expect("fake llm port lock poisoned");
        let text = responses.pop_front().unwrap_or_default();
        Ok(GenerationResponse {
            text,
            provenance: GenerationProvenance {
                model: "fake".to_string(),
                input_tokens: None,
                output_tokens: None,
                elapsed: Duration::ZERO,
            },
            error: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_port_returns_scripted_responses_in_order() {
        let port = FakeLlmPort::with_responses(["first", "second"]);
        let first = port.generate(GenerationRequest::new("hi"), CancellationToken::new()).await.unwrap();
        let second = port.generate(GenerationRequest::new("hi"), CancellationToken::new()).await.unwrap();
        assert_eq!(first.text, "first");
        assert_eq!(second.text, "second");
        assert!(!first.is_degraded());
    }

    #[tokio::test]
    async fn fake_port_always_fails_marks_degraded() {
        let port = FakeLlmPort::always_fails_with_fallback("sorry, unavailable");
        let response = port.generate(GenerationRequest::new("hi"), CancellationToken::new()).await.unwrap();
        assert!(response.is_degraded());
        assert_eq!(response.text, "sorry, unavailable");
    }

    #[tokio::test]
    async fn a_pre_cancelled_token_short_circuits_without_calling_the_backend() {
        let port = FakeLlmPort::with_responses(["should not be returned"]);
        let token = CancellationToken::new();
        token.cancel();
        let error = port.generate(GenerationRequest::new("hi"), token).await.unwrap_err();
        assert!(matches!(error, LlmError::Transport(reason) if reason == "cancelled"));
    }

    #[test]
    fn model_missing_is_not_retryable() {
        assert!(!LlmError::ModelMissing("llama3".into()).is_retryable());
        assert!(LlmError::Transport("refused".into()).is_retryable());
        assert!(LlmError::Timeout(Duration::from_secs(1)).is_retryable());
    }
}
