use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Thresholds governing the dialog FSM (see [`FsmConfig::silence_threshold_seconds`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FsmConfig {
    /// Seconds of silence before the FSM moves LISTENING -> HINTING.
    pub silence_threshold_seconds: f64,
    /// Concept-coverage ratio (0-1] at which ANALYZING -> CONSOLIDATING fires.
    pub coverage_threshold: f64,
}

impl Default for FsmConfig {
    fn default() -> Self {
        Self {
            silence_threshold_seconds: 5.0,
            coverage_threshold: 0.9,
        }
    }
}

/// Weights used by the hint controller's dependency-score formula.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HintConfig {
    /// Level (as a decimal string — TOML tables require string keys) ->
    /// weight. Levels absent from the map fall back to 1.0.
    pub weights: HashMap<String, f64>,
    /// Multilingual substring keywords used by the hint-request classifier.
    pub request_keywords: Vec<String>,
}

impl Default for HintConfig {
    fn default() -> Self {
        Self {
            weights: HashMap::from([
                ("1".to_string(), 0.2),
                ("2".to_string(), 0.5),
                ("3".to_string(), 1.0),
            ]),
            request_keywords: default_hint_keywords(),
        }
    }
}

fn default_hint_keywords() -> Vec<String> {
    [
        "hint", "help", "stuck", "i don't know", "i dont know", "give me a hint",
        "提示", "給我提示", "幫幫我", "不知道", "不會", "卡住", "想不出來",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// Configuration for the LLM Port (timeout, retry, fallback policy).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL for the local inference endpoint.
    /// Overridden at runtime by the `TUTOR_LLM_BASE_URL` environment variable
    /// when set.
    pub base_url: String,
    /// Model name passed to the inference endpoint.
    pub model: String,
    /// Total timeout budget per `generate` call.
    pub timeout_seconds: u64,
    /// Max retry attempts for transport-level failures (not ModelMissing).
    pub max_retries: u32,
    /// Whether to return a configured fallback string when retries are exhausted.
    pub enable_fallback: bool,
    /// Text returned by a degraded response when fallback is enabled.
    pub fallback_text: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "llama3.1:8b".to_string(),
            timeout_seconds: 30,
            max_retries: 2,
            enable_fallback: true,
            fallback_text: "I'm having trouble thinking right now — let's keep going, \
                             tell me more about your approach."
                .to_string(),
        }
    }
}

/// Configuration for the Retrieval Port's per-turn query bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub max_results: usize,
    pub min_similarity: f32,
    /// Embedding + store budget per retrieval call.
    pub timeout_seconds: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            max_results: 5,
            min_similarity: 0.3,
            timeout_seconds: 10,
        }
    }
}

/// Configuration for the Prompt Composer's bounded context windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    /// Number of most-recent turns included in the user prompt's history block.
    pub history_turns: usize,
    /// Number of retrieved documents injected into the system prompt.
    pub max_retrieved_docs: usize,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            history_turns: 5,
            max_retrieved_docs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Top-level configuration for the tutoring core, assembled from one
/// sub-config per component.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TutoringConfig {
    pub fsm: FsmConfig,
    pub hint: HintConfig,
    pub llm: LlmConfig,
    pub retrieval: RetrievalConfig,
    pub prompt: PromptConfig,
    pub telemetry: TelemetryConfig,
}

impl TutoringConfig {
    /// Load from a TOML file, falling back to defaults for any missing
    /// fields (and falling back entirely if the file does not exist), then
    /// apply environment-variable overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    /// Overlay `TUTOR_*` environment variables on top of file/default config.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(value) = env::var("TUTOR_LLM_BASE_URL") {
            if !value.is_empty() {
                self.llm.base_url = value;
            }
        }
        if let Ok(value) = env::var("TUTOR_LLM_MODEL") {
            if !value.is_empty() {
                self.llm.model = value;
            }
        }
        if let Some(v) = parse_env_f64("TUTOR_SILENCE_THRESHOLD_SECONDS") {
            self.fsm.silence_threshold_seconds = v;
        }
        if let Some(v) = parse_env_f64("TUTOR_COVERAGE_THRESHOLD") {
            self.fsm.coverage_threshold = v;
        }
        if let Some(v) = parse_env_u64("TUTOR_LLM_TIMEOUT_SECONDS") {
            self.llm.timeout_seconds = v;
        }
        if let Some(v) = parse_env_u64("TUTOR_LLM_MAX_RETRIES") {
            self.llm.max_retries = v as u32;
        }
    }
}

fn parse_env_f64(name: &str) -> Option<f64> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}

fn parse_env_u64(name: &str) -> Option<u64> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = TutoringConfig::default();
        assert_eq!(config.fsm.silence_threshold_seconds, 5.0);
        assert_eq!(config.fsm.coverage_threshold, 0.9);
        assert_eq!(config.hint.weights.get("1"), Some(&0.2));
        assert_eq!(config.hint.weights.get("2"), Some(&0.5));
        assert_eq!(config.hint.weights.get("3"), Some(&1.0));
        assert_eq!(config.llm.timeout_seconds, 30);
        assert_eq!(config.llm.max_retries, 2);
        assert!(config.llm.enable_fallback);
        assert_eq!(config.retrieval.max_results, 5);
        assert_eq!(config.retrieval.min_similarity, 0.3);
        assert_eq!(config.prompt.history_turns, 5);
        assert_eq!(config.prompt.max_retrieved_docs, 5);
    }

    #[test]
    fn load_from_missing_path_falls_back_to_defaults() {
        let config = TutoringConfig::load_from("/nonexistent/path/tutor.toml").unwrap();
        assert_eq!(config.fsm.coverage_threshold, 0.9);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tutor.toml");

        let mut config = TutoringConfig::default();
        config.fsm.silence_threshold_seconds = 7.5;
        config.save_to(&path).unwrap();

        let loaded = TutoringConfig::load_from(&path).unwrap();
        assert_eq!(loaded.fsm.silence_threshold_seconds, 7.5);
    }

    #[test]
    fn env_override_wins_over_file_value() {
        // SAFETY: test runs single-threaded within this process's test harness
        // and restores the variable afterward.
        unsafe {
            env::set_var("TUTOR_COVERAGE_THRESHOLD", "0.75");
        }
        let mut config = TutoringConfig::default();
        config.apply_env_overrides();
        unsafe {
            env::remove_var("TUTOR_COVERAGE_THRESHOLD");
        }
        assert_eq!(config.fsm.coverage_threshold, 0.75);
    }
}
