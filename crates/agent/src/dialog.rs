//! Dialog Engine: the per-turn pipeline binding the FSM, Hint Controller,
//! Retrieval Port, LLM Port, and Prompt Composer into a single session
//! lifecycle.
//!
//! Step numbers in comments below refer to the twelve-step per-turn
//! pipeline. The order is invariant and part of the contract.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use tutor_config::TutoringConfig;
use tutor_llm::{GenerationRequest, LlmPort};
use tutor_memory::{RetrievalContext, RetrievalPort};
use tutor_prompt::{HistoryTurn, PromptComposer, PromptContext};

use crate::classifier::HintRequestClassifier;
use crate::error_book::{ErrorBookPort, ErrorBookRecord, NoopErrorBookPort};
use crate::fsm::{AnalysisOutcome, FsmEvent, FsmState};
use crate::hint::HintRecord;
use crate::metrics::MetricsAggregator;
use crate::session::{
    AnalysisResult, QuestionId, ResponseType, Session, SessionId, Speaker, StudentId,
    SILENCE_MARKER,
};
use crate::store::{SessionState, SessionStore};

/// Input for a single student turn.
#[derive(Debug, Clone)]
pub struct StudentInput {
    pub session_id: SessionId,
    pub text: String,
    pub audio_features: Option<crate::session::AudioFeatures>,
}

/// Output of a single student turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TutorResponse {
    pub text: String,
    pub response_type: ResponseType,
    pub hint_level: Option<u8>,
    pub related_concepts: Vec<String>,
    pub suggested_next_step: Option<String>,
    pub fsm_state: FsmState,
    pub degraded: bool,
}

/// Returned by `start_session`.
#[derive(Debug, Clone)]
pub struct StartResult {
    pub session_id: SessionId,
    pub fsm_state: FsmState,
    pub initial_message: String,
}

/// One flattened hint usage row for a [`SessionSummary`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HintUsage {
    pub level: u8,
    pub concept: String,
    pub timestamp: DateTime<Utc>,
}

impl From<&HintRecord> for HintUsage {
    fn from(record: &HintRecord) -> Self {
        Self {
            level: record.level,
            concept: record.concept.clone(),
            timestamp: record.timestamp,
        }
    }
}

/// Returned by `end_session`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub duration_seconds: f64,
    pub concepts_covered: Vec<String>,
    pub concept_coverage: f64,
    pub hints_used: Vec<HintUsage>,
    pub total_turns: u32,
    pub final_state: FsmState,
}

#[derive(Debug, thiserror::Error)]
pub enum DialogError {
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),
    /// The sole variant permitted to cross the public surface as a hard
    /// error: a misconfigured model name is an operator problem, not a
    /// degraded-but-complete turn.
    #[error("configured model is unavailable: {0}")]
    ModelMissing(String),
}

/// Binds the FSM Controller, Hint Controller, Retrieval Port, LLM Port and
/// Prompt Composer into the per-turn pipeline. Also owns the Session Store
/// since it is the only collaborator that needs the concrete [`Session`]
/// type.
pub struct DialogEngine {
    config: TutoringConfig,
    store: SessionStore,
    retrieval: Arc<dyn RetrievalPort>,
    llm: Arc<dyn LlmPort>,
    composer: PromptComposer,
    classifier: Arc<dyn HintRequestClassifier>,
    metrics: MetricsAggregator,
    error_book: Arc<dyn ErrorBookPort>,
}

impl DialogEngine {
    pub fn new(
        config: TutoringConfig,
        retrieval: Arc<dyn RetrievalPort>,
        llm: Arc<dyn LlmPort>,
        classifier: Arc<dyn HintRequestClassifier>,
    ) -> Self {
        let composer = PromptComposer::from_config(&config.prompt);
        let store = SessionStore::new(config.fsm.clone(), config.hint.clone());
        Self {
            config,
            store,
            retrieval,
            llm,
            composer,
            classifier,
            metrics: MetricsAggregator::new(),
            error_book: Arc::new(NoopErrorBookPort),
        }
    }

    /// Attach a durable write-through sink. Intended to be chained
    /// immediately after [`DialogEngine::new`], before any session is
    /// created.
    pub fn with_durable(mut self, durable: Arc<dyn tutor_memory::SessionStorePort<crate::store::SessionRow>>) -> Self {
        self.store = SessionStore::new(self.config.fsm.clone(), self.config.hint.clone()).with_durable(durable);
        self
    }

    /// Attach an error-book collaborator. Published to on every REPAIR
    /// transition; defaults to [`NoopErrorBookPort`].
    pub fn with_error_book(mut self, error_book: Arc<dyn ErrorBookPort>) -> Self {
        self.error_book = error_book;
        self
    }

    pub async fn list_active(&self) -> Vec<SessionId> {
        self.store.list_active_ids().await
    }

    pub async fn cleanup(&self) -> usize {
        self.store.cleanup_terminal().await
    }

    pub async fn get_state(&self, session_id: &SessionId) -> Option<FsmState> {
        let handle = self.store.get(session_id).await?;
        let guard = handle.lock().await;
        Some(guard.fsm.state())
    }

    /// `start_session`: allocates a Session, resets the FSM, fires
    /// SESSION_START, and initializes the Hint Controller with the first
    /// required concept.
    #[instrument(skip(self, question_text, standard_solution))]
    pub async fn start_session(
        &self,
        question_id: QuestionId,
        student_id: StudentId,
        question_text: String,
        standard_solution: String,
        required_concepts: Vec<String>,
    ) -> StartResult {
        let first_concept = required_concepts.first().cloned();
        let session = Session::new(
            student_id,
            question_id,
            question_text.clone(),
            standard_solution,
            required_concepts,
        );
        let session_id = session.id.clone();

        let handle = self.store.create(session).await;
        let fsm_state = {
            let mut guard = handle.lock().await;
            let state = guard.fsm.apply(FsmEvent::SessionStart);
            if let Some(concept) = &first_concept {
                guard.hints.reset_for_concept(concept);
            }
            state
        };

        info!(%session_id, ?fsm_state, "session started");

        let initial_message = format!(
            "Let's work through this together: {question_text}\n\nTell me how you'd start thinking about it."
        );

        StartResult { session_id, fsm_state, initial_message }
    }

    /// `process_student_input`: the twelve-step per-turn pipeline.
    #[instrument(skip(self, input), fields(session_id = %input.session_id))]
    pub async fn process_student_input(&self, input: StudentInput) -> Result<TutorResponse, DialogError> {
        // Step 1: lookup. Missing session -> benign acknowledge, no state change.
        let Some(handle) = self.store.get(&input.session_id).await else {
            warn!(session_id = %input.session_id, "session not found");
            return Ok(acknowledge_error("I couldn't find that session — let's start a new one."));
        };
        // Request-scoped cancellation token: `end_session` can cancel this
        // before the lock below is released.
        let cancel = self.store.cancellation_token(&input.session_id).await.unwrap_or_default();

        let mut guard = handle.lock().await; // serialize this session's pipeline

        // A terminal session gets a benign acknowledge, no append.
        if guard.session.is_terminal() {
            return Ok(acknowledge_error("This session has already ended."));
        }

        // Step 2: record the student turn at the current FSM state.
        let state_at_input = guard.fsm.state();
        let _ = guard.session.record_turn(Speaker::Student, input.text.clone(), state_at_input);
        guard.session.accumulate_audio(input.audio_features.as_ref());
        if let Some(turn) = guard.session.turns.last().cloned() {
            self.store.persist_turn(&input.session_id, &turn).await;
        }

        // Step 3: hint-request classification.
        if self.classifier.is_hint_request(&input.text) {
            guard.fsm.apply(FsmEvent::HintRequest);
            return self.run_hint_turn(&input.session_id, &mut guard, &input.text, cancel).await;
        }

        // Step 4: advance FSM with STUDENT_INPUT (LISTENING -> ANALYZING).
        guard.fsm.apply(FsmEvent::StudentInput);

        // Step 5: retrieve context. Errors are swallowed into an empty list.
        // A cancellation observed before the call skips it outright —
        // cancellation is checked before and after each port call.
        let rag_documents = if cancel.is_cancelled() {
            Vec::new()
        } else {
            self.retrieve(&guard.session, &input.text).await
        };

        // Step 6: analyze via the LLM. Parse failure -> conservative fallback.
        // ModelMissing is the one failure that escapes as a hard error
        // rather than being downgraded.
        let (analysis_system, analysis_user) = self.composer.analysis_prompt(
            &input.text,
            &guard.session.question_text,
            Some(&guard.session.standard_solution),
        );
        let analysis_response = self
            .llm
            .generate(GenerationRequest::new(analysis_user).with_system(analysis_system), cancel.clone())
            .await;
        let analysis = match analysis_response {
            Ok(response) => AnalysisResult::parse(&response.text)
                .unwrap_or_else(|_| AnalysisResult::conservative_fallback(response.text.clone())),
            Err(tutor_llm::LlmError::ModelMissing(model)) => return Err(DialogError::ModelMissing(model)),
            Err(error) => {
                warn!(%error, "analysis generation failed outright");
                AnalysisResult::conservative_fallback(input.text.clone())
            }
        };

        // Step 7: merge covered concepts.
        guard.session.concepts.merge(analysis.covered_concepts.clone());
        let coverage = guard.session.concepts.coverage_ratio();

        // Step 8: advance FSM with ANALYSIS_RESULT (priority rules, §4.A).
        let outcome = AnalysisOutcome::from_analysis(&analysis, coverage);
        let new_state = guard.fsm.apply(FsmEvent::AnalysisResult(outcome));

        if new_state == FsmState::Repair {
            self.error_book
                .publish(ErrorBookRecord {
                    student_id: guard.session.student_id.0.clone(),
                    question_id: guard.session.question_id.0.clone(),
                    student_answer: input.text.clone(),
                    correct_answer: guard.session.standard_solution.clone(),
                    error_type: crate::fsm::acted_error_type(&analysis),
                    tags: analysis.missing_concepts.clone(),
                })
                .await;
        }

        // Step 9: compose the tutor prompt for the new state.
        let context = self.build_prompt_context(&guard, &rag_documents, &input.text, coverage, None);
        let (system, user) = self.composer.build_full_prompt(new_state, &context);

        // Step 10: generate tutor text.
        let generation = self.llm.generate(GenerationRequest::new(user).with_system(system), cancel).await;
        let (text, degraded) = match generation {
            Ok(response) => (response.text, response.is_degraded()),
            Err(tutor_llm::LlmError::ModelMissing(model)) => return Err(DialogError::ModelMissing(model)),
            Err(error) => {
                warn!(%error, "tutor generation failed outright");
                (self.config.llm.fallback_text.clone(), true)
            }
        };

        // Step 11: classify response type from the new state.
        let response_type = ResponseType::from_fsm_state(new_state);

        // Step 12: record the tutor turn and return.
        let _ = guard.session.record_turn(Speaker::Tutor, text.clone(), new_state);
        if let Some(turn) = guard.session.turns.last().cloned() {
            self.store.persist_turn(&input.session_id, &turn).await;
        }

        let related_concepts = union_concepts(&analysis.covered_concepts, &analysis.missing_concepts);
        let suggested_next_step = suggest_next_step(new_state, &analysis);

        Ok(TutorResponse {
            text,
            response_type,
            hint_level: None,
            related_concepts,
            suggested_next_step,
            fsm_state: new_state,
            degraded,
        })
    }

    /// `handle_silence`: feeds SILENCE_DETECTED into the FSM. Only produces a
    /// response when the resulting state is HINTING.
    ///
    /// A silence event that crosses the threshold is recorded as an ordinary
    /// student turn, tagged with [`SILENCE_MARKER`] so the Metrics
    /// Aggregator can exclude it from the WPM word count without that turn
    /// polluting speaking rate.
    #[instrument(skip(self))]
    pub async fn handle_silence(
        &self,
        session_id: &SessionId,
        duration_seconds: f64,
    ) -> Result<Option<TutorResponse>, DialogError> {
        let Some(handle) = self.store.get(session_id).await else {
            return Ok(None);
        };
        let cancel = self.store.cancellation_token(session_id).await.unwrap_or_default();
        let mut guard = handle.lock().await;
        if guard.session.is_terminal() {
            return Ok(None);
        }

        let state_before = guard.fsm.state();
        let new_state = guard.fsm.apply(FsmEvent::SilenceDetected { duration_seconds });
        if new_state != FsmState::Hinting {
            return Ok(None);
        }

        let _ = guard.session.record_turn(Speaker::Student, SILENCE_MARKER, state_before);
        if let Some(turn) = guard.session.turns.last().cloned() {
            self.store.persist_turn(session_id, &turn).await;
        }

        self.run_hint_turn(session_id, &mut guard, SILENCE_MARKER, cancel).await.map(Some)
    }

    /// `end_session`: fires SESSION_END, marks the session terminal, computes
    /// and persists a [`crate::metrics::MetricsReport`], and returns a summary.
    ///
    /// If a turn for this session is
    /// in-flight, its cancellation token is signaled first so a pending LLM
    /// generation can abort rather than run to completion or timeout.
    /// `end_session` still blocks on the same per-session lock the turn
    /// holds, so the turn always finishes (best-effort) before this
    /// proceeds — cancellation only shortens how long that takes.
    #[instrument(skip(self))]
    pub async fn end_session(&self, session_id: &SessionId) -> Result<SessionSummary, DialogError> {
        let handle = self
            .store
            .get(session_id)
            .await
            .ok_or_else(|| DialogError::SessionNotFound(session_id.clone()))?;
        self.store.cancel(session_id).await;

        let (summary, report) = {
            let mut guard = handle.lock().await;
            guard.fsm.apply(FsmEvent::SessionEnd);
            guard.session.mark_ended();

            // Audio-aware path: prefer accumulated spoken word counts over
            // the text-derived fallback whenever at least one student turn
            // carried AudioFeatures.
            let audio_word_count = (guard.session.audio_totals.turns_with_audio > 0)
                .then_some(guard.session.audio_totals.word_count);
            let report = self.metrics.compute_with_totals(
                &guard.session,
                &guard.hints,
                audio_word_count,
                guard.session.audio_totals.pause_duration_seconds,
                0.0,
            );
            let summary = SessionSummary {
                session_id: guard.session.id.0.clone(),
                duration_seconds: guard.session.duration_seconds(),
                concepts_covered: guard.session.concepts.covered().iter().cloned().collect(),
                concept_coverage: guard.session.concepts.coverage_ratio(),
                hints_used: guard.hints.log().iter().map(HintUsage::from).collect(),
                total_turns: guard.session.turns.len() as u32,
                final_state: guard.fsm.state(),
            };
            (summary, report)
        };

        self.store
            .persist_end(session_id, &format!("{:?}", summary.final_state), summary.concept_coverage)
            .await;
        self.store.persist_metrics(&report).await;
        self.store.remove(session_id).await;

        info!(%session_id, coverage = summary.concept_coverage, "session ended");
        Ok(summary)
    }

    async fn retrieve(&self, session: &Session, query_text: &str) -> Vec<tutor_memory::RetrievedDocument> {
        let context = RetrievalContext::new(self.config.retrieval.max_results, self.config.retrieval.min_similarity)
            .with_question_id(session.question_id.0.clone())
            .with_knowledge_nodes(session.concepts.required().iter().cloned());

        match self.retrieval.retrieve(query_text, &context).await {
            Ok(result) => result.documents,
            Err(error) => {
                warn!(%error, "retrieval unavailable; continuing with no reference material");
                Vec::new()
            }
        }
    }

    fn build_prompt_context(
        &self,
        guard: &SessionState,
        rag_documents: &[tutor_memory::RetrievedDocument],
        student_input: &str,
        coverage: f64,
        hint_level: Option<tutor_prompt::HintLevel>,
    ) -> PromptContext {
        PromptContext {
            question_content: guard.session.question_text.clone(),
            student_input: student_input.to_string(),
            conversation_history: guard
                .session
                .turns
                .iter()
                .map(|turn| HistoryTurn {
                    speaker: match turn.speaker {
                        Speaker::Student => tutor_prompt::Speaker::Student,
                        Speaker::Tutor => tutor_prompt::Speaker::Tutor,
                    },
                    content: turn.content.clone(),
                })
                .collect(),
            rag_documents: rag_documents.to_vec(),
            current_concept: guard.session.concepts.current_focus().map(String::from),
            hint_level,
            concept_coverage: coverage,
        }
    }

    /// Shared tail of `handle_hint_request` / the silence path. The FSM is
    /// assumed already in HINTING when this is called. Retrieves, asks the
    /// Hint Controller for the next level,
    /// composes a HINTING prompt, generates, returns the FSM to LISTENING via
    /// a synthetic ANALYSIS_RESULT, records one tutor turn, and returns it.
    async fn run_hint_turn(
        &self,
        session_id: &SessionId,
        guard: &mut SessionState,
        retrieval_query: &str,
        cancel: CancellationToken,
    ) -> Result<TutorResponse, DialogError> {
        let concept = guard
            .session
            .concepts
            .current_focus()
            .map(String::from)
            .unwrap_or_else(|| guard.session.question_id.0.clone());

        let rag_documents = if cancel.is_cancelled() {
            Vec::new()
        } else {
            self.retrieve(&guard.session, retrieval_query).await
        };

        let level = match guard.hints.request_hint(&concept).await {
            Ok(level) => level,
            Err(error) => {
                warn!(%error, "hint record persistence failed; continuing with in-memory level");
                guard.hints.current_level(&concept)
            }
        };
        let hint_level = hint_level_from_u8(level);

        let context = self.build_prompt_context(guard, &rag_documents, retrieval_query, guard.session.concepts.coverage_ratio(), hint_level);
        let (system, user) = self.composer.build_full_prompt(FsmState::Hinting, &context);

        let generation = self.llm.generate(GenerationRequest::new(user).with_system(system), cancel).await;
        let (text, degraded) = match generation {
            Ok(response) => (response.text, response.is_degraded()),
            Err(tutor_llm::LlmError::ModelMissing(model)) => return Err(DialogError::ModelMissing(model)),
            Err(error) => {
                warn!(%error, "hint generation failed outright");
                (self.config.llm.fallback_text.clone(), true)
            }
        };

        // Synthetic ANALYSIS_RESULT returning HINTING -> LISTENING; no real
        // analysis ran for this turn.
        let final_state = guard.fsm.apply(FsmEvent::AnalysisResult(AnalysisOutcome::continue_listening()));

        let _ = guard.session.record_turn(Speaker::Tutor, text.clone(), final_state);
        if let Some(turn) = guard.session.turns.last().cloned() {
            self.store.persist_turn(session_id, &turn).await;
        }

        Ok(TutorResponse {
            text,
            response_type: ResponseType::Hint,
            hint_level: Some(level),
            related_concepts: vec![concept],
            suggested_next_step: None,
            fsm_state: final_state,
            degraded,
        })
    }
}

fn hint_level_from_u8(level: u8) -> Option<tutor_prompt::HintLevel> {
    match level {
        1 => Some(tutor_prompt::HintLevel::Level1),
        2 => Some(tutor_prompt::HintLevel::Level2),
        3 => Some(tutor_prompt::HintLevel::Level3),
        _ => None,
    }
}

fn union_concepts(a: &[String], b: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for concept in a.iter().chain(b.iter()) {
        if seen.insert(concept.clone()) {
            out.push(concept.clone());
        }
    }
    out
}

fn suggest_next_step(state: FsmState, analysis: &AnalysisResult) -> Option<String> {
    match state {
        FsmState::Consolidating => Some(
            "Try a related practice question to reinforce what you just covered.".to_string(),
        ),
        FsmState::Probing | FsmState::Repair => analysis
            .missing_concepts
            .first()
            .map(|concept| format!("Revisit {concept} before moving on.")),
        _ => None,
    }
}

fn acknowledge_error(text: &str) -> TutorResponse {
    TutorResponse {
        text: text.to_string(),
        response_type: ResponseType::Acknowledge,
        hint_level: None,
        related_concepts: Vec::new(),
        suggested_next_step: None,
        fsm_state: FsmState::Idle,
        degraded: false,
    }
}
