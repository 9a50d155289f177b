//! Public Surface: [`TutoringService`] wires the ports and the Dialog Engine
//! together and exposes the seven verbs a caller drives a session through.

use std::path::Path;
use std::sync::Arc;

use tracing::instrument;

use tutor_agent::{
    DialogEngine, DialogError, FsmState, KeywordHintClassifier, QuestionId, SessionId,
    SessionSummary, StartResult, StudentId, StudentInput, TutorResponse,
};
use tutor_config::TutoringConfig;
use tutor_llm::OllamaLlmPort;
use tutor_memory::{InMemoryRetrievalPort, JsonlSessionStore, RetrievalPort};

/// Owns the wired-up [`DialogEngine`] and exposes it as the small set of
/// verbs an outer caller (a CLI, a server handler) needs: `start`, `input`,
/// `silence`, `end`, `get_state`, `list_active`, `cleanup`.
pub struct TutoringService {
    engine: DialogEngine,
}

impl TutoringService {
    /// Build the service from config alone, using [`InMemoryRetrievalPort`]
    /// and [`OllamaLlmPort`] — the production port pair — with no durable
    /// session log.
    pub fn new(config: TutoringConfig) -> Self {
        let llm = Arc::new(OllamaLlmPort::new(config.llm.clone()));
        let retrieval: Arc<dyn RetrievalPort> = Arc::new(InMemoryRetrievalPort::new());
        let classifier = Arc::new(KeywordHintClassifier::from_config(&config.hint));
        Self {
            engine: DialogEngine::new(config, retrieval, llm, classifier),
        }
    }

    /// Attach an append-only JSONL session log at `path` for write-through
    /// durability. Must be called before any session exists.
    pub fn with_session_log(mut self, path: impl AsRef<Path>) -> Self {
        let durable = Arc::new(JsonlSessionStore::new(path.as_ref().to_path_buf()));
        self.engine = self.engine.with_durable(durable);
        self
    }

    /// Attach an append-only JSONL error book at `path`.
    pub fn with_error_book(mut self, path: impl AsRef<Path>) -> Self {
        let sink = Arc::new(tutor_tools::JsonlErrorBookPort::new(path.as_ref().to_path_buf()));
        self.engine = self.engine.with_error_book(sink);
        self
    }

    #[instrument(skip(self, question_text, standard_solution))]
    pub async fn start(
        &self,
        question_id: QuestionId,
        student_id: StudentId,
        question_text: String,
        standard_solution: String,
        required_concepts: Vec<String>,
    ) -> StartResult {
        self.engine
            .start_session(question_id, student_id, question_text, standard_solution, required_concepts)
            .await
    }

    #[instrument(skip(self, input))]
    pub async fn input(&self, input: StudentInput) -> Result<TutorResponse, DialogError> {
        self.engine.process_student_input(input).await
    }

    #[instrument(skip(self))]
    pub async fn silence(
        &self,
        session_id: &SessionId,
        duration_seconds: f64,
    ) -> Result<Option<TutorResponse>, DialogError> {
        self.engine.handle_silence(session_id, duration_seconds).await
    }

    #[instrument(skip(self))]
    pub async fn end(&self, session_id: &SessionId) -> Result<SessionSummary, DialogError> {
        self.engine.end_session(session_id).await
    }

    pub async fn get_state(&self, session_id: &SessionId) -> Option<FsmState> {
        self.engine.get_state(session_id).await
    }

    pub async fn list_active(&self) -> Vec<SessionId> {
        self.engine.list_active().await
    }

    pub async fn cleanup(&self) -> usize {
        self.engine.cleanup().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn a_session_can_be_started_and_ended_end_to_end() {
        let service = TutoringService::new(TutoringConfig::default());
        let start = service
            .start(
                QuestionId("q1".into()),
                StudentId("s1".into()),
                "Solve 3x+5=20".into(),
                "x=5".into(),
                vec!["linear_eq".into()],
            )
            .await;
        assert_eq!(start.fsm_state, FsmState::Listening);
        assert_eq!(service.list_active().await, vec![start.session_id.clone()]);

        let summary = service.end(&start.session_id).await.unwrap();
        assert_eq!(summary.final_state, FsmState::Idle);
    }
}
