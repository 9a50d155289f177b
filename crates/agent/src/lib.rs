//! Tutoring Core: Dialog FSM, Hint Controller, Session Store and the Dialog
//! Engine pipeline that binds them to the Retrieval and LLM ports.

pub mod classifier;
pub mod dialog;
pub mod error_book;
pub mod fsm;
pub mod hint;
pub mod metrics;
pub mod session;
pub mod store;

pub use classifier::{HintRequestClassifier, KeywordHintClassifier};
pub use dialog::{DialogEngine, DialogError, HintUsage, SessionSummary, StartResult, StudentInput, TutorResponse};
pub use error_book::{ErrorBookPort, ErrorBookRecord, NoopErrorBookPort};
pub use fsm::{AnalysisOutcome, FsmController, FsmEvent, FsmEventKind, FsmState, TransitionRecord};
pub use hint::{HintController, HintRecord};
pub use metrics::{MetricsAggregator, MetricsReport};
pub use session::{
    AnalysisResult, AudioFeatures, AudioTotals, ConceptTracker, ErrorType, QuestionId, ResponseType,
    Session, SessionId, SessionTerminalError, Speaker, StudentId, Turn, SILENCE_MARKER,
};
pub use store::{SessionRow, SessionState, SessionStore};
