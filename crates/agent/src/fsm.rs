//! Dialog FSM: a pure function of (current state, event) -> new state, plus
//! an append-only audit trail of accepted transitions.
//!
//! The controller owns no session data — it is instantiated once per
//! [`crate::session::Session`] and carries only its configuration, current
//! state, and history.

use chrono::{DateTime, Utc};

use tutor_config::FsmConfig;
pub use tutor_prompt::DialogState as FsmState;

use crate::session::{AnalysisResult, ErrorType};

/// Closed event set the FSM accepts. Unlisted (state, event) pairs are
/// no-ops — the controller never fails.
#[derive(Debug, Clone)]
pub enum FsmEvent {
    SessionStart,
    SessionEnd,
    StudentInput,
    SilenceDetected { duration_seconds: f64 },
    HintRequest,
    AnalysisResult(AnalysisOutcome),
}

/// The subset of an [`AnalysisResult`] the FSM's priority rules need, plus
/// the coverage ratio computed alongside it.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnalysisOutcome {
    pub logic_complete: bool,
    pub logic_gap: bool,
    pub logic_error: bool,
    pub coverage: f64,
    /// Set only by [`Self::continue_listening`]. Threaded through to the
    /// [`TransitionRecord`] the resulting ANALYSIS_RESULT transition
    /// produces.
    pub synthetic: bool,
}

impl AnalysisOutcome {
    pub fn from_analysis(analysis: &AnalysisResult, coverage: f64) -> Self {
        Self {
            logic_complete: analysis.logic_complete,
            logic_gap: analysis.logic_gap,
            logic_error: analysis.logic_error,
            coverage,
            synthetic: false,
        }
    }

    /// A synthetic outcome used by `handle_hint_request`/`handle_silence` to
    /// return the FSM to LISTENING without a real analysis call — modeled as
    /// a distinct, explicitly synthetic variant rather than a fabricated
    /// AnalysisResult.
    pub fn continue_listening() -> Self {
        Self {
            synthetic: true,
            ..Self::default()
        }
    }
}

/// One accepted transition, kept for observability.
#[derive(Debug, Clone)]
pub struct TransitionRecord {
    pub from: FsmState,
    pub to: FsmState,
    pub event: FsmEventKind,
    pub timestamp: DateTime<Utc>,
    /// True when this transition was driven by a synthetic ANALYSIS_RESULT
    /// injected by `handle_hint_request`/`handle_silence` rather than a real
    /// analysis call.
    pub synthetic: bool,
}

/// Event discriminant without payloads, for audit records and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsmEventKind {
    SessionStart,
    SessionEnd,
    StudentInput,
    SilenceDetected,
    HintRequest,
    AnalysisResult,
}

impl FsmEvent {
    fn kind(&self) -> FsmEventKind {
        match self {
            FsmEvent::SessionStart => FsmEventKind::SessionStart,
            FsmEvent::SessionEnd => FsmEventKind::SessionEnd,
            FsmEvent::StudentInput => FsmEventKind::StudentInput,
            FsmEvent::SilenceDetected { .. } => FsmEventKind::SilenceDetected,
            FsmEvent::HintRequest => FsmEventKind::HintRequest,
            FsmEvent::AnalysisResult(_) => FsmEventKind::AnalysisResult,
        }
    }
}

/// Event-driven controller applying the fixed priority-ordered transition
/// table. One instance per session.
pub struct FsmController {
    state: FsmState,
    config: FsmConfig,
    history: Vec<TransitionRecord>,
}

impl FsmController {
    pub fn new(config: FsmConfig) -> Self {
        Self {
            state: FsmState::Idle,
            config,
            history: Vec::new(),
        }
    }

    pub fn state(&self) -> FsmState {
        self.state
    }

    pub fn history(&self) -> &[TransitionRecord] {
        &self.history
    }

    /// Apply `event`. Returns the (possibly unchanged) resulting state.
    /// An audit record is only appended when a rule actually fired.
    pub fn apply(&mut self, event: FsmEvent) -> FsmState {
        let kind = event.kind();
        let synthetic = matches!(&event, FsmEvent::AnalysisResult(outcome) if outcome.synthetic);
        if let Some(next) = self.next_state(&event) {
            tracing::debug!(from = ?self.state, to = ?next, event = ?kind, synthetic, "fsm transition");
            self.history.push(TransitionRecord {
                from: self.state,
                to: next,
                event: kind,
                timestamp: Utc::now(),
                synthetic,
            });
            self.state = next;
        }
        self.state
    }

    /// First-matching-rule-wins transition table. `None` means "no-op".
    fn next_state(&self, event: &FsmEvent) -> Option<FsmState> {
        use FsmState::*;

        // SESSION_END fires from any state (matches first, wins regardless
        // of current state).
        if matches!(event, FsmEvent::SessionEnd) {
            return Some(Idle);
        }

        match (self.state, event) {
            (Idle, FsmEvent::SessionStart) => Some(Listening),

            (Listening, FsmEvent::StudentInput) => Some(Analyzing),
            (Listening, FsmEvent::SilenceDetected { duration_seconds })
                if *duration_seconds >= self.config.silence_threshold_seconds =>
            {
                Some(Hinting)
            }
            // HINT_REQUEST is accepted from both LISTENING and ANALYZING.
            (Listening, FsmEvent::HintRequest) => Some(Hinting),
            (Analyzing, FsmEvent::HintRequest) => Some(Hinting),

            (Analyzing, FsmEvent::AnalysisResult(outcome)) => {
                Some(self.resolve_analysis(*outcome))
            }

            (Probing, FsmEvent::AnalysisResult(_))
            | (Hinting, FsmEvent::AnalysisResult(_))
            | (Repair, FsmEvent::AnalysisResult(_)) => Some(Listening),

            (Consolidating, FsmEvent::AnalysisResult(_)) => Some(Idle),

            _ => None,
        }
    }

    /// Strict priority: logic_error > logic_gap > coverage_met > default.
    fn resolve_analysis(&self, outcome: AnalysisOutcome) -> FsmState {
        if outcome.logic_error {
            FsmState::Repair
        } else if outcome.logic_gap {
            FsmState::Probing
        } else if outcome.coverage >= self.config.coverage_threshold {
            FsmState::Consolidating
        } else {
            FsmState::Listening
        }
    }
}

/// Priority used when deciding which of the analysis's flags to act on: at
/// most one of `logic_gap`/`logic_error` is acted upon, with `logic_error`
/// taking priority.
pub fn acted_error_type(result: &AnalysisResult) -> Option<ErrorType> {
    if result.logic_error { result.error_type } else { None }
}
