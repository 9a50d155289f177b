//! Data model: Session, Turn, AudioFeatures, AnalysisResult and the identifier
//! newtypes.
//!
//! A Session is an arena: it owns its Turn vector directly rather than
//! children holding a back-reference to it. Its hint log lives alongside it
//! in `crate::store::SessionState`, owned by the `HintController`.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::fsm::FsmState;

/// Content marker for the synthetic student turn `handle_silence` appends
/// when silence crosses the FSM's threshold. Recorded as an ordinary student
/// turn so it still shows up in the transcript; this marker lets the Metrics
/// Aggregator exclude it from the WPM word count without tracking a separate
/// "is synthetic" flag per turn.
pub const SILENCE_MARKER: &str = "(silence)";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StudentId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QuestionId(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Speaker {
    Student,
    Tutor,
}

/// Tutor response classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    Probe,
    Hint,
    Repair,
    Consolidate,
    Acknowledge,
}

impl ResponseType {
    /// Step 11 of the per-turn pipeline: classify response type from the
    /// *new* FSM state.
    pub fn from_fsm_state(state: FsmState) -> Self {
        match state {
            FsmState::Probing => ResponseType::Probe,
            FsmState::Hinting => ResponseType::Hint,
            FsmState::Repair => ResponseType::Repair,
            FsmState::Consolidating => ResponseType::Consolidate,
            _ => ResponseType::Acknowledge,
        }
    }
}

/// One entry in a Session's ordered conversation log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub turn_number: u32,
    pub speaker: Speaker,
    pub content: String,
    pub fsm_state: FsmState,
    pub timestamp: DateTime<Utc>,
}

/// Optional per-student-turn speech signal. Absent turns (typed input) fall
/// back to a neutral value wherever metrics depend on it.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AudioFeatures {
    pub spoken_duration_seconds: f64,
    pub word_count: u32,
    pub pause_count: u32,
    pub total_pause_duration_seconds: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorType {
    Calculation,
    Concept,
    Careless,
}

/// LLM-produced, JSON-shaped analysis of the student's latest turn.
/// Defaults are conservative so a partially-populated or malformed response
/// never crashes the pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct AnalysisResult {
    pub logic_complete: bool,
    pub logic_gap: bool,
    pub logic_error: bool,
    pub error_type: Option<ErrorType>,
    pub covered_concepts: Vec<String>,
    pub missing_concepts: Vec<String>,
    pub feedback: String,
}

impl AnalysisResult {
    /// Fallback used when analysis fails: logic_complete=false, no flags
    /// set, no concepts covered, original text kept as feedback.
    pub fn conservative_fallback(original_text: impl Into<String>) -> Self {
        Self {
            feedback: original_text.into(),
            ..Default::default()
        }
    }

    /// Best-effort JSON parse, tolerating extra prose around the JSON object
    /// (LLMs routinely wrap JSON in commentary) before giving up.
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        if let Ok(parsed) = serde_json::from_str::<Self>(raw) {
            return Ok(parsed);
        }
        if let (Some(start), Some(end)) = (raw.find('{'), raw.rfind('}')) {
            if end > start {
                return serde_json::from_str::<Self>(&raw[start..=end]);
            }
        }
        serde_json::from_str::<Self>(raw)
    }
}

/// A Session's required concepts, frozen at start, plus the set covered so
/// far. Kept distinct from the raw `Vec<String>` wire shape so coverage math
/// lives in one place.
#[derive(Debug, Clone, Default)]
pub struct ConceptTracker {
    required: HashSet<String>,
    /// First-occurrence order of the required concepts, used to pick a
    /// deterministic "current concept" focus for the hint ladder and prompt
    /// composer, which is initialized from the first required concept.
    order: Vec<String>,
    covered: HashSet<String>,
}

impl ConceptTracker {
    pub fn new(required: impl IntoIterator<Item = String>) -> Self {
        let mut order = Vec::new();
        let mut seen = HashSet::new();
        for concept in required {
            if seen.insert(concept.clone()) {
                order.push(concept);
            }
        }
        let required = seen;
        Self { required, order, covered: HashSet::new() }
    }

    pub fn required(&self) -> &HashSet<String> {
        &self.required
    }

    /// The first uncovered required concept, in declaration order; falls
    /// back to the first required concept once all are covered, or `None`
    /// when `required` is empty.
    pub fn current_focus(&self) -> Option<&str> {
        self.order
            .iter()
            .find(|c| !self.covered.contains(*c))
            .or_else(|| self.order.first())
            .map(|s| s.as_str())
    }

    pub fn covered(&self) -> &HashSet<String> {
        &self.covered
    }

    /// Merge newly covered concepts (step 7 of the pipeline). Only concepts
    /// known to the required set or explicitly reported are tracked; the
    /// invariant is `covered ⊆ required ∪ known-universe`, so anything the
    /// analyzer reports is accepted even if outside `required`.
    pub fn merge(&mut self, concepts: impl IntoIterator<Item = String>) {
        for concept in concepts {
            self.covered.insert(concept);
        }
    }

    /// `|covered ∩ required| / |required|`, or 1.0 if `required` is empty.
    pub fn coverage_ratio(&self) -> f64 {
        if self.required.is_empty() {
            return 1.0;
        }
        let hit = self.covered.intersection(&self.required).count();
        hit as f64 / self.required.len() as f64
    }
}

/// Running totals of [`AudioFeatures`] across a session's student turns, used
/// by the Metrics Aggregator's WPM/pause-rate computation. When absent,
/// metrics that depend on it fall back to a neutral value.
#[derive(Debug, Clone, Copy, Default)]
pub struct AudioTotals {
    pub word_count: u32,
    pub pause_duration_seconds: f64,
    pub turns_with_audio: u32,
}

impl AudioTotals {
    fn accumulate(&mut self, features: &AudioFeatures) {
        self.word_count += features.word_count;
        self.pause_duration_seconds += features.total_pause_duration_seconds;
        self.turns_with_audio += 1;
    }
}

/// The aggregate root. Owns its Turn vector directly; its hint log is owned
/// by the sibling [`crate::hint::HintController`] rather than duplicated
/// here (see `crate::store::SessionState`).
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub student_id: StudentId,
    pub question_id: QuestionId,
    pub question_text: String,
    pub standard_solution: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub concepts: ConceptTracker,
    pub turns: Vec<Turn>,
    pub audio_totals: AudioTotals,
    next_turn_number: u32,
}

impl Session {
    pub fn new(
        student_id: StudentId,
        question_id: QuestionId,
        question_text: String,
        standard_solution: String,
        required_concepts: Vec<String>,
    ) -> Self {
        Self {
            id: SessionId::new(),
            student_id,
            question_id,
            question_text,
            standard_solution,
            started_at: Utc::now(),
            ended_at: None,
            concepts: ConceptTracker::new(required_concepts),
            turns: Vec::new(),
            audio_totals: AudioTotals::default(),
            next_turn_number: 1,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.ended_at.is_some()
    }

    /// Appends a turn, rejecting the write once the session is terminal.
    pub fn record_turn(&mut self, speaker: Speaker, content: impl Into<String>, fsm_state: FsmState) -> Result<u32, SessionTerminalError> {
        if self.is_terminal() {
            return Err(SessionTerminalError);
        }
        let turn_number = self.next_turn_number;
        self.turns.push(Turn {
            turn_number,
            speaker,
            content: content.into(),
            fsm_state,
            timestamp: Utc::now(),
        });
        self.next_turn_number += 1;
        Ok(turn_number)
    }

    /// Folds a student turn's optional speech signal into the session's
    /// running totals. A no-op when the turn carried no [`AudioFeatures`]
    /// (typed input).
    pub fn accumulate_audio(&mut self, features: Option<&AudioFeatures>) {
        if let Some(features) = features {
            self.audio_totals.accumulate(features);
        }
    }

    pub fn mark_ended(&mut self) {
        self.ended_at = Some(Utc::now());
    }

    pub fn duration_seconds(&self) -> f64 {
        let end = self.ended_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds().max(0) as f64 / 1000.0
    }
}

#[derive(Debug, thiserror::Error)]
#[error("session is terminal; no further turns may be appended")]
pub struct SessionTerminalError;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coverage_ratio_is_one_when_required_is_empty() {
        let tracker = ConceptTracker::new(Vec::new());
        assert_eq!(tracker.coverage_ratio(), 1.0);
    }

    #[test]
    fn current_focus_is_first_uncovered_in_declaration_order() {
        let mut tracker = ConceptTracker::new(["a".to_string(), "b".to_string()]);
        assert_eq!(tracker.current_focus(), Some("a"));
        tracker.merge(["a".to_string()]);
        assert_eq!(tracker.current_focus(), Some("b"));
        tracker.merge(["b".to_string()]);
        assert_eq!(tracker.current_focus(), Some("a"));
    }

    #[test]
    fn coverage_ratio_counts_intersection_only() {
        let mut tracker = ConceptTracker::new(["a".to_string(), "b".to_string()]);
        tracker.merge(["a".to_string(), "c".to_string()]);
        assert_eq!(tracker.coverage_ratio(), 0.5);
    }

    #[test]
    fn turn_numbers_strictly_increase() {
        let mut session = Session::new(
            StudentId("s1".into()),
            QuestionId("q1".into()),
            "3x+5=20".into(),
            "x=5".into(),
            vec!["linear_eq".into()],
        );
        let n1 = session.record_turn(Speaker::Student, "hi", FsmState::Listening).unwrap();
        let n2 = session.record_turn(Speaker::Tutor, "hello", FsmState::Listening).unwrap();
        assert_eq!((n1, n2), (1, 2));
    }

    #[test]
    fn terminal_session_rejects_further_turns() {
        let mut session = Session::new(
            StudentId("s1".into()),
            QuestionId("q1".into()),
            "q".into(),
            "sol".into(),
            vec![],
        );
        session.mark_ended();
        assert!(session.record_turn(Speaker::Student, "too late", FsmState::Idle).is_err());
    }

    #[test]
    fn analysis_parse_tolerates_surrounding_prose() {
        let raw = "Sure, here is the analysis:\n{\"logic_complete\": true, \"covered_concepts\": [\"x\"]}\nHope that helps!";
        let parsed = AnalysisResult::parse(raw).unwrap();
        assert!(parsed.logic_complete);
        assert_eq!(parsed.covered_concepts, vec!["x".to_string()]);
    }

    #[test]
    fn accumulate_audio_sums_across_turns_and_ignores_absent_features() {
        let mut session = Session::new(
            StudentId("s1".into()),
            QuestionId("q1".into()),
            "q".into(),
            "sol".into(),
            vec![],
        );
        session.accumulate_audio(Some(&AudioFeatures {
            spoken_duration_seconds: 5.0,
            word_count: 10,
            pause_count: 1,
            total_pause_duration_seconds: 1.5,
        }));
        session.accumulate_audio(None);
        session.accumulate_audio(Some(&AudioFeatures {
            spoken_duration_seconds: 3.0,
            word_count: 4,
            pause_count: 0,
            total_pause_duration_seconds: 0.5,
        }));

        assert_eq!(session.audio_totals.word_count, 14);
        assert_eq!(session.audio_totals.turns_with_audio, 2);
        assert!((session.audio_totals.pause_duration_seconds - 2.0).abs() < 1e-9);
    }

    #[test]
    fn analysis_parse_failure_is_surfaced_for_fallback_construction() {
        assert!(AnalysisResult::parse("not json at all").is_err());
        let fallback = AnalysisResult::conservative_fallback("original text");
        assert!(!fallback.logic_complete);
        assert!(!fallback.logic_gap);
        assert!(!fallback.logic_error);
        assert_eq!(fallback.feedback, "original text");
    }
}
