//! Metrics Aggregator: derives one [`MetricsReport`] per terminated session
//! from its recorded turns and hint log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::hint::HintController;
use crate::session::{Session, Speaker, SILENCE_MARKER};

/// One report per terminated session, uniquely identified and linked back to
/// it. All five numeric fields are bounded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsReport {
    pub id: Uuid,
    pub session_id: String,
    pub words_per_minute: f64,
    pub pause_ratio: f64,
    pub hint_dependency: f64,
    pub concept_coverage: f64,
    pub focus_duration_seconds: f64,
    pub computed_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct MetricsAggregator;

impl MetricsAggregator {
    pub fn new() -> Self {
        Self
    }

    /// Compute a fresh report. Deterministic given the same session state and
    /// `focus_duration_seconds` (externally supplied, e.g. by an attention
    /// monitor — out of scope here, defaults to 0).
    pub fn compute(
        &self,
        session: &Session,
        hints: &HintController,
        focus_duration_seconds: f64,
    ) -> MetricsReport {
        let (word_count, pause_seconds) = student_speech_totals(session);
        let duration_minutes = session.duration_seconds() / 60.0;

        let words_per_minute = if duration_minutes > 0.0 {
            word_count as f64 / duration_minutes
        } else {
            0.0
        };

        let total_duration_seconds = session.duration_seconds();
        let pause_ratio = if total_duration_seconds > 0.0 {
            (pause_seconds / total_duration_seconds).clamp(0.0, 1.0)
        } else {
            0.0
        };

        let total_turns = session.turns.len() as u32;

        MetricsReport {
            id: Uuid::new_v4(),
            session_id: session.id.0.clone(),
            words_per_minute,
            pause_ratio,
            hint_dependency: hints.dependency_score(total_turns),
            concept_coverage: session.concepts.coverage_ratio(),
            focus_duration_seconds,
            computed_at: Utc::now(),
        }
    }
}

/// Text-derived word count fallback, used when no student turn in the
/// session carried [`crate::session::AudioFeatures`] — a neutral-but-not-zero
/// estimate from the transcript itself rather than 0. The synthetic
/// `SILENCE_MARKER` turn `handle_silence` appends is excluded so silence can
/// never inflate spoken word count.
fn student_speech_totals(session: &Session) -> (u32, f64) {
    let word_count = session
        .turns
        .iter()
        .filter(|t| t.speaker == Speaker::Student && t.content != SILENCE_MARKER)
        .map(|t| t.content.split_whitespace().count() as u32)
        .sum();
    (word_count, 0.0)
}

impl MetricsAggregator {
    /// Variant taking explicit accumulated audio totals (word count and pause
    /// seconds), used by [`DialogEngine::end_session`](crate::dialog::DialogEngine::end_session)
    /// once it has summed [`crate::session::AudioFeatures`] across the
    /// session's student turns. Falls back to the text-derived word count
    /// when `audio_word_count` is `None` (no turn carried audio).
    pub fn compute_with_totals(
        &self,
        session: &Session,
        hints: &HintController,
        audio_word_count: Option<u32>,
        audio_pause_seconds: f64,
        focus_duration_seconds: f64,
    ) -> MetricsReport {
        let mut report = self.compute(session, hints, focus_duration_seconds);
        let duration_minutes = session.duration_seconds() / 60.0;

        if let Some(word_count) = audio_word_count {
            report.words_per_minute = if duration_minutes > 0.0 {
                word_count as f64 / duration_minutes
            } else {
                0.0
            };
        }

        let total_duration_seconds = session.duration_seconds();
        report.pause_ratio = if total_duration_seconds > 0.0 {
            (audio_pause_seconds / total_duration_seconds).clamp(0.0, 1.0)
        } else {
            0.0
        };

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::FsmState;
    use crate::session::{QuestionId, StudentId};
    use tutor_config::HintConfig;

    fn new_session() -> Session {
        Session::new(
            StudentId("s1".into()),
            QuestionId("q1".into()),
            "3x+5=20".into(),
            "x=5".into(),
            vec!["linear_eq".into()],
        )
    }

    #[test]
    fn wpm_is_zero_when_duration_is_not_positive() {
        let session = new_session(); // ended instantly, duration ~0
        let hints = HintController::new(session.id.clone(), &HintConfig::default());
        let report = MetricsAggregator::new().compute(&session, &hints, 0.0);
        assert_eq!(report.words_per_minute, 0.0);
    }

    #[test]
    fn concept_coverage_is_one_for_empty_required_set() {
        let session = Session::new(
            StudentId("s1".into()),
            QuestionId("q1".into()),
            "q".into(),
            "sol".into(),
            vec![],
        );
        let hints = HintController::new(session.id.clone(), &HintConfig::default());
        let report = MetricsAggregator::new().compute(&session, &hints, 0.0);
        assert_eq!(report.concept_coverage, 1.0);
    }

    #[test]
    fn concept_coverage_reflects_required_intersection() {
        let mut session = new_session();
        session.concepts.merge(["linear_eq".to_string()]);
        let hints = HintController::new(session.id.clone(), &HintConfig::default());
        let report = MetricsAggregator::new().compute(&session, &hints, 0.0);
        assert_eq!(report.concept_coverage, 1.0);
    }

    #[test]
    fn pause_ratio_is_always_bounded() {
        let mut session = new_session();
        session.record_turn(Speaker::Student, "hi", FsmState::Listening).unwrap();
        let hints = HintController::new(session.id.clone(), &HintConfig::default());
        let report = MetricsAggregator::new().compute_with_totals(&session, &hints, Some(5), 999_999.0, 0.0);
        assert!((0.0..=1.0).contains(&report.pause_ratio));
    }

    #[test]
    fn silence_marker_turn_does_not_count_toward_spoken_words() {
        let mut session = new_session();
        session
            .record_turn(Speaker::Student, "three x equals fifteen", FsmState::Listening)
            .unwrap();
        session
            .record_turn(Speaker::Student, crate::session::SILENCE_MARKER, FsmState::Listening)
            .unwrap();
        let (word_count, _) = student_speech_totals(&session);
        assert_eq!(word_count, 4); // only the real turn's four words
    }

    #[test]
    fn persisting_and_rereading_a_report_preserves_its_numeric_fields() {
        let mut session = new_session();
        session.record_turn(Speaker::Student, "three x equals fifteen", FsmState::Listening).unwrap();
        let hints = HintController::new(session.id.clone(), &HintConfig::default());
        let report = MetricsAggregator::new().compute(&session, &hints, 42.5);

        let serialized = serde_json::to_string(&report).unwrap();
        let reread: MetricsReport = serde_json::from_str(&serialized).unwrap();

        assert!((report.words_per_minute - reread.words_per_minute).abs() < 1e-4);
        assert!((report.pause_ratio - reread.pause_ratio).abs() < 1e-4);
        assert!((report.hint_dependency - reread.hint_dependency).abs() < 1e-4);
        assert!((report.concept_coverage - reread.concept_coverage).abs() < 1e-4);
        assert!((report.focus_duration_seconds - reread.focus_duration_seconds).abs() < 1e-4);
    }

    #[test]
    fn recomputation_is_deterministic_given_same_inputs() {
        let mut session = new_session();
        session.record_turn(Speaker::Student, "three x equals fifteen", FsmState::Listening).unwrap();
        let hints = HintController::new(session.id.clone(), &HintConfig::default());
        let a = MetricsAggregator::new().compute(&session, &hints, 12.0);
        let b = MetricsAggregator::new().compute(&session, &hints, 12.0);
        assert_eq!(a.concept_coverage, b.concept_coverage);
        assert_eq!(a.hint_dependency, b.hint_dependency);
        assert_eq!(a.pause_ratio, b.pause_ratio);
    }
}
