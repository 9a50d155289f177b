//! Hint Controller: a per-session, per-concept monotonic ladder plus the
//! hint-dependency scoring formula.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tutor_config::HintConfig;
use tutor_memory::{SessionStoreError, SessionStorePort};

use crate::session::SessionId;

pub const MAX_LEVEL: u8 = 3;

/// One hint dispensed to a student, kept in the session's hint log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HintRecord {
    pub session_id: SessionId,
    pub level: u8,
    pub concept: String,
    pub timestamp: DateTime<Utc>,
}

/// Per-session ladder controller. One instance is owned per
/// [`crate::session::Session`]; it is never shared across sessions.
pub struct HintController {
    session_id: SessionId,
    weights: HashMap<String, f64>,
    levels_by_concept: HashMap<String, u8>,
    log: Vec<HintRecord>,
    sink: Option<Arc<dyn SessionStorePort<HintRecord>>>,
}

impl HintController {
    pub fn new(session_id: SessionId, config: &HintConfig) -> Self {
        Self {
            session_id,
            weights: config.weights.clone(),
            levels_by_concept: HashMap::new(),
            log: Vec::new(),
            sink: None,
        }
    }

    /// Attach a durable write-through sink: every request is persisted
    /// immediately when a storage handle is set; otherwise the log stays
    /// in-memory only.
    pub fn with_sink(mut self, sink: Arc<dyn SessionStorePort<HintRecord>>) -> Self {
        self.sink = Some(sink);
        self
    }

    fn weight_for(&self, level: u8) -> f64 {
        self.weights.get(&level.to_string()).copied().unwrap_or(1.0)
    }

    /// Returns the *current* level for `concept` before recording and
    /// advancing it. Defaults a never-seen concept to level 1.
    pub fn current_level(&self, concept: &str) -> u8 {
        self.levels_by_concept.get(concept).copied().unwrap_or(1)
    }

    /// Request the next hint for `concept`: returns the level just used,
    /// appends a [`HintRecord`], then saturating-advances the ladder toward
    /// [`MAX_LEVEL`].
    pub async fn request_hint(&mut self, concept: &str) -> Result<u8, SessionStoreError> {
        let level = self.current_level(concept);
        let record = HintRecord {
            session_id: self.session_id.clone(),
            level,
            concept: concept.to_string(),
            timestamp: Utc::now(),
        };

        if let Some(sink) = &self.sink {
            sink.append(&record).await?;
        }
        self.log.push(record);

        let next = (level + 1).min(MAX_LEVEL);
        self.levels_by_concept.insert(concept.to_string(), next);
        Ok(level)
    }

    /// Restart the ladder for `new_concept` at level 1 without clearing the
    /// session's hint history.
    pub fn reset_for_concept(&mut self, new_concept: &str) {
        self.levels_by_concept.insert(new_concept.to_string(), 1);
    }

    pub fn log(&self) -> &[HintRecord] {
        &self.log
    }

    pub fn total_hint_count(&self) -> usize {
        self.log.len()
    }

    /// Histogram of hints dispensed per level.
    pub fn hints_by_level(&self) -> HashMap<u8, usize> {
        let mut histogram = HashMap::new();
        for record in &self.log {
            *histogram.entry(record.level).or_insert(0) += 1;
        }
        histogram
    }

    /// `clamp(1 - sum(weight of hints used) / total_turns, 0, 1)`. A
    /// zero-turn or hint-free session is fully independent (score 1.0).
    pub fn dependency_score(&self, total_turns: u32) -> f64 {
        if total_turns == 0 || self.log.is_empty() {
            return 1.0;
        }
        let used: f64 = self.log.iter().map(|h| self.weight_for(h.level)).sum();
        (1.0 - used / total_turns as f64).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tutor_memory::InMemorySessionStore;

    fn config() -> HintConfig {
        HintConfig::default()
    }

    #[tokio::test]
    async fn ladder_advances_and_saturates_at_three() {
        let mut hints = HintController::new(SessionId::new(), &config());
        let levels = [
            hints.request_hint("linear_eq").await.unwrap(),
            hints.request_hint("linear_eq").await.unwrap(),
            hints.request_hint("linear_eq").await.unwrap(),
            hints.request_hint("linear_eq").await.unwrap(),
        ];
        assert_eq!(levels, [1, 2, 3, 3]);
    }

    #[tokio::test]
    async fn reset_for_concept_restarts_without_clearing_history() {
        let mut hints = HintController::new(SessionId::new(), &config());
        hints.request_hint("a").await.unwrap();
        hints.request_hint("a").await.unwrap();
        hints.reset_for_concept("b");
        assert_eq!(hints.current_level("b"), 1);
        assert_eq!(hints.total_hint_count(), 2);
    }

    #[tokio::test]
    async fn dependency_score_matches_scenario_4() {
        let mut hints = HintController::new(SessionId::new(), &config());
        for _ in 0..4 {
            hints.request_hint("linear_eq").await.unwrap();
        }
        let score = hints.dependency_score(4);
        assert!((score - 0.325).abs() < 1e-9);
    }

    #[tokio::test]
    async fn no_hints_used_is_fully_independent() {
        let hints = HintController::new(SessionId::new(), &config());
        assert_eq!(hints.dependency_score(10), 1.0);
        assert_eq!(hints.dependency_score(0), 1.0);
    }

    #[tokio::test]
    async fn write_through_sink_receives_every_request() {
        let sink = Arc::new(InMemorySessionStore::<HintRecord>::new());
        let mut hints = HintController::new(SessionId::new(), &config()).with_sink(sink.clone());
        hints.request_hint("a").await.unwrap();
        hints.request_hint("a").await.unwrap();
        assert_eq!(sink.load_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn histogram_counts_by_level() {
        let mut hints = HintController::new(SessionId::new(), &config());
        hints.request_hint("a").await.unwrap(); // level 1
        hints.request_hint("a").await.unwrap(); // level 2
        let histogram = hints.hints_by_level();
        assert_eq!(histogram.get(&1), Some(&1));
        assert_eq!(histogram.get(&2), Some(&1));
    }
}
