//! Session Store: in-process map from session-id to Session, write-through
//! to durable storage at every state-changing point (start, each recorded
//! turn, end, metrics write).
//!
//! The full [`Session`]/[`FsmController`]/[`HintController`] triple is kept
//! here rather than in `tutor-memory` because the Session type is owned by
//! this crate; `tutor-memory::SessionStorePort` supplies only the durable
//! append-only sink this store writes through to (see DESIGN.md).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tutor_config::{FsmConfig, HintConfig};
use tutor_memory::{SessionStoreError, SessionStorePort};

use crate::fsm::FsmController;
use crate::hint::{HintController, HintRecord};
use crate::metrics::MetricsReport;
use crate::session::{Session, SessionId, Turn};

/// One session's mutable working set. Guarded by a per-session mutex so no
/// two turns of the same session can ever be in flight simultaneously.
pub struct SessionState {
    pub session: Session,
    pub fsm: FsmController,
    pub hints: HintController,
}

/// Tagged write-through row shape, durable log format for the Session Store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum SessionRow {
    Started {
        session_id: String,
        student_id: String,
        question_id: String,
        started_at: DateTime<Utc>,
    },
    TurnRecorded {
        session_id: String,
        turn: Turn,
    },
    Ended {
        session_id: String,
        ended_at: DateTime<Utc>,
        final_state: String,
        concept_coverage: f64,
    },
    MetricsWritten {
        report: MetricsReport,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum SessionStoreErrorKind {
    #[error("persistence failure: {0}")]
    Persistence(#[from] SessionStoreError),
}

/// Holds active sessions in memory and serializes per-session access.
///
/// Cancellation tokens are tracked in a map of their own, separate from the
/// per-session `Mutex`, so a caller can signal cancellation without first
/// waiting on the lock an in-flight turn may be holding.
pub struct SessionStore {
    sessions: RwLock<HashMap<SessionId, Arc<Mutex<SessionState>>>>,
    cancellations: RwLock<HashMap<SessionId, CancellationToken>>,
    durable: Option<Arc<dyn SessionStorePort<SessionRow>>>,
    fsm_config: FsmConfig,
    hint_config: HintConfig,
}

impl SessionStore {
    pub fn new(fsm_config: FsmConfig, hint_config: HintConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            cancellations: RwLock::new(HashMap::new()),
            durable: None,
            fsm_config,
            hint_config,
        }
    }

    pub fn with_durable(mut self, durable: Arc<dyn SessionStorePort<SessionRow>>) -> Self {
        self.durable = Some(durable);
        self
    }

    /// Register a freshly-constructed session, writing its start row
    /// through to durable storage. Returns the shared, lockable handle.
    pub async fn create(&self, session: Session) -> Arc<Mutex<SessionState>> {
        let id = session.id.clone();
        if let Some(durable) = &self.durable {
            let row = SessionRow::Started {
                session_id: id.0.clone(),
                student_id: session.student_id.0.clone(),
                question_id: session.question_id.0.clone(),
                started_at: session.started_at,
            };
            if let Err(error) = durable.append(&row).await {
                // Persistence failure is logged; in-memory state remains authoritative.
                tracing::warn!(session_id = %id, %error, "session start persistence failed");
            }
        }

        let hints = HintController::new(id.clone(), &self.hint_config);
        let fsm = FsmController::new(self.fsm_config.clone());
        let handle = Arc::new(Mutex::new(SessionState { session, fsm, hints }));
        self.sessions.write().await.insert(id.clone(), handle.clone());
        self.cancellations.write().await.insert(id, CancellationToken::new());
        handle
    }

    /// The request-scoped cancellation token for `id`'s in-flight turn, if
    /// the session is still active. Cloning is cheap (`tokio_util`'s token
    /// is reference-counted); the clone is what gets threaded into the LLM
    /// Port for a single turn.
    pub async fn cancellation_token(&self, id: &SessionId) -> Option<CancellationToken> {
        self.cancellations.read().await.get(id).cloned()
    }

    /// Signal cancellation for `id`'s in-flight turn, if any, without
    /// waiting on the session's own lock.
    pub async fn cancel(&self, id: &SessionId) {
        if let Some(token) = self.cancellations.read().await.get(id) {
            token.cancel();
        }
    }

    pub async fn get(&self, id: &SessionId) -> Option<Arc<Mutex<SessionState>>> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn list_active_ids(&self) -> Vec<SessionId> {
        self.sessions.read().await.keys().cloned().collect()
    }

    /// Write-through after each recorded turn.
    pub async fn persist_turn(&self, session_id: &SessionId, turn: &Turn) {
        if let Some(durable) = &self.durable {
            let row = SessionRow::TurnRecorded {
                session_id: session_id.0.clone(),
                turn: turn.clone(),
            };
            if let Err(error) = durable.append(&row).await {
                tracing::warn!(%session_id, %error, "turn persistence failed");
            }
        }
    }

    /// Write-through at end-of-session.
    pub async fn persist_end(&self, session_id: &SessionId, final_state: &str, concept_coverage: f64) {
        if let Some(durable) = &self.durable {
            let row = SessionRow::Ended {
                session_id: session_id.0.clone(),
                ended_at: Utc::now(),
                final_state: final_state.to_string(),
                concept_coverage,
            };
            if let Err(error) = durable.append(&row).await {
                tracing::warn!(%session_id, %error, "session end persistence failed");
            }
        }
    }

    /// Write-through for the terminal metrics report.
    pub async fn persist_metrics(&self, report: &MetricsReport) {
        if let Some(durable) = &self.durable {
            let row = SessionRow::MetricsWritten { report: report.clone() };
            if let Err(error) = durable.append(&row).await {
                tracing::warn!(session_id = %report.session_id, %error, "metrics persistence failed");
            }
        }
    }

    /// Evict a terminal session from the active map (cleanup verb).
    pub async fn remove(&self, id: &SessionId) {
        self.sessions.write().await.remove(id);
        self.cancellations.write().await.remove(id);
    }

    /// Drop every session whose FSM has returned to IDLE after a full
    /// CONSOLIDATING round-trip — the public-surface `cleanup` verb.
    pub async fn cleanup_terminal(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        let mut keep = HashMap::new();
        let mut removed_ids = Vec::new();
        for (id, handle) in sessions.drain() {
            let is_terminal = handle.lock().await.session.is_terminal();
            if is_terminal {
                removed_ids.push(id);
            } else {
                keep.insert(id, handle);
            }
        }
        *sessions = keep;
        if !removed_ids.is_empty() {
            let mut cancellations = self.cancellations.write().await;
            for id in removed_ids {
                cancellations.remove(&id);
            }
        }
        before - sessions.len()
    }
}

pub use tutor_memory::{InMemorySessionStore, JsonlSessionStore};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{QuestionId, StudentId};

    fn fresh_session() -> Session {
        Session::new(
            StudentId("s1".into()),
            QuestionId("q1".into()),
            "3x+5=20".into(),
            "x=5".into(),
            vec!["linear_eq".into()],
        )
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let store = SessionStore::new(FsmConfig::default(), HintConfig::default());
        let session = fresh_session();
        let id = session.id.clone();
        store.create(session).await;
        assert!(store.get(&id).await.is_some());
        assert_eq!(store.list_active_ids().await, vec![id]);
    }

    #[tokio::test]
    async fn cleanup_terminal_removes_ended_sessions_only() {
        let store = SessionStore::new(FsmConfig::default(), HintConfig::default());
        let mut ended = fresh_session();
        ended.mark_ended();
        let ended_id = ended.id.clone();
        let active_id = {
            let active = fresh_session();
            let id = active.id.clone();
            store.create(active).await;
            id
        };
        store.create(ended).await;

        let removed = store.cleanup_terminal().await;
        assert_eq!(removed, 1);
        assert!(store.get(&ended_id).await.is_none());
        assert!(store.get(&active_id).await.is_some());
    }

    #[tokio::test]
    async fn durable_sink_receives_start_row() {
        let durable = Arc::new(InMemorySessionStore::<SessionRow>::new());
        let store = SessionStore::new(FsmConfig::default(), HintConfig::default())
            .with_durable(durable.clone());
        store.create(fresh_session()).await;
        let rows = durable.load_all().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(matches!(rows[0], SessionRow::Started { .. }));
    }

    #[tokio::test]
    async fn cancellation_token_is_session_scoped_and_cleared_on_removal() {
        let store = SessionStore::new(FsmConfig::default(), HintConfig::default());
        let session = fresh_session();
        let id = session.id.clone();
        store.create(session).await;

        let token = store.cancellation_token(&id).await.unwrap();
        assert!(!token.is_cancelled());

        store.cancel(&id).await;
        assert!(token.is_cancelled());
        // A fresh clone fetched after cancellation reflects the same state.
        assert!(store.cancellation_token(&id).await.unwrap().is_cancelled());

        store.remove(&id).await;
        assert!(store.cancellation_token(&id).await.is_none());
    }

    #[tokio::test]
    async fn cancelling_an_unknown_session_is_a_no_op() {
        let store = SessionStore::new(FsmConfig::default(), HintConfig::default());
        store.cancel(&SessionId("no-such-session".into())).await;
    }
}
