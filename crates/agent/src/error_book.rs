//! Error book collaborator: on REPAIR transitions the Dialog Engine may publish an opaque
//! error record. The core never reads these records back — publishing is
//! fire-and-forget, behind a small capability trait so a concrete sink (file,
//! database, queue) can be swapped without touching the engine.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::session::ErrorType;

/// One observed student error, opaque to the core beyond these fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBookRecord {
    pub student_id: String,
    pub question_id: String,
    pub student_answer: String,
    pub correct_answer: String,
    pub error_type: Option<ErrorType>,
    pub tags: Vec<String>,
}

#[async_trait]
pub trait ErrorBookPort: Send + Sync {
    async fn publish(&self, record: ErrorBookRecord);
}

/// Default collaborator: drops records on the floor. Used whenever no
/// concrete error-book sink is configured, so REPAIR handling never depends
/// on one being present.
#[derive(Debug, Default)]
pub struct NoopErrorBookPort;

#[async_trait]
impl ErrorBookPort for NoopErrorBookPort {
    async fn publish(&self, _record: ErrorBookRecord) {}
}
