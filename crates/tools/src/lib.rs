//! Error-book collaborator sink. The only concrete
//! [`tutor_agent::ErrorBookPort`] implementation in this workspace beyond the
//! no-op default; kept in its own crate so the tutoring core never depends on
//! a filesystem.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tutor_agent::{ErrorBookPort, ErrorBookRecord};

#[derive(Debug, thiserror::Error)]
pub enum ErrorBookError {
    #[error("error book io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("error book serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Appends one JSON line per published record, same append/flush/fsync
/// durability argument as the Session Store's JSONL sink.
pub struct JsonlErrorBookPort {
    path: PathBuf,
}

impl JsonlErrorBookPort {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, record: &ErrorBookRecord) -> Result<(), ErrorBookError> {
        use tokio::io::AsyncWriteExt;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let line = serde_json::to_string(record)?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }
}

#[async_trait]
impl ErrorBookPort for JsonlErrorBookPort {
    async fn publish(&self, record: ErrorBookRecord) {
        if let Err(error) = self.append(&record).await {
            tracing::warn!(%error, "error book publish failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tutor_agent::ErrorType;

    #[tokio::test]
    async fn published_record_is_appended_as_one_json_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("errors.jsonl");
        let port = JsonlErrorBookPort::new(&path);

        port.publish(ErrorBookRecord {
            student_id: "s1".into(),
            question_id: "q1".into(),
            student_answer: "8".into(),
            correct_answer: "5".into(),
            error_type: Some(ErrorType::Calculation),
            tags: vec!["linear_eq".into()],
        })
        .await;

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents.lines().count(), 1);
        assert!(contents.contains("\"student_id\":\"s1\""));
    }
}
