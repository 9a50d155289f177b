//! Durable write-through log backing the Session Store.
//!
//! The in-process session map lives with the Dialog Engine; this module only
//! owns the append-only durability side. A [`SessionStorePort`] accepts
//! arbitrary serializable rows (a started session, a recorded turn, an
//! end-of-session summary, a metrics report) and appends them as JSON lines.
//! Replaying the log on startup reconstructs whatever the caller's in-memory
//! map needs. The file format and crash-safety argument are lifted directly
//! from the event-log append/overwrite pattern used elsewhere in this
//! workspace for durable, append-mostly records.

use std::fs;
use std::io::{BufRead, BufReader};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncWriteExt;

#[derive(Debug, thiserror::Error)]
pub enum SessionStoreError {
    #[error("session store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("session store serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Write-through durability port. `T` is whatever row shape the caller wants
/// to persist (a tagged enum of Session/Turn/Report rows is the expected use).
#[async_trait]
pub trait SessionStorePort<T>: Send + Sync
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    async fn append(&self, row: &T) -> Result<(), SessionStoreError>;
    async fn load_all(&self) -> Result<Vec<T>, SessionStoreError>;
}

/// JSON-lines file-backed [`SessionStorePort`].
///
/// Each `append` opens the file in append mode, writes one JSON line, then
/// flushes and `fsync`s before returning — the row is durable before the
/// write-through point in the pipeline proceeds.
pub struct JsonlSessionStore<T> {
    path: PathBuf,
    _marker: PhantomData<T>,
}

impl<T> JsonlSessionStore<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl<T> SessionStorePort<T> for JsonlSessionStore<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    async fn append(&self, row: &T) -> Result<(), SessionStoreError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let line = serde_json::to_string(row)?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<T>, SessionStoreError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = fs::OpenOptions::new().read(true).open(&self.path)?;
        let reader = BufReader::new(file);
        let mut rows = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            rows.push(serde_json::from_str(&line)?);
        }
        Ok(rows)
    }
}

/// In-memory [`SessionStorePort`] for tests: no filesystem, same ordering
/// guarantees.
#[derive(Default)]
pub struct InMemorySessionStore<T> {
    rows: tokio::sync::Mutex<Vec<T>>,
}

impl<T> InMemorySessionStore<T> {
    pub fn new() -> Self {
        Self {
            rows: tokio::sync::Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl<T> SessionStorePort<T> for InMemorySessionStore<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + Clone,
{
    async fn append(&self, row: &T) -> Result<(), SessionStoreError> {
        self.rows.lock().await.push(row.clone());
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<T>, SessionStoreError> {
        Ok(self.rows.lock().await.clone())
    }
}
