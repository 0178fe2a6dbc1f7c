//! Durable record of finished games. Written once per game, off the live
//! game path.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use pinpoint_core::error::GameError;
use pinpoint_core::round::GameSummary;

#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn record(&self, summary: &GameSummary) -> Result<(), GameError>;

    /// Flush and release the underlying resource.
    async fn close(&self) -> Result<(), GameError>;
}

/// Keeps summaries in memory. Default when no results file is configured.
#[derive(Default)]
pub struct MemoryResultStore {
    summaries: Mutex<Vec<GameSummary>>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn summaries(&self) -> Vec<GameSummary> {
        self.summaries.lock().await.clone()
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn record(&self, summary: &GameSummary) -> Result<(), GameError> {
        self.summaries.lock().await.push(summary.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), GameError> {
        Ok(())
    }
}

/// Appends one JSON document per line.
pub struct JsonlResultStore {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl JsonlResultStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, GameError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| GameError::StorageUnavailable(format!("{}: {e}", path.display())))?;
        tracing::info!(path = %path.display(), "Recording game results");
        Ok(Self {
            path,
            file: Mutex::new(Some(file)),
        })
    }
}

#[async_trait]
impl ResultStore for JsonlResultStore {
    async fn record(&self, summary: &GameSummary) -> Result<(), GameError> {
        let mut line = serde_json::to_vec(summary)
            .map_err(|e| GameError::Fatal(format!("unserializable game summary: {e}")))?;
        line.push(b'\n');
        let mut guard = self.file.lock().await;
        let file = guard
            .as_mut()
            .ok_or_else(|| GameError::StorageUnavailable("results file closed".to_string()))?;
        file.write_all(&line)
            .await
            .map_err(|e| GameError::Transient(format!("{}: {e}", self.path.display())))?;
        file.flush()
            .await
            .map_err(|e| GameError::Transient(format!("{}: {e}", self.path.display())))
    }

    async fn close(&self) -> Result<(), GameError> {
        if let Some(file) = self.file.lock().await.take() {
            file.sync_all()
                .await
                .map_err(|e| GameError::StorageUnavailable(format!("{}: {e}", self.path.display())))?;
        }
        Ok(())
    }
}
