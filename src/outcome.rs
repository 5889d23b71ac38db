//! Append-only log of run outcomes, one record per run.

use crate::context::{Event, RunContext, RunId, RunState};
use crate::delivery::DeliveryStatus;
use crate::error::FailureReason;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::debug;

/// The final record of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub run_id: RunId,
    pub event: Event,
    /// `Completed` or `Failed`
    pub final_state: RunState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery: Option<DeliveryStatus>,
    pub completed_at: DateTime<Utc>,
}

impl OutcomeRecord {
    /// Concludes `ctx`, moving it to `final_state`.
    ///
    /// `failure_reason` must be set exactly when `final_state` is `Failed`.
    pub fn conclude(
        ctx: &mut RunContext,
        final_state: RunState,
        failure_reason: Option<FailureReason>,
        failure_detail: Option<String>,
    ) -> Self {
        ctx.set_state(final_state);
        Self {
            run_id: ctx.run_id(),
            event: ctx.event().clone(),
            final_state,
            failure_reason,
            failure_detail,
            delivery: ctx.delivery().cloned(),
            completed_at: Utc::now(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.final_state == RunState::Completed
    }
}

/// Errors from an [`OutcomeLog`].
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum OutcomeError {
    /// The run already has a record; the log is append-only.
    #[error("outcome already recorded for run {0}")]
    Duplicate(RunId),

    #[error("outcome log I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("outcome log entry is malformed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Append-only store of [`OutcomeRecord`]s.
#[async_trait]
pub trait OutcomeLog: Send + Sync {
    /// Appends `record`, rejecting a second record for the same run.
    async fn append(&self, record: OutcomeRecord) -> Result<(), OutcomeError>;

    async fn get(&self, run_id: RunId) -> Result<Option<OutcomeRecord>, OutcomeError>;

    /// All records in append order.
    async fn records(&self) -> Result<Vec<OutcomeRecord>, OutcomeError>;
}

#[derive(Debug, Default)]
struct Entries {
    records: Vec<OutcomeRecord>,
    index: HashMap<RunId, usize>,
}

impl Entries {
    fn insert(&mut self, record: OutcomeRecord) -> Result<(), OutcomeError> {
        if self.index.contains_key(&record.run_id) {
            return Err(OutcomeError::Duplicate(record.run_id));
        }
        self.index.insert(record.run_id, self.records.len());
        self.records.push(record);
        Ok(())
    }

    fn get(&self, run_id: RunId) -> Option<OutcomeRecord> {
        self.index.get(&run_id).map(|&i| self.records[i].clone())
    }
}

/// In-process outcome log.
#[derive(Debug, Default)]
pub struct InMemoryOutcomeLog {
    entries: RwLock<Entries>,
}

impl InMemoryOutcomeLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OutcomeLog for InMemoryOutcomeLog {
    async fn append(&self, record: OutcomeRecord) -> Result<(), OutcomeError> {
        self.entries.write().await.insert(record)
    }

    async fn get(&self, run_id: RunId) -> Result<Option<OutcomeRecord>, OutcomeError> {
        Ok(self.entries.read().await.get(run_id))
    }

    async fn records(&self) -> Result<Vec<OutcomeRecord>, OutcomeError> {
        Ok(self.entries.read().await.records.clone())
    }
}

/// Outcome log persisted as one JSON object per line.
///
/// Existing lines are loaded on open, so duplicate detection spans process
/// restarts.
#[derive(Debug)]
pub struct JsonLinesOutcomeLog {
    path: PathBuf,
    entries: RwLock<Entries>,
}

impl JsonLinesOutcomeLog {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, OutcomeError> {
        let path = path.as_ref().to_path_buf();
        let mut entries = Entries::default();

        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                for line in content.lines().filter(|l| !l.trim().is_empty()) {
                    entries.insert(serde_json::from_str(line)?)?;
                }
                debug!(path = %path.display(), records = entries.records.len(), "loaded outcome log");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl OutcomeLog for JsonLinesOutcomeLog {
    async fn append(&self, record: OutcomeRecord) -> Result<(), OutcomeError> {
        let mut entries = self.entries.write().await;
        if entries.index.contains_key(&record.run_id) {
            return Err(OutcomeError::Duplicate(record.run_id));
        }

        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        entries.insert(record)
    }

    async fn get(&self, run_id: RunId) -> Result<Option<OutcomeRecord>, OutcomeError> {
        Ok(self.entries.read().await.get(run_id))
    }

    async fn records(&self) -> Result<Vec<OutcomeRecord>, OutcomeError> {
        Ok(self.entries.read().await.records.clone())
    }
}
