//! Durable job queue.
//!
//! Jobs that could not be completed against the cloud or the reader are
//! parked here and replayed later. Ids come from an `AUTOINCREMENT` column,
//! so they keep increasing across restarts and deletions. Mutations are
//! serialised through a single writer lock; replays through a second one.

mod replay;

use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::card::CardPayload;
use crate::storage::{CARD_ISSUE, DatabaseError, QueueDatabase, QueuedJob};

pub use replay::{ReplaySummary, report_encoded};

/// Default replay attempts before a job is abandoned.
pub const DEFAULT_MAX_RETRIES: i64 = 5;

/// Jobs shown by [`JobQueue::peek`] for status displays.
pub const STATUS_PREVIEW_LEN: i64 = 10;

/// Job queue errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error("Invalid job data: {0}")]
    Json(#[from] serde_json::Error),
}

/// Data of a `card_issue` job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardIssueData {
    /// Cloud issuance job id; absent for a bare encode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub card_payload: CardPayload,
}

/// Persistent FIFO of deferred jobs.
pub struct JobQueue {
    db: QueueDatabase,
    write_lock: Mutex<()>,
    replay_lock: Mutex<()>,
    max_retries: i64,
}

impl JobQueue {
    /// Open (or create) the queue stored at `path`.
    pub async fn open(path: &Path, max_retries: i64) -> Result<Self, QueueError> {
        let db = QueueDatabase::open(path).await?;
        let queue = Self::new(db, max_retries);
        info!(
            path = %path.display(),
            pending = queue.queue_length().await?,
            "Job queue opened"
        );
        Ok(queue)
    }

    /// In-memory queue (for tests).
    pub async fn open_in_memory(max_retries: i64) -> Result<Self, QueueError> {
        Ok(Self::new(QueueDatabase::open_in_memory().await?, max_retries))
    }

    fn new(db: QueueDatabase, max_retries: i64) -> Self {
        Self {
            db,
            write_lock: Mutex::new(()),
            replay_lock: Mutex::new(()),
            max_retries: max_retries.max(1),
        }
    }

    pub const fn max_retries(&self) -> i64 {
        self.max_retries
    }

    /// Append a job. It is on stable storage when this returns.
    pub async fn add_job(
        &self,
        job_type: &str,
        data: &serde_json::Value,
        retries: i64,
    ) -> Result<QueuedJob, QueueError> {
        let data = serde_json::to_string(data)?;
        let _guard = self.write_lock.lock().await;
        let job = self.db.insert_job(job_type, &data, retries).await?;
        debug!(id = job.id, job_type, "Job queued");
        #[cfg(feature = "metrics")]
        cardlink_core::metrics::counters().jobs_queued.add(1, &[]);
        Ok(job)
    }

    /// Queue a deferred card encode.
    pub async fn add_card_issue(&self, data: &CardIssueData) -> Result<QueuedJob, QueueError> {
        self.add_job(CARD_ISSUE, &serde_json::to_value(data)?, 0).await
    }

    /// All jobs, oldest first.
    pub async fn get_jobs(&self) -> Result<Vec<QueuedJob>, QueueError> {
        Ok(self.db.list_jobs().await?)
    }

    /// The oldest `limit` jobs.
    pub async fn peek(&self, limit: i64) -> Result<Vec<QueuedJob>, QueueError> {
        Ok(self.db.list_jobs_limit(limit).await?)
    }

    /// Remove a job. Removing an absent id is a no-op.
    pub async fn remove_job(&self, id: i64) -> Result<(), QueueError> {
        let _guard = self.write_lock.lock().await;
        if self.db.delete_job(id).await? {
            debug!(id, "Job removed");
        }
        Ok(())
    }

    /// Record a failed attempt; returns the new retry count, or `None` if
    /// the job is gone.
    pub async fn increment_retries(&self, id: i64) -> Result<Option<i64>, QueueError> {
        let _guard = self.write_lock.lock().await;
        Ok(self.db.increment_job_retries(id).await?)
    }

    pub async fn queue_length(&self) -> Result<i64, QueueError> {
        Ok(self.db.count_jobs().await?)
    }

    /// Whether a `card_issue` job for cloud job `cloud_job_id` is queued.
    pub async fn is_queued(&self, cloud_job_id: &str) -> Result<bool, QueueError> {
        Ok(self.db.has_cloud_job(CARD_ISSUE, cloud_job_id).await?)
    }

    /// Flush and close the underlying store.
    pub async fn close(&self) {
        let _guard = self.write_lock.lock().await;
        self.db.close().await;
        info!("Job queue closed");
    }
}
