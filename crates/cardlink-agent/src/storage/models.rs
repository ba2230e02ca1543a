//! Database models for the job queue.

use serde::{Deserialize, Serialize};

/// Job type tag for a deferred card encode.
pub const CARD_ISSUE: &str = "card_issue";

/// A deferred unit of work in the local queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct QueuedJob {
    pub id: i64,
    pub job_type: String,
    /// JSON document, interpreted according to `job_type`.
    pub data: String,
    pub retries: i64,
    pub created_at: i64,
    pub last_attempt: Option<i64>,
}

impl QueuedJob {
    /// Decode `data` as JSON.
    pub fn data_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_str(&self.data)
    }
}
