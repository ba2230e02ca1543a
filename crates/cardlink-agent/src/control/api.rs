//! Transport-agnostic operations exposed to the host application.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::card::{CardPayload, DeviceStatus, EncodeResult};
use crate::cloud::{IssuanceJob, JobStatus};
use crate::issuance::IssuanceProcessor;
use crate::pairing::PairingManager;
use crate::queue::{JobQueue, QueueError, ReplaySummary, STATUS_PREVIEW_LEN};
use crate::storage::QueuedJob;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingStatus {
    pub is_paired: bool,
    pub agent_id: Option<String>,
    pub agent_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairRequest {
    pub pairing_token: String,
    pub agent_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A queued job as shown to the host, with its data decoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedJobView {
    pub id: i64,
    #[serde(rename = "type")]
    pub job_type: String,
    pub data: serde_json::Value,
    pub retries: i64,
    pub created_at: i64,
    pub last_attempt: Option<i64>,
}

impl From<QueuedJob> for QueuedJobView {
    fn from(job: QueuedJob) -> Self {
        let data = job
            .data_json()
            .unwrap_or_else(|_| serde_json::Value::String(job.data.clone()));
        Self {
            id: job.id,
            job_type: job.job_type,
            data,
            retries: job.retries,
            created_at: job.created_at,
            last_attempt: job.last_attempt,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub length: i64,
    pub jobs: Vec<QueuedJobView>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodeRequest {
    #[serde(default)]
    pub job_id: Option<String>,
    pub card_payload: CardPayload,
}

/// The host-facing surface of the agent.
#[derive(Clone)]
pub struct ControlApi {
    pairing: Arc<PairingManager>,
    processor: Arc<IssuanceProcessor>,
    queue: Arc<JobQueue>,
}

impl ControlApi {
    pub fn new(
        pairing: Arc<PairingManager>,
        processor: Arc<IssuanceProcessor>,
        queue: Arc<JobQueue>,
    ) -> Self {
        Self {
            pairing,
            processor,
            queue,
        }
    }

    pub fn pairing_status(&self) -> PairingStatus {
        let identity = self.pairing.identity();
        PairingStatus {
            is_paired: identity.is_paired(),
            agent_id: identity.agent_id,
            agent_name: identity.agent_name,
        }
    }

    pub async fn pair(&self, pairing_token: &str, agent_name: &str) -> PairResponse {
        match self.pairing.pair(pairing_token, agent_name).await {
            Ok(agent_id) => PairResponse {
                success: true,
                agent_id: Some(agent_id),
                error: None,
            },
            Err(e) => PairResponse {
                success: false,
                agent_id: None,
                error: Some(e.to_string()),
            },
        }
    }

    /// Queue length and the oldest few jobs.
    pub async fn queue_status(&self) -> Result<QueueStatus, QueueError> {
        Ok(QueueStatus {
            length: self.queue.queue_length().await?,
            jobs: self
                .queue
                .peek(STATUS_PREVIEW_LEN)
                .await?
                .into_iter()
                .map(QueuedJobView::from)
                .collect(),
        })
    }

    pub async fn replay_queue(&self) -> Result<ReplaySummary, QueueError> {
        info!("Manual queue replay requested");
        self.processor.replay().await
    }

    /// Encode a card on demand. With a `job_id` the cloud job goes through
    /// the full processing round-trip; without one it is a bare encode.
    pub async fn encode_card(&self, request: EncodeRequest) -> EncodeResult {
        match request.job_id {
            Some(job_id) => {
                let job = IssuanceJob {
                    id: job_id,
                    card_payload: request.card_payload,
                    status: JobStatus::Pending,
                };
                match self.processor.process_job(&job).await {
                    Ok(outcome) => outcome.into_encode_result(),
                    Err(e) => EncodeResult::failure(e.to_string()),
                }
            }
            None => {
                self.processor
                    .encoder()
                    .encode_card(&request.card_payload)
                    .await
            }
        }
    }

    pub fn device_status(&self) -> DeviceStatus {
        self.processor.encoder().status()
    }
}
