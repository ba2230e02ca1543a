//! Turning cloud issuance jobs into encoded cards.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::card::{CardDriver, EncodeResult};
use crate::cloud::{CloudClient, CloudError, IssuanceJob, JobStatus};
use crate::pairing::PairingManager;
use crate::queue::{CardIssueData, JobQueue, QueueError, report_encoded};

/// Errors that stop a poll pass.
#[derive(Debug, thiserror::Error)]
pub enum IssuanceError {
    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// What happened to one cloud job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum ProcessOutcome {
    /// Card written and the cloud told.
    #[serde(rename_all = "camelCase")]
    Encoded { card_uid: String },
    /// Parked in the local queue for a later replay.
    #[serde(rename_all = "camelCase")]
    Queued { queue_id: i64, reason: String },
    /// The cloud refused the job; nothing was queued.
    Rejected { reason: String },
}

impl ProcessOutcome {
    /// Collapse into the caller-facing encode result.
    pub fn into_encode_result(self) -> EncodeResult {
        match self {
            Self::Encoded { card_uid } => EncodeResult::success(card_uid),
            Self::Queued { reason, .. } => {
                EncodeResult::failure(format!("{reason} (queued for retry)"))
            }
            Self::Rejected { reason } => EncodeResult::failure(reason),
        }
    }
}

/// Drives the encoder for cloud jobs and falls back to the queue.
pub struct IssuanceProcessor {
    cloud: Arc<CloudClient>,
    encoder: Arc<dyn CardDriver>,
    queue: Arc<JobQueue>,
    pairing: Arc<PairingManager>,
}

impl IssuanceProcessor {
    pub fn new(
        cloud: Arc<CloudClient>,
        encoder: Arc<dyn CardDriver>,
        queue: Arc<JobQueue>,
        pairing: Arc<PairingManager>,
    ) -> Self {
        Self {
            cloud,
            encoder,
            queue,
            pairing,
        }
    }

    pub fn encoder(&self) -> &Arc<dyn CardDriver> {
        &self.encoder
    }

    /// Fetch this agent's pending jobs and process them one by one.
    ///
    /// Jobs already parked in the local queue are left to replay. Does
    /// nothing while unpaired.
    pub async fn poll_once(&self) -> Result<Vec<ProcessOutcome>, IssuanceError> {
        let Some(agent_id) = self.pairing.agent_id().filter(|_| self.pairing.is_paired()) else {
            return Ok(Vec::new());
        };

        let jobs = self.cloud.list_pending_jobs(&agent_id).await?;
        let mut outcomes = Vec::with_capacity(jobs.len());
        for job in jobs {
            if self.queue.is_queued(&job.id).await? {
                debug!(job_id = %job.id, "Job already queued locally, skipping");
                continue;
            }
            outcomes.push(self.process_job(&job).await?);
        }
        Ok(outcomes)
    }

    /// Run one cloud job through processing → encode → done.
    ///
    /// Encoder failures and cloud outages park the job as `card_issue`; a
    /// 4xx on the initial `processing` mark means the cloud no longer wants
    /// it, so it is dropped.
    pub async fn process_job(&self, job: &IssuanceJob) -> Result<ProcessOutcome, QueueError> {
        info!(job_id = %job.id, room = %job.card_payload.room_number, "Processing issuance job");

        if let Err(e) = self
            .cloud
            .update_job_status(&job.id, JobStatus::Processing, None)
            .await
        {
            if e.is_client_rejection() {
                warn!(job_id = %job.id, error = %e, "Cloud rejected job");
                return Ok(ProcessOutcome::Rejected {
                    reason: e.to_string(),
                });
            }
            if e.is_connectivity() {
                info!(job_id = %job.id, error = %e, "Cloud unreachable, parking job");
            }
            return self.park(job, e.to_string()).await;
        }

        let result = self.encoder.encode_card(&job.card_payload).await;
        let card_uid = match (result.success, result.card_uid) {
            (true, Some(uid)) => uid,
            _ => {
                let reason = result.error.unwrap_or_else(|| "Encode failed".to_string());
                return self.park(job, reason).await;
            }
        };

        let agent_id = self.pairing.agent_id();
        if let Err(e) = report_encoded(&self.cloud, &job.id, &card_uid, agent_id.as_deref()).await {
            return self.park(job, e.to_string()).await;
        }

        info!(job_id = %job.id, card_uid = %card_uid, "Issuance job complete");
        Ok(ProcessOutcome::Encoded { card_uid })
    }

    async fn park(&self, job: &IssuanceJob, reason: String) -> Result<ProcessOutcome, QueueError> {
        let queued = match self
            .queue
            .add_card_issue(&CardIssueData {
                job_id: Some(job.id.clone()),
                card_payload: job.card_payload.clone(),
            })
            .await
        {
            Ok(queued) => queued,
            Err(e) => {
                error!(job_id = %job.id, reason = %reason, error = %e, "Failed to park issuance job");
                return Err(e);
            }
        };
        warn!(job_id = %job.id, queue_id = queued.id, reason = %reason, "Issuance job queued for replay");
        Ok(ProcessOutcome::Queued {
            queue_id: queued.id,
            reason,
        })
    }

    /// Replay the local queue with this processor's encoder.
    pub async fn replay(&self) -> Result<crate::queue::ReplaySummary, QueueError> {
        let agent_id = self.pairing.agent_id();
        self.queue
            .replay_queue(&self.cloud, self.encoder.as_ref(), agent_id.as_deref())
            .await
    }
}
