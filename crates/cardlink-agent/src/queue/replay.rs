//! Replaying parked jobs against the cloud and the reader.

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::card::CardDriver;
use crate::cloud::{CloudClient, CloudError, JobStatus, best_effort};
use crate::storage::{CARD_ISSUE, QueuedJob};

use super::{CardIssueData, JobQueue, QueueError};

/// Outcome counts of one replay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplaySummary {
    pub success: u32,
    pub failed: u32,
    pub total: u32,
}

/// Why a single replayed job did not complete.
#[derive(Debug, thiserror::Error)]
enum AttemptError {
    #[error("{0}")]
    Encode(String),

    #[error(transparent)]
    Cloud(#[from] CloudError),
}

/// Report a successful encode: mark the cloud job `done`, then log a
/// `card_encoded` event when the agent id is known.
///
/// Only the status update can fail the call; the event is best-effort.
pub async fn report_encoded(
    cloud: &CloudClient,
    job_id: &str,
    card_uid: &str,
    agent_id: Option<&str>,
) -> Result<(), CloudError> {
    let encoded_at = Utc::now().to_rfc3339();
    let metadata = serde_json::json!({ "cardUID": card_uid, "encodedAt": encoded_at });
    cloud
        .update_job_status(job_id, JobStatus::Done, Some(&metadata))
        .await?;

    if let Some(agent_id) = agent_id {
        let event = serde_json::json!({
            "jobId": job_id,
            "cardUID": card_uid,
            "encodedAt": encoded_at,
        });
        best_effort(
            "log card_encoded",
            cloud.log_event(agent_id, "card_encoded", &event),
        )
        .await;
    }

    #[cfg(feature = "metrics")]
    cardlink_core::metrics::counters().cards_encoded.add(1, &[]);
    Ok(())
}

impl JobQueue {
    /// Attempt every queued job once, oldest first.
    ///
    /// Only one replay runs at a time; a second caller waits for the first
    /// to finish and then replays whatever is still queued.
    pub async fn replay_queue(
        &self,
        cloud: &CloudClient,
        encoder: &dyn CardDriver,
        agent_id: Option<&str>,
    ) -> Result<ReplaySummary, QueueError> {
        let _replay = self.replay_lock.lock().await;

        let jobs = self.get_jobs().await?;
        let mut summary = ReplaySummary {
            total: u32::try_from(jobs.len()).unwrap_or(u32::MAX),
            ..ReplaySummary::default()
        };
        if jobs.is_empty() {
            return Ok(summary);
        }
        info!(total = summary.total, "Replaying queued jobs");

        for job in jobs {
            if job.job_type != CARD_ISSUE {
                warn!(id = job.id, job_type = %job.job_type, "Discarding job of unknown type");
                self.remove_job(job.id).await?;
                summary.failed += 1;
                continue;
            }

            let data: CardIssueData = match serde_json::from_str(&job.data) {
                Ok(data) => data,
                Err(e) => {
                    warn!(id = job.id, error = %e, "Discarding undecodable card_issue job");
                    self.remove_job(job.id).await?;
                    summary.failed += 1;
                    continue;
                }
            };

            match attempt(cloud, encoder, agent_id, &data).await {
                Ok(card_uid) => {
                    info!(id = job.id, card_uid = %card_uid, "Queued job replayed");
                    self.remove_job(job.id).await?;
                    summary.success += 1;
                }
                Err(e) => {
                    self.record_failure(cloud, &job, &data, &e.to_string()).await?;
                    summary.failed += 1;
                }
            }
        }

        info!(
            success = summary.success,
            failed = summary.failed,
            total = summary.total,
            "Replay finished"
        );
        Ok(summary)
    }

    async fn record_failure(
        &self,
        cloud: &CloudClient,
        job: &QueuedJob,
        data: &CardIssueData,
        error: &str,
    ) -> Result<(), QueueError> {
        let Some(retries) = self.increment_retries(job.id).await? else {
            return Ok(());
        };

        if retries < self.max_retries {
            warn!(id = job.id, retries, error, "Queued job failed, will retry");
            return Ok(());
        }

        warn!(id = job.id, retries, error, "Queued job exhausted its retries");
        self.remove_job(job.id).await?;
        #[cfg(feature = "metrics")]
        cardlink_core::metrics::counters().jobs_exhausted.add(1, &[]);

        if let Some(job_id) = &data.job_id {
            let metadata = serde_json::json!({ "error": error });
            best_effort(
                "mark failed",
                cloud.update_job_status(job_id, JobStatus::Failed, Some(&metadata)),
            )
            .await;
        }
        Ok(())
    }
}

async fn attempt(
    cloud: &CloudClient,
    encoder: &dyn CardDriver,
    agent_id: Option<&str>,
    data: &CardIssueData,
) -> Result<String, AttemptError> {
    if let Some(job_id) = &data.job_id {
        best_effort(
            "mark processing",
            cloud.update_job_status(job_id, JobStatus::Processing, None),
        )
        .await;
    }

    let result = encoder.encode_card(&data.card_payload).await;
    let card_uid = match (result.success, result.card_uid) {
        (true, Some(uid)) => uid,
        _ => {
            return Err(AttemptError::Encode(
                result.error.unwrap_or_else(|| "Encode failed".to_string()),
            ));
        }
    };

    if let Some(job_id) = &data.job_id {
        report_encoded(cloud, job_id, &card_uid, agent_id).await?;
    }
    Ok(card_uid)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use cardlink_core::config::CloudConfig;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::card::{CardPayload, DeviceStatus, EncodeResult};
    use crate::queue::DEFAULT_MAX_RETRIES;

    /// Encoder that fails a fixed number of times before succeeding.
    struct FlakyEncoder {
        failures_left: AtomicUsize,
        calls: AtomicUsize,
    }

    impl FlakyEncoder {
        fn failing(times: usize) -> Self {
            Self {
                failures_left: AtomicUsize::new(times),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl CardDriver for FlakyEncoder {
        async fn encode_card(&self, _payload: &CardPayload) -> EncodeResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return EncodeResult::failure("No card detected");
            }
            EncodeResult::success("CAFEBABE")
        }

        fn status(&self) -> DeviceStatus {
            DeviceStatus::disconnected()
        }
    }

    async fn cloud(server: &MockServer) -> CloudClient {
        Mock::given(method("PATCH"))
            .respond_with(ResponseTemplate::new(200))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(server)
            .await;
        client(&server.uri())
    }

    fn client(base_url: &str) -> CloudClient {
        let client = CloudClient::new(&CloudConfig {
            base_url: base_url.to_string(),
            ..CloudConfig::default()
        })
        .unwrap();
        client.set_token(Some("tok".into()));
        client
    }

    fn patch_status(status: &str) -> wiremock::MockBuilder {
        Mock::given(method("PATCH"))
            .and(path("/card-issues/j1/status"))
            .and(body_partial_json(serde_json::json!({ "status": status })))
    }

    fn issue(job_id: &str) -> CardIssueData {
        CardIssueData {
            job_id: Some(job_id.into()),
            card_payload: CardPayload {
                room_number: "204".into(),
                check_in: None,
                check_out: None,
            },
        }
    }

    #[tokio::test]
    async fn empty_queue_replays_nothing() {
        let server = MockServer::start().await;
        let cloud = cloud(&server).await;
        let q = JobQueue::open_in_memory(DEFAULT_MAX_RETRIES).await.unwrap();
        let summary = q
            .replay_queue(&cloud, &FlakyEncoder::failing(0), None)
            .await
            .unwrap();
        assert_eq!(summary, ReplaySummary::default());
    }

    #[tokio::test]
    async fn unknown_and_corrupt_jobs_are_discarded() {
        let server = MockServer::start().await;
        let cloud = cloud(&server).await;
        let q = JobQueue::open_in_memory(DEFAULT_MAX_RETRIES).await.unwrap();
        q.add_job("print_receipt", &serde_json::json!({}), 0)
            .await
            .unwrap();
        q.add_job(CARD_ISSUE, &serde_json::json!({"jobId": 5}), 0)
            .await
            .unwrap();

        let encoder = FlakyEncoder::failing(0);
        let summary = q.replay_queue(&cloud, &encoder, None).await.unwrap();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.failed, 2);
        assert_eq!(q.queue_length().await.unwrap(), 0);
        assert_eq!(encoder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn four_failures_keep_the_job() {
        let server = MockServer::start().await;
        let cloud = cloud(&server).await;
        let q = JobQueue::open_in_memory(DEFAULT_MAX_RETRIES).await.unwrap();
        q.add_card_issue(&issue("j1")).await.unwrap();

        let encoder = FlakyEncoder::failing(usize::MAX);
        for _ in 0..4 {
            q.replay_queue(&cloud, &encoder, None).await.unwrap();
        }
        let jobs = q.get_jobs().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].retries, 4);
    }

    #[tokio::test]
    async fn fifth_failure_removes_the_job() {
        let server = MockServer::start().await;
        let cloud = cloud(&server).await;
        let q = JobQueue::open_in_memory(DEFAULT_MAX_RETRIES).await.unwrap();
        q.add_card_issue(&issue("j1")).await.unwrap();

        let encoder = FlakyEncoder::failing(usize::MAX);
        for _ in 0..5 {
            q.replay_queue(&cloud, &encoder, None).await.unwrap();
        }
        assert!(q.get_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn success_after_failures_removes_job() {
        let server = MockServer::start().await;
        let cloud = cloud(&server).await;
        let q = JobQueue::open_in_memory(DEFAULT_MAX_RETRIES).await.unwrap();
        q.add_card_issue(&issue("j1")).await.unwrap();

        let encoder = FlakyEncoder::failing(2);
        let first = q.replay_queue(&cloud, &encoder, Some("agent-1")).await.unwrap();
        assert_eq!(first.failed, 1);
        q.replay_queue(&cloud, &encoder, Some("agent-1")).await.unwrap();
        let third = q.replay_queue(&cloud, &encoder, Some("agent-1")).await.unwrap();
        assert_eq!(third.success, 1);
        assert_eq!(q.queue_length().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn bare_encode_job_needs_no_cloud() {
        let server = MockServer::start().await;
        let q = JobQueue::open_in_memory(DEFAULT_MAX_RETRIES).await.unwrap();
        q.add_card_issue(&CardIssueData {
            job_id: None,
            ..issue("unused")
        })
        .await
        .unwrap();

        // No mocks mounted and no token: any cloud call would fail.
        let cloud = CloudClient::new(&CloudConfig {
            base_url: server.uri(),
            ..CloudConfig::default()
        })
        .unwrap();
        let summary = q
            .replay_queue(&cloud, &FlakyEncoder::failing(0), None)
            .await
            .unwrap();
        assert_eq!(summary.success, 1);
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejected_processing_mark_does_not_fail_replay() {
        let server = MockServer::start().await;
        patch_status("processing")
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        patch_status("done")
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let q = JobQueue::open_in_memory(DEFAULT_MAX_RETRIES).await.unwrap();
        q.add_card_issue(&issue("j1")).await.unwrap();
        let summary = q
            .replay_queue(&client(&server.uri()), &FlakyEncoder::failing(0), None)
            .await
            .unwrap();
        assert_eq!(summary.success, 1);
        assert_eq!(q.queue_length().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_event_log_keeps_success() {
        let server = MockServer::start().await;
        patch_status("processing")
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        patch_status("done")
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/agents/agent-1/log"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;

        let q = JobQueue::open_in_memory(DEFAULT_MAX_RETRIES).await.unwrap();
        q.add_card_issue(&issue("j1")).await.unwrap();
        let summary = q
            .replay_queue(&client(&server.uri()), &FlakyEncoder::failing(0), Some("agent-1"))
            .await
            .unwrap();
        assert_eq!(summary.success, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(q.queue_length().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn exhausted_job_is_dropped_when_failed_report_errors() {
        let server = MockServer::start().await;
        patch_status("processing")
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        patch_status("failed")
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let cloud = client(&server.uri());
        let q = JobQueue::open_in_memory(1).await.unwrap();
        q.add_card_issue(&issue("j1")).await.unwrap();
        let summary = q
            .replay_queue(&cloud, &FlakyEncoder::failing(usize::MAX), None)
            .await
            .unwrap();
        assert_eq!(summary.failed, 1);
        assert!(q.get_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unreachable_cloud_only_blocks_the_done_report() {
        // Nothing listens on the discard port.
        let cloud = client("http://127.0.0.1:9");
        let q = JobQueue::open_in_memory(DEFAULT_MAX_RETRIES).await.unwrap();
        q.add_card_issue(&issue("j1")).await.unwrap();

        let encoder = FlakyEncoder::failing(0);
        let summary = q.replay_queue(&cloud, &encoder, None).await.unwrap();
        assert_eq!(encoder.calls.load(Ordering::SeqCst), 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(q.get_jobs().await.unwrap()[0].retries, 1);
    }
}
