//! Periodic liveness report to the cloud.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cloud::CloudClient;
use crate::queue::JobQueue;

/// Shortest period accepted; `tokio::time::interval` rejects zero.
const MIN_TICK: Duration = Duration::from_millis(10);

/// Owned handle to a running heartbeat task.
pub struct HeartbeatHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl HeartbeatHandle {
    /// Stop the task and wait for it to exit. An in-flight report is
    /// abandoned.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Heartbeat task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Spawn a task that posts a `heartbeat` event for `agent_id` every
/// `interval`. Failures are logged and the next tick tries again.
pub fn spawn_heartbeat_task(
    cloud: Arc<CloudClient>,
    queue: Arc<JobQueue>,
    agent_id: String,
    interval: Duration,
) -> HeartbeatHandle {
    let (stop, mut shutdown) = watch::channel(false);

    let task = tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval.max(MIN_TICK));
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        timer.tick().await; // Skip first immediate tick

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    tokio::select! {
                        () = send_heartbeat(&cloud, &queue, &agent_id) => {}
                        _ = shutdown.changed() => break,
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        info!(agent_id = %agent_id, "Heartbeat task shutting down");
    });

    HeartbeatHandle { stop, task }
}

async fn send_heartbeat(cloud: &CloudClient, queue: &JobQueue, agent_id: &str) {
    let queue_length = match queue.queue_length().await {
        Ok(n) => n,
        Err(e) => {
            warn!(error = %e, "Failed to read queue length for heartbeat");
            0
        }
    };
    let data = serde_json::json!({
        "lastSeen": Utc::now().to_rfc3339(),
        "status": "online",
        "queueLength": queue_length,
    });

    match cloud.log_event(agent_id, "heartbeat", &data).await {
        Ok(()) => debug!(queue_length, "Heartbeat sent"),
        Err(e) => warn!(error = %e, "Heartbeat failed"),
    }
}

#[cfg(test)]
mod tests {
    use cardlink_core::config::CloudConfig;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::queue::DEFAULT_MAX_RETRIES;

    async fn fixtures(server: &MockServer) -> (Arc<CloudClient>, Arc<JobQueue>) {
        let cloud = CloudClient::new(&CloudConfig {
            base_url: server.uri(),
            ..CloudConfig::default()
        })
        .unwrap();
        cloud.set_token(Some("tok".into()));
        let queue = JobQueue::open_in_memory(DEFAULT_MAX_RETRIES).await.unwrap();
        (Arc::new(cloud), Arc::new(queue))
    }

    #[tokio::test]
    async fn posts_heartbeats_with_queue_length() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/agents/agent-1/log"))
            .and(body_partial_json(serde_json::json!({
                "type": "heartbeat",
                "data": {"status": "online", "queueLength": 1}
            })))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let (cloud, queue) = fixtures(&server).await;
        queue
            .add_job("card_issue", &serde_json::json!({}), 0)
            .await
            .unwrap();

        let handle = spawn_heartbeat_task(cloud, queue, "agent-1".into(), Duration::from_millis(30));
        tokio::time::sleep(Duration::from_millis(150)).await;
        handle.stop().await;

        let received = server.received_requests().await.unwrap();
        assert!(received.len() >= 2, "got {} heartbeats", received.len());
    }

    #[tokio::test]
    async fn failures_do_not_stop_the_task() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let (cloud, queue) = fixtures(&server).await;
        let handle = spawn_heartbeat_task(cloud, queue, "agent-1".into(), Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!handle.is_finished());
        handle.stop().await;

        assert!(server.received_requests().await.unwrap().len() >= 2);
    }

    #[tokio::test]
    async fn zero_interval_keeps_running() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let (cloud, queue) = fixtures(&server).await;
        let handle = spawn_heartbeat_task(cloud, queue, "agent-1".into(), Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!handle.is_finished());
        handle.stop().await;
    }

    #[tokio::test]
    async fn stop_is_prompt() {
        let server = MockServer::start().await;
        let (cloud, queue) = fixtures(&server).await;
        let handle = spawn_heartbeat_task(cloud, queue, "agent-1".into(), Duration::from_secs(3600));
        tokio::time::timeout(Duration::from_secs(1), handle.stop())
            .await
            .unwrap();
    }
}
