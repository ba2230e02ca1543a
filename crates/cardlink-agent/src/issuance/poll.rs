//! Fixed-interval poll loop over the cloud's pending jobs.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::processor::IssuanceProcessor;

/// Shortest period accepted; `tokio::time::interval` rejects zero.
const MIN_TICK: Duration = Duration::from_millis(10);

/// Owned handle to the running poll loop.
pub struct PollHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PollHandle {
    /// Stop ticking and wait for the loop to exit. A pass already under way
    /// runs to completion first, so no job is left half-reported.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Poll task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Spawn the poll loop. Each tick runs [`IssuanceProcessor::poll_once`];
/// errors are logged and the next tick tries again.
pub fn spawn_poll_task(processor: Arc<IssuanceProcessor>, interval: Duration) -> PollHandle {
    let (stop, mut shutdown) = watch::channel(false);

    let task = tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval.max(MIN_TICK));
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    match processor.poll_once().await {
                        Ok(outcomes) if !outcomes.is_empty() => {
                            info!(processed = outcomes.len(), "Poll pass complete");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Poll pass failed"),
                    }
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("Poll task shutting down");
    });

    PollHandle { stop, task }
}
