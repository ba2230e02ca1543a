//! Agent assembly and deterministic shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use cardlink_core::Config;

use crate::card::{CardDriver, DriverSelectError, select_driver};
use crate::cloud::{CloudClient, CloudError};
use crate::control::ControlApi;
use crate::identity::{AgentPaths, IdentityError};
use crate::issuance::{IssuanceProcessor, PollHandle, spawn_poll_task};
use crate::pairing::PairingManager;
use crate::queue::{JobQueue, QueueError};

/// Errors while bringing the agent up.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("No data directory configured and no platform default available")]
    NoDataDir,

    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Driver(#[from] DriverSelectError),
}

/// A running agent: the components plus the background tasks it owns.
pub struct Agent {
    paths: AgentPaths,
    queue: Arc<JobQueue>,
    pairing: Arc<PairingManager>,
    processor: Arc<IssuanceProcessor>,
    poll: Mutex<Option<PollHandle>>,
}

impl Agent {
    /// Build every component from `config`, selecting the card driver from
    /// the card section.
    pub async fn start(config: &Config) -> Result<Self, AgentError> {
        let encoder = select_driver(&config.card)?;
        Self::start_with_driver(config, encoder).await
    }

    /// Build every component around an already-chosen driver, resume a
    /// stored pairing, and start the poll loop.
    pub async fn start_with_driver(
        config: &Config,
        encoder: Arc<dyn CardDriver>,
    ) -> Result<Self, AgentError> {
        let data_dir: PathBuf = config
            .agent
            .resolved_data_dir()
            .ok_or(AgentError::NoDataDir)?;
        let paths = AgentPaths::new(data_dir);
        info!(data_dir = %paths.data_dir().display(), "Starting agent");

        let cloud = Arc::new(CloudClient::new(&config.cloud)?);
        let queue = Arc::new(JobQueue::open(&paths.queue_db(), config.agent.max_retries).await?);
        let pairing = Arc::new(PairingManager::load(
            Arc::clone(&cloud),
            Arc::clone(&queue),
            paths.clone(),
            config.agent.heartbeat_interval(),
        )?);
        let processor = Arc::new(IssuanceProcessor::new(
            cloud,
            encoder,
            Arc::clone(&queue),
            Arc::clone(&pairing),
        ));

        pairing.start().await;
        let poll = spawn_poll_task(Arc::clone(&processor), config.agent.poll_interval());

        Ok(Self {
            paths,
            queue,
            pairing,
            processor,
            poll: Mutex::new(Some(poll)),
        })
    }

    pub const fn paths(&self) -> &AgentPaths {
        &self.paths
    }

    /// The host-facing operations for this agent.
    pub fn control(&self) -> ControlApi {
        ControlApi::new(
            Arc::clone(&self.pairing),
            Arc::clone(&self.processor),
            Arc::clone(&self.queue),
        )
    }

    /// Stop both timers, wait for them, then close the queue.
    pub async fn shutdown(&self) {
        info!("Agent shutting down");
        self.pairing.stop().await;
        if let Some(poll) = self.poll.lock().await.take() {
            poll.stop().await;
        }
        self.queue.close().await;
        info!("Agent stopped");
    }
}
