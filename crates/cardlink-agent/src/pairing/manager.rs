//! Pairing state machine and identity ownership.

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::cloud::{CloudClient, CloudError, DeviceDescriptor, PairingRequest};
use crate::identity::{AgentIdentity, AgentPaths, IdentityError};
use crate::queue::JobQueue;

use super::heartbeat::{HeartbeatHandle, spawn_heartbeat_task};

/// Pairing errors.
#[derive(Debug, thiserror::Error)]
pub enum PairingError {
    #[error("Pairing already in progress")]
    InProgress,

    #[error("{0}")]
    InvalidInput(String),

    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error(transparent)]
    Identity(#[from] IdentityError),
}

/// Where the agent is in the pairing lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingState {
    Unpaired,
    Pairing,
    Paired,
}

/// Owns the agent identity, the pairing handshake, and the heartbeat.
pub struct PairingManager {
    cloud: Arc<CloudClient>,
    queue: Arc<JobQueue>,
    paths: AgentPaths,
    heartbeat_interval: Duration,
    state: Mutex<PairingState>,
    identity: RwLock<AgentIdentity>,
    heartbeat: tokio::sync::Mutex<Option<HeartbeatHandle>>,
}

impl PairingManager {
    /// Load the stored identity (if any) from `paths`.
    pub fn load(
        cloud: Arc<CloudClient>,
        queue: Arc<JobQueue>,
        paths: AgentPaths,
        heartbeat_interval: Duration,
    ) -> Result<Self, IdentityError> {
        let identity = AgentIdentity::load(&paths.identity_file())?;
        let state = if identity.is_paired() {
            PairingState::Paired
        } else {
            PairingState::Unpaired
        };
        info!(paired = identity.is_paired(), agent_id = ?identity.agent_id, "Identity loaded");

        Ok(Self {
            cloud,
            queue,
            paths,
            heartbeat_interval,
            state: Mutex::new(state),
            identity: RwLock::new(identity),
            heartbeat: tokio::sync::Mutex::new(None),
        })
    }

    pub fn state(&self) -> PairingState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn identity(&self) -> AgentIdentity {
        self.identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_paired(&self) -> bool {
        self.identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_paired()
    }

    pub fn agent_id(&self) -> Option<String> {
        self.identity().agent_id
    }

    pub fn agent_name(&self) -> Option<String> {
        self.identity().agent_name
    }

    pub fn agent_token(&self) -> Option<String> {
        self.identity().agent_token
    }

    /// Resume a stored pairing: install the token and start the heartbeat.
    pub async fn start(&self) {
        let identity = self.identity();
        if let (Some(agent_id), Some(token)) = (identity.agent_id, identity.agent_token) {
            self.cloud.set_token(Some(token));
            self.restart_heartbeat(agent_id).await;
        }
    }

    /// Stop the heartbeat task.
    pub async fn stop(&self) {
        if let Some(handle) = self.heartbeat.lock().await.take() {
            handle.stop().await;
        }
    }

    /// Exchange a one-time pairing token for agent credentials.
    ///
    /// On failure nothing local changes and the cloud's message is returned
    /// as-is. On success the new identity replaces any previous one.
    pub async fn pair(&self, pairing_token: &str, agent_name: &str) -> Result<String, PairingError> {
        let pairing_token = pairing_token.trim();
        let agent_name = agent_name.trim();
        if pairing_token.is_empty() {
            return Err(PairingError::InvalidInput("Pairing token is required".into()));
        }
        if agent_name.is_empty() {
            return Err(PairingError::InvalidInput("Agent name is required".into()));
        }

        let mut attempt = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state == PairingState::Pairing {
                return Err(PairingError::InProgress);
            }
            let previous = std::mem::replace(&mut *state, PairingState::Pairing);
            PairingAttempt {
                state: &self.state,
                previous: Some(previous),
            }
        };

        match self.handshake(pairing_token, agent_name).await {
            Ok(identity) => {
                let agent_id = identity.agent_id.clone().unwrap_or_default();
                self.cloud.set_token(identity.agent_token.clone());
                *self.identity.write().unwrap_or_else(PoisonError::into_inner) = identity;
                attempt.finish(PairingState::Paired);
                info!(agent_id = %agent_id, agent_name, "Agent paired");
                self.restart_heartbeat(agent_id.clone()).await;
                Ok(agent_id)
            }
            Err(e) => {
                drop(attempt);
                warn!(error = %e, "Pairing failed");
                Err(e)
            }
        }
    }

    /// Talk to the cloud and persist the result; touches no in-memory state.
    async fn handshake(
        &self,
        pairing_token: &str,
        agent_name: &str,
    ) -> Result<AgentIdentity, PairingError> {
        let device_info = DeviceDescriptor::current();
        let installation_id = uuid::Uuid::new_v4().to_string();
        let request = PairingRequest {
            pairing_token: pairing_token.to_string(),
            agent_name: agent_name.to_string(),
            fingerprint: fingerprint(&device_info, &installation_id),
            device_info,
        };

        let response = self.cloud.confirm_pairing(&request).await?;
        let identity = AgentIdentity {
            agent_id: Some(response.agent_id),
            agent_name: Some(agent_name.to_string()),
            agent_token: Some(response.agent_token),
            paired_at: Some(Utc::now()),
        };
        identity.save(&self.paths.identity_file())?;
        Ok(identity)
    }

    async fn restart_heartbeat(&self, agent_id: String) {
        let mut slot = self.heartbeat.lock().await;
        if let Some(old) = slot.take() {
            old.stop().await;
        }
        *slot = Some(spawn_heartbeat_task(
            Arc::clone(&self.cloud),
            Arc::clone(&self.queue),
            agent_id,
            self.heartbeat_interval,
        ));
    }
}

/// An in-flight pairing. Restores the prior state when dropped unless
/// [`PairingAttempt::finish`] ran, so a cancelled `pair` never leaves the
/// manager stuck in `Pairing`.
struct PairingAttempt<'a> {
    state: &'a Mutex<PairingState>,
    previous: Option<PairingState>,
}

impl PairingAttempt<'_> {
    fn finish(&mut self, next: PairingState) {
        self.previous = None;
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }
}

impl Drop for PairingAttempt<'_> {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            *self.state.lock().unwrap_or_else(PoisonError::into_inner) = previous;
        }
    }
}

/// Hex SHA-256 of `platform|arch|installation_id`.
pub fn fingerprint(device: &DeviceDescriptor, installation_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(device.platform.as_bytes());
    hasher.update(b"|");
    hasher.update(device.arch.as_bytes());
    hasher.update(b"|");
    hasher.update(installation_id.as_bytes());
    hex::encode(hasher.finalize())
}
