//! Pairing with the cloud and the liveness heartbeat.

mod heartbeat;
mod manager;

pub use heartbeat::{HeartbeatHandle, spawn_heartbeat_task};
pub use manager::{PairingError, PairingManager, PairingState, fingerprint};
