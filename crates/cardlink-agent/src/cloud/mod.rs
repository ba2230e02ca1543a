//! Cloud service integration.
//!
//! Provides a reqwest-based client for pairing, issuance jobs, status
//! reporting, and the agent event log.

mod client;
pub mod types;

pub use client::{CloudClient, CloudError, best_effort};
pub use types::{DeviceDescriptor, IssuanceJob, JobStatus, PairingRequest, PairingResponse};
