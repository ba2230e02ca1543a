//! Wire types for the cloud REST API.

use serde::{Deserialize, Serialize};

use crate::card::CardPayload;

/// Status of a cloud issuance job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Done,
    Failed,
}

impl JobStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

/// A card issuance request created in the cloud.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuanceJob {
    pub id: String,
    #[serde(alias = "cardPayload")]
    pub card_payload: CardPayload,
    #[serde(default = "pending")]
    pub status: JobStatus,
}

const fn pending() -> JobStatus {
    JobStatus::Pending
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CardIssueList {
    #[serde(default)]
    pub card_issues: Vec<IssuanceJob>,
}

/// Host description sent with a pairing request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDescriptor {
    pub platform: String,
    pub arch: String,
    pub agent_version: String,
}

impl DeviceDescriptor {
    /// Describe the running host.
    pub fn current() -> Self {
        Self {
            platform: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Body of `POST /pairing/confirm`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingRequest {
    pub pairing_token: String,
    pub agent_name: String,
    pub fingerprint: String,
    pub device_info: DeviceDescriptor,
}

/// Credentials returned by a successful pairing.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingResponse {
    pub agent_id: String,
    pub agent_token: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct StatusUpdate<'a> {
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<&'a serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub(crate) struct AgentEvent<'a> {
    #[serde(rename = "type")]
    pub kind: &'a str,
    pub data: &'a serde_json::Value,
}
