//! Cloud REST client.
//!
//! All calls share one `reqwest::Client` with bounded connect and request
//! timeouts. The bearer token is installed after pairing and attached to
//! every authenticated call.

use std::future::Future;
use std::sync::{PoisonError, RwLock};

use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, warn};

use cardlink_core::config::CloudConfig;

use super::types::{
    AgentEvent, CardIssueList, IssuanceJob, JobStatus, PairingRequest, PairingResponse,
    StatusUpdate,
};

/// Cloud API client errors.
#[derive(Debug, Error)]
pub enum CloudError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{message}")]
    Api { status: u16, message: String },

    #[error("Unexpected response body: {0}")]
    Decode(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Agent is not paired")]
    NotPaired,
}

impl CloudError {
    /// True when the cloud could not be reached at all (connect failure or
    /// timeout), as opposed to the cloud answering with an error.
    pub fn is_connectivity(&self) -> bool {
        match self {
            Self::Http(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            _ => false,
        }
    }

    /// True for a 4xx answer from the cloud.
    pub const fn is_client_rejection(&self) -> bool {
        matches!(self, Self::Api { status, .. } if *status >= 400 && *status < 500)
    }
}

/// Client for the cloud issuance service.
#[derive(Debug)]
pub struct CloudClient {
    http: reqwest::Client,
    base_url: String,
    base: reqwest::Url,
    token: RwLock<Option<String>>,
}

impl CloudClient {
    pub fn new(config: &CloudConfig) -> Result<Self, CloudError> {
        if config.base_url.trim().is_empty() {
            return Err(CloudError::Config("base_url is empty".into()));
        }

        // reqwest is built with rustls-no-provider; an Err here only means a
        // provider is already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .build()?;

        let base_url = config.base_url.trim().trim_end_matches('/').to_string();
        let base = reqwest::Url::parse(&base_url)
            .map_err(|e| CloudError::Config(format!("Invalid base_url {base_url}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(CloudError::Config(format!("Invalid base_url {base_url}")));
        }
        Ok(Self {
            http,
            base_url,
            base,
            token: RwLock::new(None),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Install (or clear) the bearer token used for authenticated calls.
    pub fn set_token(&self, token: Option<String>) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = token;
    }

    /// Base URL with `segments` appended, each percent-encoded as a single
    /// path segment.
    fn url(&self, segments: &[&str]) -> reqwest::Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn authorized(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::RequestBuilder, CloudError> {
        let token = self
            .token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(CloudError::NotPaired)?;
        Ok(builder.bearer_auth(token))
    }

    /// Turn a non-success response into `CloudError::Api`, surfacing the
    /// body's `error` or `message` field when present.
    async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, CloudError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        let message = error_message(&body).unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("Unknown error")
                .to_string()
        });
        Err(CloudError::Api {
            status: status.as_u16(),
            message,
        })
    }

    async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, CloudError> {
        let bytes = resp.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| CloudError::Decode(e.to_string()))
    }

    /// Exchange a one-time pairing token for agent credentials.
    pub async fn confirm_pairing(
        &self,
        request: &PairingRequest,
    ) -> Result<PairingResponse, CloudError> {
        let resp = self
            .http
            .post(self.url(&["pairing", "confirm"]))
            .json(request)
            .send()
            .await?;
        let resp = Self::check_status(resp).await?;
        Self::decode(resp).await
    }

    /// Pending issuance jobs assigned to this agent.
    pub async fn list_pending_jobs(&self, agent_id: &str) -> Result<Vec<IssuanceJob>, CloudError> {
        let mut url = self.url(&["card-issues"]);
        url.query_pairs_mut()
            .append_pair("agent", agent_id)
            .append_pair("status", "pending");
        let resp = self.authorized(self.http.get(url))?.send().await?;
        let resp = Self::check_status(resp).await?;
        let list: CardIssueList = Self::decode(resp).await?;
        debug!(count = list.card_issues.len(), "Fetched pending card issues");
        Ok(list.card_issues)
    }

    /// Report a job's lifecycle transition.
    pub async fn update_job_status(
        &self,
        job_id: &str,
        status: JobStatus,
        metadata: Option<&serde_json::Value>,
    ) -> Result<(), CloudError> {
        let url = self.url(&["card-issues", job_id, "status"]);
        let body = StatusUpdate { status, metadata };
        let resp = self
            .authorized(self.http.patch(url))?
            .json(&body)
            .send()
            .await?;
        Self::check_status(resp).await?;
        Ok(())
    }

    /// Append an event to this agent's cloud log.
    pub async fn log_event(
        &self,
        agent_id: &str,
        kind: &str,
        data: &serde_json::Value,
    ) -> Result<(), CloudError> {
        let url = self.url(&["agents", agent_id, "log"]);
        let body = AgentEvent { kind, data };
        let resp = self
            .authorized(self.http.post(url))?
            .json(&body)
            .send()
            .await?;
        Self::check_status(resp).await?;
        Ok(())
    }
}

fn error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    ["error", "message"]
        .iter()
        .find_map(|key| value.get(key).and_then(|v| v.as_str()))
        .map(str::to_string)
}

/// Await a secondary cloud write whose failure must not affect the caller.
pub async fn best_effort<T, F>(label: &str, fut: F) -> Option<T>
where
    F: Future<Output = Result<T, CloudError>>,
{
    match fut.await {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(op = label, error = %e, "Best-effort cloud call failed");
            None
        }
    }
}
