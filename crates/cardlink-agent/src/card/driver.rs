//! The `CardDriver` contract and the startup driver factory.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use cardlink_core::config::{CardConfig, CardDriverKind};

use super::layout::CardPayload;
use super::simulated::SimulatedDriver;

/// Outcome of a single encode attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodeResult {
    pub success: bool,
    #[serde(rename = "cardUID", default, skip_serializing_if = "Option::is_none")]
    pub card_uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EncodeResult {
    pub fn success(card_uid: impl Into<String>) -> Self {
        Self {
            success: true,
            card_uid: Some(card_uid.into()),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            card_uid: None,
            error: Some(error.into()),
        }
    }
}

/// Reader details reported by [`CardDriver::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub name: String,
    pub driver: String,
    pub card_present: bool,
}

/// Whether a reader is attached, and which.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    pub connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_info: Option<DeviceInfo>,
}

impl DeviceStatus {
    pub const fn disconnected() -> Self {
        Self {
            connected: false,
            device_info: None,
        }
    }
}

/// Exclusive access to one card encoder.
///
/// Implementations never issue two encode sequences at once; a concurrent
/// call fails fast with a busy error.
#[async_trait]
pub trait CardDriver: Send + Sync {
    /// Write `payload` onto the presented card.
    async fn encode_card(&self, payload: &CardPayload) -> EncodeResult;

    /// Current reader state, without touching the hardware.
    fn status(&self) -> DeviceStatus;
}

/// Errors from [`select_driver`].
#[derive(Debug, thiserror::Error)]
pub enum DriverSelectError {
    #[error("PC/SC support is not compiled in (enable the `pcsc` feature)")]
    PcscUnavailable,

    #[error("PC/SC service unavailable: {0}")]
    PcscService(String),
}

/// Pick the card driver once at process start.
///
/// `auto` prefers a PC/SC reader when the service is reachable and falls
/// back to the simulated driver otherwise; `pcsc` fails instead of falling
/// back.
pub fn select_driver(config: &CardConfig) -> Result<Arc<dyn CardDriver>, DriverSelectError> {
    match config.driver {
        CardDriverKind::Simulated => {
            info!(delay_ms = config.simulated_delay_ms, "Using simulated card driver");
            Ok(Arc::new(SimulatedDriver::new(config.simulated_delay())))
        }
        CardDriverKind::Pcsc => start_pcsc(config),
        CardDriverKind::Auto => match start_pcsc(config) {
            Ok(driver) => Ok(driver),
            Err(e) => {
                warn!(error = %e, "No PC/SC reader service, falling back to simulated driver");
                Ok(Arc::new(SimulatedDriver::new(config.simulated_delay())))
            }
        },
    }
}

#[cfg(feature = "pcsc")]
fn start_pcsc(config: &CardConfig) -> Result<Arc<dyn CardDriver>, DriverSelectError> {
    use super::reader::{ReaderConfig, ReaderDriver};

    let driver = Arc::new(ReaderDriver::new(ReaderConfig::from(config)));
    super::pcsc::spawn_monitor(Arc::clone(&driver))
        .map_err(|e| DriverSelectError::PcscService(e.to_string()))?;
    info!("Using PC/SC card driver");
    Ok(driver)
}

#[cfg(not(feature = "pcsc"))]
#[allow(clippy::unnecessary_wraps)]
fn start_pcsc(_config: &CardConfig) -> Result<Arc<dyn CardDriver>, DriverSelectError> {
    Err(DriverSelectError::PcscUnavailable)
}
