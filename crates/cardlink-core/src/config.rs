//! Configuration resolution for Cardlink.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (`<config_dir>/cardlink/settings.json`)
//! 3. Environment variables
//! 4. CLI arguments (highest priority, applied by the binary)

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Complete Cardlink agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub cloud: CloudConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub card: CardConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Cloud service connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    pub base_url: String,
    /// Upper bound on any single cloud request, including body transfer.
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:3000/api".to_string(),
            request_timeout_secs: 15,
            connect_timeout_secs: 5,
        }
    }
}

impl CloudConfig {
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Agent scheduling and persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Directory holding `identity.json` and `queue.db`.
    pub data_dir: Option<PathBuf>,
    pub heartbeat_interval_secs: u64,
    pub poll_interval_secs: u64,
    /// Replay attempts before a queued job is abandoned.
    pub max_retries: i64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            heartbeat_interval_secs: 30,
            poll_interval_secs: 5,
            max_retries: 5,
        }
    }
}

impl AgentConfig {
    /// Heartbeat period; a configured zero is treated as one second.
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(at_least_one(self.heartbeat_interval_secs))
    }

    /// Poll period; a configured zero is treated as one second.
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(at_least_one(self.poll_interval_secs))
    }

    /// Resolve the data directory, falling back to the platform default.
    pub fn resolved_data_dir(&self) -> Option<PathBuf> {
        self.data_dir.clone().or_else(default_data_dir)
    }
}

/// Which card driver implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CardDriverKind {
    /// Use a PC/SC reader when the platform provides one, else simulate.
    #[default]
    Auto,
    Pcsc,
    Simulated,
}

impl CardDriverKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Pcsc => "pcsc",
            Self::Simulated => "simulated",
        }
    }
}

impl FromStr for CardDriverKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "pcsc" => Ok(Self::Pcsc),
            "simulated" | "mock" => Ok(Self::Simulated),
            other => Err(Error::Config(format!("Unknown card driver: {other}"))),
        }
    }
}

/// Card reader settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CardConfig {
    pub driver: CardDriverKind,
    /// How long to wait for a card to be tapped once a reader is attached.
    pub presence_timeout_secs: u64,
    pub presence_poll_interval_ms: u64,
    /// Artificial encode latency of the simulated driver.
    pub simulated_delay_ms: u64,
    /// Block that receives the 16-byte card layout.
    pub target_block: u8,
}

impl Default for CardConfig {
    fn default() -> Self {
        Self {
            driver: CardDriverKind::Auto,
            presence_timeout_secs: 10,
            presence_poll_interval_ms: 250,
            simulated_delay_ms: 1500,
            target_block: 4,
        }
    }
}

impl CardConfig {
    pub const fn presence_timeout(&self) -> Duration {
        Duration::from_secs(self.presence_timeout_secs)
    }

    pub const fn presence_poll_interval(&self) -> Duration {
        Duration::from_millis(at_least_one(self.presence_poll_interval_ms))
    }

    pub const fn simulated_delay(&self) -> Duration {
        Duration::from_millis(self.simulated_delay_ms)
    }
}

/// Local control API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub enabled: bool,
    pub addr: SocketAddr,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            addr: SocketAddr::from(([127, 0, 0, 1], 7891)),
        }
    }
}

const fn at_least_one(value: u64) -> u64 {
    if value == 0 { 1 } else { value }
}

/// Load configuration with hierarchical resolution.
///
/// `explicit_path` replaces the global config file when given; a missing
/// explicit file is an error, a missing global file is not.
pub fn load_config(explicit_path: Option<&Path>) -> Result<Config> {
    let mut config = match explicit_path {
        Some(path) => load_config_file(path)?,
        None => match global_config_path() {
            Some(path) if path.exists() => load_config_file(&path)?,
            _ => Config::default(),
        },
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("cardlink").join("settings.json"))
}

/// Default directory for agent state: `<data_dir>/cardlink`.
pub fn default_data_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("cardlink"))
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Apply `CARDLINK_*` overrides using the provided variable lookup.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(val) = lookup("CARDLINK_CLOUD_URL") {
        config.cloud.base_url = val;
    }
    if let Some(val) = lookup("CARDLINK_DATA_DIR") {
        config.agent.data_dir = Some(PathBuf::from(val));
    }
    if let Some(val) = lookup("CARDLINK_CARD_DRIVER") {
        config.card.driver = val.parse()?;
    }
    if let Some(val) = lookup("CARDLINK_LOG_LEVEL") {
        config.log_level = val;
    }
    if let Some(val) = lookup("CARDLINK_CONTROL_ADDR") {
        config.control.addr = val
            .parse()
            .map_err(|e| Error::Config(format!("Invalid CARDLINK_CONTROL_ADDR {val}: {e}")))?;
    }
    if let Some(val) = lookup("CARDLINK_POLL_INTERVAL_SECS")
        && let Ok(n) = val.parse()
    {
        config.agent.poll_interval_secs = n;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_match_agent_contract() {
        let config = Config::default();
        assert_eq!(config.agent.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.agent.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.agent.max_retries, 5);
        assert_eq!(config.card.presence_timeout(), Duration::from_secs(10));
        assert_eq!(config.card.driver, CardDriverKind::Auto);
        assert!(config.control.addr.ip().is_loopback());
    }

    #[test]
    fn zero_intervals_are_clamped() {
        let config: Config = serde_json::from_str(
            r#"{
                "agent": { "heartbeat_interval_secs": 0, "poll_interval_secs": 0 },
                "card": { "presence_poll_interval_ms": 0 }
            }"#,
        )
        .unwrap();
        assert_eq!(config.agent.heartbeat_interval(), Duration::from_secs(1));
        assert_eq!(config.agent.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.card.presence_poll_interval(), Duration::from_millis(1));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let config: Config =
            serde_json::from_str(r#"{ "cloud": { "base_url": "https://cloud.test" } }"#).unwrap();
        assert_eq!(config.cloud.base_url, "https://cloud.test");
        assert_eq!(config.cloud.request_timeout_secs, 15);
        assert_eq!(config.agent.max_retries, 5);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn driver_kind_parses_case_insensitively() {
        assert_eq!("PCSC".parse::<CardDriverKind>().unwrap(), CardDriverKind::Pcsc);
        assert_eq!(
            "mock".parse::<CardDriverKind>().unwrap(),
            CardDriverKind::Simulated
        );
        assert!("nfc-magic".parse::<CardDriverKind>().is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            ("CARDLINK_CLOUD_URL", "https://cloud.example"),
            ("CARDLINK_CARD_DRIVER", "simulated"),
            ("CARDLINK_CONTROL_ADDR", "127.0.0.1:9000"),
            ("CARDLINK_DATA_DIR", "/var/lib/cardlink"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        apply_env_overrides(&mut config, |k| vars.get(k).map(ToString::to_string)).unwrap();

        assert_eq!(config.cloud.base_url, "https://cloud.example");
        assert_eq!(config.card.driver, CardDriverKind::Simulated);
        assert_eq!(config.control.addr.port(), 9000);
        assert_eq!(
            config.agent.resolved_data_dir(),
            Some(PathBuf::from("/var/lib/cardlink"))
        );
    }

    #[test]
    fn invalid_control_addr_is_config_error() {
        let mut config = Config::default();
        let err = apply_env_overrides(&mut config, |k| {
            (k == "CARDLINK_CONTROL_ADDR").then(|| "not-an-addr".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn explicit_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_config(Some(&dir.path().join("absent.json")));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
