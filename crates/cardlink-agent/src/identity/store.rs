//! Persistent agent credentials.
//!
//! The identity lives in a single JSON file written with an atomic
//! temp-file + fsync + rename, so a crash mid-write leaves either the old
//! or the new credentials on disk, never a torn file.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Errors from loading or saving the identity file.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("Identity file I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("Identity file is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Credentials issued by the cloud on pairing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentIdentity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paired_at: Option<DateTime<Utc>>,
}

impl AgentIdentity {
    /// Paired means both an id and a bearer token are present.
    pub const fn is_paired(&self) -> bool {
        self.agent_id.is_some() && self.agent_token.is_some()
    }

    /// Load the identity. A missing file is an unpaired identity.
    pub fn load(path: &Path) -> Result<Self, IdentityError> {
        match fs::read_to_string(path) {
            Ok(data) => Ok(serde_json::from_str(&data)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the identity file on disk.
    pub fn save(&self, path: &Path) -> Result<(), IdentityError> {
        let json = serde_json::to_string_pretty(self)?;
        atomic_write(path, json.as_bytes())?;
        Ok(())
    }
}

fn atomic_write(path: &Path, content: &[u8]) -> io::Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "identity path has no file name"))?;
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let tmp_path = dir.join(format!(".{file_name}.tmp.{nanos}"));

    let result = (|| -> io::Result<()> {
        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&tmp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)?;

        if let Ok(parent) = fs::File::open(dir) {
            let _ = parent.sync_all();
        }
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

/// Locations of the agent's persisted state.
#[derive(Debug, Clone)]
pub struct AgentPaths {
    data_dir: PathBuf,
}

impl AgentPaths {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn identity_file(&self) -> PathBuf {
        self.data_dir.join("identity.json")
    }

    pub fn queue_db(&self) -> PathBuf {
        self.data_dir.join("queue.db")
    }
}
