//! Persisted peer identity
//!
//! The rendezvous service hands out peer ids. Reusing the same id across
//! restarts lets remote clients find this device again, so the last id the
//! service confirmed is kept in a small JSON file: `{"peerId": "..."}`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// On-disk identity record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdentity {
    #[serde(rename = "peerId", default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
}

/// Remembers the peer id assigned by the rendezvous service.
///
/// The store never generates ids itself.
#[derive(Debug, Clone)]
pub struct IdentityStore {
    path: PathBuf,
}

impl IdentityStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at the default location (~/.peerfetch/peerid.json)
    pub fn open_default() -> Self {
        Self::new(crate::get_peerid_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the persisted id. A missing file means first run.
    pub fn load(&self) -> Result<Option<String>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read identity file {}", self.path.display()))?;
        if content.trim().is_empty() {
            return Ok(None);
        }
        let identity: PeerIdentity = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse identity file {}", self.path.display()))?;
        Ok(identity.peer_id.filter(|id| !id.is_empty()))
    }

    /// Overwrite the persisted id
    pub fn save(&self, peer_id: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let identity = PeerIdentity {
            peer_id: Some(peer_id.to_string()),
        };
        let content = serde_json::to_string(&identity)?;
        fs::write(&self.path, content)
            .with_context(|| format!("Failed to write identity file {}", self.path.display()))?;
        Ok(())
    }
}
