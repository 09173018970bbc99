//! Shared configuration for the peerfetch edge proxy
//!
//! Reads from ~/.peerfetch/config.toml (or `PEERFETCH_CONFIG_FILE`).
//! The persisted peer identity lives in a separate file, see [`identity`].

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

pub mod identity;

pub use identity::{IdentityStore, PeerIdentity};

/// Default rendezvous service
pub const DEFAULT_SIGNALING_SERVER: &str = "ambianic-pnp.herokuapp.com";
pub const DEFAULT_PORT: u16 = 443;
pub const DEFAULT_SECURE: bool = true;
pub const DEFAULT_LOG_LEVEL: &str = "INFO";

/// PeerJS server mount path and API key
pub const DEFAULT_PATH: &str = "/";
pub const DEFAULT_KEY: &str = "peerjs";

pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 60;

/// Env var that relocates the whole peerfetch directory
pub const DIR_ENV: &str = "PEERFETCH_DIR";
/// Env var that redirects the config file
pub const CONFIG_FILE_ENV: &str = "PEERFETCH_CONFIG_FILE";
/// Env var that redirects the peer identity file
pub const PEERID_FILE_ENV: &str = "PEERFETCH_PEERID_FILE";

/// ICE server descriptor handed to the WebRTC stack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: None,
            credential: None,
        }
    }
}

/// Top-level config structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Rendezvous (PeerJS) host name
    #[serde(default = "default_signaling_server")]
    pub signaling_server: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Use https/wss towards the rendezvous service
    #[serde(default = "default_secure")]
    pub secure: bool,
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServerConfig>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Mount path of the PeerJS server
    #[serde(default = "default_path")]
    pub path: String,
    /// PeerJS API key
    #[serde(default = "default_key")]
    pub key: String,
    /// Upper bound for a single proxied HTTP fetch
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    /// Answer failed fetches with a status 500 header instead of silence
    #[serde(default)]
    pub report_fetch_failures: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            signaling_server: default_signaling_server(),
            port: default_port(),
            secure: default_secure(),
            ice_servers: default_ice_servers(),
            log_level: default_log_level(),
            path: default_path(),
            key: default_key(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            report_fetch_failures: false,
        }
    }
}

fn default_signaling_server() -> String {
    DEFAULT_SIGNALING_SERVER.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_secure() -> bool {
    DEFAULT_SECURE
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_path() -> String {
    DEFAULT_PATH.to_string()
}

fn default_key() -> String {
    DEFAULT_KEY.to_string()
}

fn default_fetch_timeout_secs() -> u64 {
    DEFAULT_FETCH_TIMEOUT_SECS
}

/// Same public servers the PeerJS client library ships with
pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![
        IceServerConfig::stun("stun:stun.l.google.com:19302"),
        IceServerConfig {
            urls: vec!["turn:0.peerjs.com:3478".to_string()],
            username: Some("peerjs".to_string()),
            credential: Some("peerjsp".to_string()),
        },
    ]
}

impl Config {
    /// Load config from `path`.
    ///
    /// Missing keys are filled with defaults. When the file does not exist
    /// the defaults are written back once so the operator has something to
    /// edit. Returns whether the file existed.
    pub fn load_from(path: &Path) -> Result<(Self, bool)> {
        if path.exists() {
            info!("Loading config from {}", path.display());
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?;
            config.validate()?;
            Ok((config, true))
        } else {
            info!("Config file not found: {}, writing defaults", path.display());
            let config = Config::default();
            config.save_to(path)?;
            Ok((config, false))
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;

        Ok(())
    }

    /// Reject values that parse but cannot work
    pub fn validate(&self) -> Result<()> {
        if self.signaling_server.trim().is_empty() {
            bail!("signaling_server must not be empty");
        }
        if self.port == 0 {
            bail!("port must be non-zero");
        }
        if self.fetch_timeout_secs == 0 {
            bail!("fetch_timeout_secs must be non-zero");
        }
        if let Some(server) = self.ice_servers.iter().find(|s| s.urls.is_empty()) {
            bail!("ice server entry has no urls: {:?}", server);
        }
        Ok(())
    }

    /// `http`/`https` base URL of the rendezvous service, ending in the mount path
    pub fn http_base_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{}://{}:{}{}", scheme, self.signaling_server, self.port, self.normalized_path())
    }

    /// `ws`/`wss` base URL of the rendezvous service, ending in the mount path
    pub fn ws_base_url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{}://{}:{}{}", scheme, self.signaling_server, self.port, self.normalized_path())
    }

    fn normalized_path(&self) -> String {
        let mut path = self.path.clone();
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        if !path.ends_with('/') {
            path.push('/');
        }
        path
    }
}

/// Get the peerfetch directory (~/.peerfetch)
pub fn get_peerfetch_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DIR_ENV) {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".peerfetch")
}

/// Get the config file path (~/.peerfetch/config.toml)
pub fn get_config_path() -> PathBuf {
    if let Ok(file) = std::env::var(CONFIG_FILE_ENV) {
        return PathBuf::from(file);
    }
    get_peerfetch_dir().join("config.toml")
}

/// Get the peer identity file path (~/.peerfetch/peerid.json)
pub fn get_peerid_path() -> PathBuf {
    if let Ok(file) = std::env::var(PEERID_FILE_ENV) {
        return PathBuf::from(file);
    }
    get_peerfetch_dir().join("peerid.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.signaling_server, "ambianic-pnp.herokuapp.com");
        assert_eq!(config.port, 443);
        assert!(config.secure);
        assert_eq!(config.log_level, "INFO");
        assert!(!config.ice_servers.is_empty());
        assert!(!config.report_fetch_failures);
    }

    #[test]
    fn test_parse_partial_config() {
        let config: Config = toml::from_str(r#"signaling_server = "localhost""#).unwrap();
        assert_eq!(config.signaling_server, "localhost");
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.secure, DEFAULT_SECURE);
        assert_eq!(config.ice_servers, default_ice_servers());
        assert_eq!(config.log_level, DEFAULT_LOG_LEVEL);
    }

    #[test]
    fn test_bootstrap_writes_defaults_once() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("nested").join("config.toml");

        let (config, existed) = Config::load_from(&path)?;
        assert!(!existed);
        assert!(path.exists());
        assert_eq!(config, Config::default());

        let (reloaded, existed) = Config::load_from(&path)?;
        assert!(existed);
        assert_eq!(reloaded, config);
        Ok(())
    }

    #[test]
    fn test_partial_file_roundtrip_is_stable() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("config.toml");
        fs::write(&path, "signaling_server = \"pnp.local\"\n")?;

        let (config, existed) = Config::load_from(&path)?;
        assert!(existed);
        assert_eq!(config.signaling_server, "pnp.local");
        assert_eq!(config.port, DEFAULT_PORT);

        config.save_to(&path)?;
        let (reloaded, _) = Config::load_from(&path)?;
        assert_eq!(reloaded, config);
        Ok(())
    }

    #[test]
    fn test_existing_file_is_not_rewritten() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("config.toml");
        let original = "signaling_server = \"pnp.local\"\n";
        fs::write(&path, original)?;

        Config::load_from(&path)?;
        assert_eq!(fs::read_to_string(&path)?, original);
        Ok(())
    }

    #[test]
    fn test_malformed_config_is_rejected() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("config.toml");
        fs::write(&path, "port = \"not a number\"")?;
        assert!(Config::load_from(&path).is_err());

        fs::write(&path, "port = 0")?;
        assert!(Config::load_from(&path).is_err());

        fs::write(&path, "[[ice_servers]]\nurls = []\n")?;
        assert!(Config::load_from(&path).is_err());

        fs::write(&path, "fetch_timeout_secs = 0")?;
        assert!(Config::load_from(&path).is_err());
        Ok(())
    }

    #[test]
    fn test_base_urls() {
        let mut config = Config {
            signaling_server: "localhost".to_string(),
            port: 9779,
            secure: false,
            ..Default::default()
        };
        assert_eq!(config.http_base_url(), "http://localhost:9779/");
        assert_eq!(config.ws_base_url(), "ws://localhost:9779/");

        config.secure = true;
        config.path = "pnp".to_string();
        assert_eq!(config.http_base_url(), "https://localhost:9779/pnp/");
        assert_eq!(config.ws_base_url(), "wss://localhost:9779/pnp/");
    }
}
