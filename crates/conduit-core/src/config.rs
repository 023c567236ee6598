//! Broker configuration.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $CONDUIT_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/conduit/config.toml
//!   3. ~/.config/conduit/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Port brokers listen on unless configured otherwise. Endpoint lists that
/// omit a port resolve to this value.
pub const DEFAULT_BROKER_PORT: u16 = 28100;

/// Top-level broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub network: NetworkConfig,
    pub tls: TlsPaths,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Bind address for the block transfer listener.
    pub host: String,
    pub port: u16,
    /// Fixed peer id (hyphenated uuid). Empty = generated at startup.
    pub peer_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsPaths {
    pub private_key_file: PathBuf,
    pub certificate_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Chunk store root. Empty = storage disabled (pure dispatch broker).
    pub root: PathBuf,
    /// Use the single-file append log instead of one file per chunk.
    pub single_file: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            tls: TlsPaths::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_BROKER_PORT,
            peer_id: String::new(),
        }
    }
}

impl Default for TlsPaths {
    fn default() -> Self {
        Self {
            private_key_file: config_dir().join("broker-key.pem"),
            certificate_file: config_dir().join("broker-cert.pem"),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::new(),
            single_file: false,
        }
    }
}

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_or_tmp().join(".config"))
        .join("conduit")
}

fn home_or_tmp() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
}

impl BrokerConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            BrokerConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn file_path() -> PathBuf {
        std::env::var("CONDUIT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Apply CONDUIT_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CONDUIT_NETWORK__HOST") {
            self.network.host = v;
        }
        if let Ok(v) = std::env::var("CONDUIT_NETWORK__PORT") {
            if let Ok(p) = v.parse() {
                self.network.port = p;
            }
        }
        if let Ok(v) = std::env::var("CONDUIT_NETWORK__PEER_ID") {
            self.network.peer_id = v;
        }
        if let Ok(v) = std::env::var("CONDUIT_TLS__PRIVATE_KEY_FILE") {
            self.tls.private_key_file = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("CONDUIT_TLS__CERTIFICATE_FILE") {
            self.tls.certificate_file = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("CONDUIT_STORAGE__ROOT") {
            self.storage.root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("CONDUIT_STORAGE__SINGLE_FILE") {
            self.storage.single_file = v == "true" || v == "1";
        }
    }
}
