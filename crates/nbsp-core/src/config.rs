//! Configuration system for NBSProxy.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $NBSP_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/nbsp/config.toml
//!   3. ~/.config/nbsp/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::wire::{ProtocolVersion, PROTOCOL_VERSION};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NbspConfig {
    /// Local protocol version, `major.minor.patch`.
    pub protocol_version: String,
    pub store: StoreConfig,
    pub client: ClientConfig,
    pub proxy: ProxyConfig,
    pub ledger: LedgerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite file backing the key/value table.
    pub path: PathBuf,
    /// Worker thread retires after this long without requests.
    pub idle_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Package id of the proxy app.
    pub proxy_app_id: String,
    /// How long a registration waits for the proxy's answer.
    pub registration_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// NBS port reserved for the proxy itself; client apps cannot
    /// register it.
    pub port: u16,
    /// Permission required before anything is handed to the carrier.
    pub send_permission: String,
    /// Largest payload accepted for one outbound frame.
    pub max_payload: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Hourly rows older than this are folded into the all-time row.
    /// 0 = keep every hour forever.
    pub retention_hours: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NbspConfig {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            store: StoreConfig::default(),
            client: ClientConfig::default(),
            proxy: ProxyConfig::default(),
            ledger: LedgerConfig::default(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: data_dir().join("nbsp.db"),
            idle_timeout_ms: 10_000,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            proxy_app_id: "org.eehouse.android.nbsp".to_string(),
            registration_timeout_ms: 20_000,
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: 3344,
            send_permission: "android.permission.SEND_SMS".to_string(),
            max_payload: crate::wire::MAX_NBS_PAYLOAD,
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self { retention_hours: 0 }
    }
}

impl StoreConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

impl ClientConfig {
    pub fn registration_timeout(&self) -> Duration {
        Duration::from_millis(self.registration_timeout_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("nbsp")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("nbsp")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid protocol_version {0:?}")]
    BadVersion(String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl NbspConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::file_path())
    }

    /// Load from an explicit file, still honouring env overrides.
    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?
        } else {
            NbspConfig::default()
        };
        config.apply_env_overrides();
        config.version()?;
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("NBSP_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&NbspConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// The parsed local protocol version.
    pub fn version(&self) -> Result<ProtocolVersion, ConfigError> {
        self.protocol_version
            .parse()
            .map_err(|_| ConfigError::BadVersion(self.protocol_version.clone()))
    }

    /// Apply NBSP_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("NBSP_STORE__PATH") {
            self.store.path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("NBSP_STORE__IDLE_TIMEOUT_MS") {
            if let Ok(ms) = v.parse() {
                self.store.idle_timeout_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("NBSP_CLIENT__PROXY_APP_ID") {
            self.client.proxy_app_id = v;
        }
        if let Ok(v) = std::env::var("NBSP_CLIENT__REGISTRATION_TIMEOUT_MS") {
            if let Ok(ms) = v.parse() {
                self.client.registration_timeout_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("NBSP_PROXY__PORT") {
            if let Ok(p) = v.parse() {
                self.proxy.port = p;
            }
        }
        if let Ok(v) = std::env::var("NBSP_LEDGER__RETENTION_HOURS") {
            if let Ok(h) = v.parse() {
                self.ledger.retention_hours = h;
            }
        }
    }
}
