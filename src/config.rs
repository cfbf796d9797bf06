//! Configuration loading and management.

use crate::blocker::Policy;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

/// Daemon configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub enforcement: EnforcementConfig,
    #[serde(default)]
    pub sweep: SweepConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.policy.to_policy().is_valid() {
            return Err(ConfigError::Invalid(
                "policy attempts, period and blocktime must all be at least 1",
            ));
        }
        if self.sweep.interval_secs == 0 {
            return Err(ConfigError::Invalid("sweep interval must be at least 1s"));
        }
        Ok(())
    }
}

/// API listener configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the API listens on.
    pub listen: SocketAddr,
    /// Require the `key` query parameter on every API request.
    pub api_key_enabled: bool,
    /// The key itself; generated at startup when enabled and unset.
    pub api_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: ([0, 0, 0, 0], 8080).into(),
            api_key_enabled: false,
            api_key: None,
        }
    }
}

/// Initial abuse-threshold policy (mutable later via the API).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub attempts: u32,
    /// Sliding-window length in seconds.
    pub period: u64,
    /// Block duration in seconds.
    pub blocktime: u64,
}

impl PolicyConfig {
    pub fn to_policy(&self) -> Policy {
        Policy {
            attempts: self.attempts,
            period: self.period,
            blocktime: self.blocktime,
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self { attempts: 5, period: 600, blocktime: 3600 }
    }
}

/// Storage backend selection.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Snapshot file, used by the `snapshot` backend.
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            path: "blockd.snapshot".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Snapshot,
}

/// Local firewall enforcement.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EnforcementConfig {
    pub mode: EnforcementMode,
    /// iptables chain rules are appended to.
    pub chain: String,
}

impl Default for EnforcementConfig {
    fn default() -> Self {
        Self {
            mode: EnforcementMode::None,
            chain: "INPUT".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnforcementMode {
    #[default]
    None,
    Iptables,
}

/// Reconciliation sweep timing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub interval_secs: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self { interval_secs: 5 }
    }
}
