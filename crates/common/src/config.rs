use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Connection tracking constants
pub mod connection {
    /// Upper bound on records the registry will hold at once
    pub const MAX_CONNECTIONS: usize = 4096;

    /// How long a non-blocking connect may stay in progress
    pub const CONNECT_TIMEOUT_SECS: u64 = 30;

    /// How often the daemon reclaims connections marked for close
    pub const SWEEP_INTERVAL_MS: u64 = 1000;

    /// First fake socket number handed out by the scripted socket layer
    pub const SCRIPTED_SOCKET_BASE: u64 = 50;
}

/// Directory protocol constants
pub mod directory {
    /// Default directory port
    pub const DEFAULT_DIR_PORT: u16 = 9030;

    /// Consensus flavor names used as request resources
    pub const FLAVOR_MICRODESC: &str = "microdesc";
    pub const FLAVOR_NS: &str = "ns";
}

/// Rendezvous descriptor fetch constants
pub mod rendezvous {
    /// Hidden service directories responsible for one descriptor replica
    pub const HSDIRS_PER_REPLICA: usize = 3;

    /// Number of descriptor replicas
    pub const NUMBER_OF_REPLICAS: usize = 2;
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Maximum number of tracked connections
    pub max_connections: usize,

    /// Connect timeout in seconds
    pub connect_timeout_secs: u64,

    /// Interval between sweeps of closed connections
    pub sweep_interval_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Directory servers to fetch from ("ip:port")
    pub directory_servers: Vec<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            max_connections: connection::MAX_CONNECTIONS,
            connect_timeout_secs: connection::CONNECT_TIMEOUT_SECS,
            sweep_interval_ms: connection::SWEEP_INTERVAL_MS,
            log_level: "info".to_string(),
            directory_servers: vec![format!("127.0.0.1:{}", directory::DEFAULT_DIR_PORT)],
        }
    }
}

impl NodeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_connect_timeout(mut self, secs: u64) -> Self {
        self.connect_timeout_secs = secs;
        self
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    pub fn with_directory_servers(mut self, servers: Vec<String>) -> Self {
        self.directory_servers = servers;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Reject values the node cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be positive".into()));
        }
        if self.sweep_interval_ms == 0 {
            return Err(ConfigError::Invalid("sweep_interval_ms must be positive".into()));
        }
        Ok(())
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::ReadError(e.to_string()))?;

        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path.as_ref(), contents)
            .map_err(|e| ConfigError::WriteError(e.to_string()))?;

        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Failed to serialize config: {0}")]
    SerializeError(String),

    #[error("Failed to write config file: {0}")]
    WriteError(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.max_connections, connection::MAX_CONNECTIONS);
        assert_eq!(config.log_level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = NodeConfig::new()
            .with_max_connections(8)
            .with_connect_timeout(5)
            .with_directory_servers(vec!["10.0.0.1:9030".to_string()]);

        assert_eq!(config.max_connections, 8);
        assert_eq!(config.connect_timeout(), Duration::from_secs(5));
        assert_eq!(config.directory_servers.len(), 1);
    }

    #[test]
    fn test_config_rejects_zero_capacity() {
        let config = NodeConfig::new().with_max_connections(0);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_config_file_partial_fields() {
        let path = std::env::temp_dir().join(format!("veilnet-config-{}.toml", std::process::id()));
        std::fs::write(&path, "max_connections = 16\nlog_level = \"debug\"\n").unwrap();

        let config = NodeConfig::from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();

        // Missing keys fall back to defaults
        assert_eq!(config.max_connections, 16);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.connect_timeout_secs, connection::CONNECT_TIMEOUT_SECS);
    }

    #[test]
    fn test_config_file_missing() {
        let err = NodeConfig::from_file("/nonexistent/veilnet.toml").unwrap_err();
        assert!(matches!(err, ConfigError::ReadError(_)));
    }
}
