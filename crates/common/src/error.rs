use thiserror::Error;

/// Common error types for VeilNet
#[derive(Debug, Error)]
pub enum VeilNetError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Connection refused")]
    ConnectionRefused,

    #[error("Connection timeout")]
    Timeout,

    #[error("Connection not found: {0}")]
    ConnectionNotFound(u64),

    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error(transparent)]
    InvalidValue(#[from] crate::types::TypeError),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type for VeilNet operations
pub type Result<T> = std::result::Result<T, VeilNetError>;

impl VeilNetError {
    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::Invariant(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the process must stop instead of carrying on
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Invariant(_))
    }
}
