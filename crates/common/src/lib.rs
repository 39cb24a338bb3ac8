/// Shared types for VeilNet crates
///
/// Configuration, the common error type and the small value types
/// (timestamps, relay fingerprints, onion service identifiers).

pub mod config;
pub mod error;
pub mod types;

pub use config::{connection, directory, rendezvous, ConfigError, NodeConfig};
pub use error::{Result, VeilNetError};
pub use types::{
    Fingerprint, OnionAddress, Timestamp, TypeError, FINGERPRINT_LEN, ONION_ADDRESS_LEN,
};
