use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Length of a relay identity digest in bytes
pub const FINGERPRINT_LEN: usize = 20;

/// Length of an onion service identifier in base32 characters
pub const ONION_ADDRESS_LEN: usize = 16;

/// Raw length of an onion service identifier (80 bits)
const ONION_ADDRESS_RAW_LEN: usize = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid fingerprint length: expected {expected}, got {actual}")]
    InvalidFingerprint { expected: usize, actual: usize },
    #[error("invalid fingerprint hex: {0}")]
    InvalidFingerprintHex(String),
    #[error("invalid onion address length: expected {expected}, got {actual}")]
    InvalidOnionLength { expected: usize, actual: usize },
    #[error("invalid onion address encoding: {0}")]
    InvalidOnionEncoding(String),
}

/// Timestamp in Unix epoch seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_secs())
    }

    pub fn from_secs(secs: u64) -> Self {
        Self(secs)
    }

    pub fn as_secs(&self) -> u64 {
        self.0
    }

    pub fn elapsed(&self) -> Duration {
        let now = Self::now();
        Duration::from_secs(now.0.saturating_sub(self.0))
    }
}

/// Identity digest of a relay (hidden service directories are keyed by it)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint([u8; FINGERPRINT_LEN]);

impl Fingerprint {
    pub fn from_bytes(bytes: [u8; FINGERPRINT_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, TypeError> {
        if bytes.len() != FINGERPRINT_LEN {
            return Err(TypeError::InvalidFingerprint {
                expected: FINGERPRINT_LEN,
                actual: bytes.len(),
            });
        }

        let mut array = [0u8; FINGERPRINT_LEN];
        array.copy_from_slice(bytes);
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.0
    }

    /// Uppercase hex, the form directory documents use
    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, TypeError> {
        let decoded = hex::decode(hex_str.trim_start_matches('$'))
            .map_err(|err| TypeError::InvalidFingerprintHex(err.to_string()))?;
        Self::from_slice(&decoded)
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}", self.to_hex())
    }
}

impl FromStr for Fingerprint {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

/// Base32 service identifier of an onion service, without the ".onion" suffix
///
/// The rendezvous bookkeeping in the core stores the plain string; this type
/// is how callers validate one before handing it over.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OnionAddress(String);

impl OnionAddress {
    /// Parse a service identifier, accepting an optional ".onion" suffix
    pub fn parse(input: &str) -> Result<Self, TypeError> {
        let lowered = input.trim().to_lowercase();
        let id = lowered.strip_suffix(".onion").unwrap_or(&lowered);

        if id.len() != ONION_ADDRESS_LEN {
            return Err(TypeError::InvalidOnionLength {
                expected: ONION_ADDRESS_LEN,
                actual: id.len(),
            });
        }

        let decoded = data_encoding::BASE32_NOPAD
            .decode(id.to_uppercase().as_bytes())
            .map_err(|err| TypeError::InvalidOnionEncoding(err.to_string()))?;
        debug_assert_eq!(decoded.len(), ONION_ADDRESS_RAW_LEN);

        Ok(Self(id.to_string()))
    }

    /// Encode a raw 80-bit identifier
    pub fn from_raw(raw: [u8; ONION_ADDRESS_RAW_LEN]) -> Self {
        Self(data_encoding::BASE32_NOPAD.encode(&raw).to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_hostname(&self) -> String {
        format!("{}.onion", self.0)
    }
}

impl fmt::Display for OnionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for OnionAddress {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<OnionAddress> for String {
    fn from(value: OnionAddress) -> Self {
        value.0
    }
}

impl FromStr for OnionAddress {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
