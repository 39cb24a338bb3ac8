/// Rendezvous query bookkeeping for hidden service descriptor fetches
///
/// A directory connection fetching a descriptor carries the service
/// identifier it asks for and the hidden service directories already
/// contacted for that logical request. Retries copy the query into the
/// next connection so the tried list keeps growing across attempts.

use serde::{Deserialize, Serialize};
use veilnet_common::{Fingerprint, OnionAddress};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RendQuery {
    /// Service identifier, base32 without suffix
    onion_address: String,

    /// Directories already asked, in the order they were tried
    tried_directories: Vec<Fingerprint>,
}

impl RendQuery {
    /// Create a query for a service identifier
    ///
    /// The identifier length is the caller's responsibility; use
    /// `OnionAddress::parse` to validate untrusted input first.
    pub fn new(onion_address: impl Into<String>) -> Self {
        Self {
            onion_address: onion_address.into(),
            tried_directories: Vec::new(),
        }
    }

    pub fn onion_address(&self) -> &str {
        &self.onion_address
    }

    /// Exact string comparison; service identifiers are not secret
    pub fn matches(&self, onion_address: &str) -> bool {
        self.onion_address == onion_address
    }

    pub fn tried_directories(&self) -> &[Fingerprint] {
        &self.tried_directories
    }

    pub fn has_tried(&self, directory: &Fingerprint) -> bool {
        self.tried_directories.contains(directory)
    }

    /// Record that `directory` was asked for this descriptor
    ///
    /// Returns false if it was already in the list.
    pub fn note_tried(&mut self, directory: Fingerprint) -> bool {
        if self.has_tried(&directory) {
            return false;
        }
        self.tried_directories.push(directory);
        true
    }

    /// Query to carry into the next attempt against `directory`
    pub fn retry_with(&self, directory: Fingerprint) -> Result<Self, RendQueryError> {
        let mut next = self.clone();
        if !next.note_tried(directory) {
            return Err(RendQueryError::AlreadyTried(directory));
        }
        Ok(next)
    }
}

impl From<&OnionAddress> for RendQuery {
    fn from(address: &OnionAddress) -> Self {
        Self::new(address.as_str())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RendQueryError {
    #[error("Directory {0} was already tried for this descriptor")]
    AlreadyTried(Fingerprint),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fingerprint(byte: u8) -> Fingerprint {
        Fingerprint::from_bytes([byte; 20])
    }

    #[test]
    fn test_new_query_has_no_tried_directories() {
        let query = RendQuery::new("cfs3rltphxxvabci");
        assert_eq!(query.onion_address(), "cfs3rltphxxvabci");
        assert!(query.tried_directories().is_empty());
    }

    #[test]
    fn test_matches_is_exact() {
        let query = RendQuery::new("cfs3rltphxxvabci");
        assert!(query.matches("cfs3rltphxxvabci"));
        assert!(!query.matches("icbavxxhptlr3sfc"));
        assert!(!query.matches("cfs3rltphxxvabc"));
        assert!(!query.matches(""));
    }

    #[test]
    fn test_note_tried_deduplicates() {
        let mut query = RendQuery::new("cfs3rltphxxvabci");
        assert!(query.note_tried(fingerprint(1)));
        assert!(!query.note_tried(fingerprint(1)));
        assert!(query.note_tried(fingerprint(2)));
        assert_eq!(query.tried_directories(), &[fingerprint(1), fingerprint(2)]);
    }

    #[test]
    fn test_retry_preserves_history() {
        let mut first = RendQuery::new("cfs3rltphxxvabci");
        first.note_tried(fingerprint(1));

        let second = first.retry_with(fingerprint(2)).unwrap();
        assert_eq!(second.onion_address(), first.onion_address());
        assert_eq!(second.tried_directories(), &[fingerprint(1), fingerprint(2)]);

        // The previous query is left alone
        assert_eq!(first.tried_directories().len(), 1);

        let err = second.retry_with(fingerprint(1)).unwrap_err();
        assert_eq!(err, RendQueryError::AlreadyTried(fingerprint(1)));
    }

    #[test]
    fn test_from_onion_address() {
        let address = OnionAddress::parse("cfs3rltphxxvabci.onion").unwrap();
        let query = RendQuery::from(&address);
        assert!(query.matches("cfs3rltphxxvabci"));
    }
}
