//! Echo-suppression hash ledger.
//!
//! Every write the engine itself performs on the synced tree (applying a
//! remote change, materializing a snapshot entry) is about to be observed by
//! the filesystem watcher as if it were a fresh local edit. The ledger
//! records the content hash of each such write so the watch bridge can tell
//! the echo apart from a real edit and swallow it instead of broadcasting it
//! back out.
//!
//! Purely in-memory bookkeeping; nothing here is persisted.

use std::collections::{HashMap, HashSet};

use sha2::{Digest, Sha256};

/// Compute the lowercase hex SHA-256 digest of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Tracks content hashes of engine-performed writes per path.
///
/// A hash is added exactly once per applied write and removed exactly once
/// when the matching watcher event comes back around.
#[derive(Debug, Default)]
pub struct HashLedger {
    entries: HashMap<String, HashSet<String>>,
}

impl HashLedger {
    /// Create an empty ledger
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a hash for a path, creating the per-path set if absent.
    ///
    /// Recording the same hash twice is a no-op.
    pub fn record(&mut self, path: &str, hash: impl Into<String>) {
        self.entries
            .entry(path.to_string())
            .or_default()
            .insert(hash.into());
    }

    /// Check whether `hash` is an echo of a write the engine performed on
    /// `path`.
    ///
    /// On a match the hash is consumed (and the path entry dropped once its
    /// set is empty) and `true` is returned. Otherwise the ledger is left
    /// unchanged and `false` is returned.
    pub fn is_echo(&mut self, path: &str, hash: &str) -> bool {
        let Some(hashes) = self.entries.get_mut(path) else {
            return false;
        };
        if !hashes.remove(hash) {
            return false;
        }
        if hashes.is_empty() {
            self.entries.remove(path);
        }
        true
    }

    /// Number of paths with outstanding recorded writes
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the ledger has no outstanding entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_consumed_once() {
        let mut ledger = HashLedger::new();
        let hash = sha256_hex(b"hi");

        ledger.record("/hello.txt", hash.clone());
        assert!(ledger.is_echo("/hello.txt", &hash));
        // Consumed: a second identical event is a real edit again
        assert!(!ledger.is_echo("/hello.txt", &hash));
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_different_content_never_suppressed() {
        let mut ledger = HashLedger::new();
        ledger.record("/a.txt", sha256_hex(b"old"));

        assert!(!ledger.is_echo("/a.txt", &sha256_hex(b"new")));
        // The recorded hash is still pending
        assert!(ledger.is_echo("/a.txt", &sha256_hex(b"old")));
    }

    #[test]
    fn test_unknown_path() {
        let mut ledger = HashLedger::new();
        assert!(!ledger.is_echo("/never-seen", &sha256_hex(b"x")));
    }

    #[test]
    fn test_multiple_hashes_per_path() {
        let mut ledger = HashLedger::new();
        let h1 = sha256_hex(b"one");
        let h2 = sha256_hex(b"two");

        ledger.record("/f", h1.clone());
        ledger.record("/f", h2.clone());

        assert!(ledger.is_echo("/f", &h2));
        assert_eq!(ledger.len(), 1);
        assert!(ledger.is_echo("/f", &h1));
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_record_idempotent() {
        let mut ledger = HashLedger::new();
        let h = sha256_hex(b"same");
        ledger.record("/f", h.clone());
        ledger.record("/f", h.clone());

        assert!(ledger.is_echo("/f", &h));
        assert!(!ledger.is_echo("/f", &h));
    }

    #[test]
    fn test_sha256_hex_known_value() {
        // sha256 of the empty string
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
