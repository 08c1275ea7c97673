//! Configuration for a sync engine instance.

use std::path::{Path, PathBuf};

use iroh::{NodeAddr, NodeId};
use serde::{Deserialize, Serialize};

use crate::swarm::TopicKey;
use crate::{DEFAULT_BOOTSTRAP_TIMEOUT_SECS, DEFAULT_DEBOUNCE_MS};

/// Configuration for a [`SyncEngine`](crate::SyncEngine).
///
/// # Example
///
/// ```rust
/// use mirrorsync::{Config, TopicKey};
///
/// // First peer: fresh topic, authoritative over its (possibly empty) tree
/// let config = Config::new("/tmp/shared");
///
/// // Joining peer: bootstrap from whoever already holds the topic
/// let topic: TopicKey = "00".repeat(32).parse().unwrap();
/// let config = Config::new("/tmp/shared").with_topic(topic);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory tree to synchronize. Created if absent.
    pub root: PathBuf,

    /// Topic to join. `None` creates a fresh topic and starts the engine
    /// already synced (this peer is the authoritative initial replica).
    pub topic: Option<TopicKey>,

    /// How long a path must stay quiet before its watch events fire, so
    /// partially-written files are not picked up mid-write.
    pub debounce_ms: u64,

    /// Upper bound on each leg of the bootstrap round-trip (waiting for the
    /// drive key, the snapshot pull itself, waiting for completion).
    pub bootstrap_timeout_secs: u64,

    /// Whether to use relay servers for connectivity. Disabled in tests,
    /// which wire peers by explicit addresses.
    pub relay_enabled: bool,

    /// Peers to dial explicitly in addition to discovery.
    pub static_peers: Vec<NodeAddr>,
}

impl Config {
    /// Create a configuration for synchronizing `root`
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            topic: None,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            bootstrap_timeout_secs: DEFAULT_BOOTSTRAP_TIMEOUT_SECS,
            relay_enabled: true,
            static_peers: Vec::new(),
        }
    }

    /// Join an existing topic instead of creating a new one
    #[must_use]
    pub fn with_topic(mut self, topic: TopicKey) -> Self {
        self.topic = Some(topic);
        self
    }

    /// Set the watch debounce window
    #[must_use]
    pub const fn with_debounce_ms(mut self, ms: u64) -> Self {
        self.debounce_ms = ms;
        self
    }

    /// Set the bootstrap timeout
    #[must_use]
    pub const fn with_bootstrap_timeout(mut self, secs: u64) -> Self {
        self.bootstrap_timeout_secs = secs;
        self
    }

    /// Disable relay servers (local-network and explicit peers only)
    #[must_use]
    pub const fn with_relay_disabled(mut self) -> Self {
        self.relay_enabled = false;
        self
    }

    /// Dial a known peer explicitly in addition to discovery
    #[must_use]
    pub fn with_peer(mut self, addr: NodeAddr) -> Self {
        self.static_peers.push(addr);
        self
    }

    /// Scratch directory for snapshot transfer caches: a sibling of the
    /// sync root named from this peer's own identity key. Never part of the
    /// synchronized tree; removed at session close and again at shutdown.
    #[must_use]
    pub fn scratch_dir(&self, node_id: &NodeId) -> PathBuf {
        let parent = self.root.parent().unwrap_or(Path::new("."));
        parent.join(format!(".{node_id}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::new("/tmp/sync");
        assert!(config.topic.is_none());
        assert_eq!(config.debounce_ms, DEFAULT_DEBOUNCE_MS);
        assert_eq!(config.bootstrap_timeout_secs, DEFAULT_BOOTSTRAP_TIMEOUT_SECS);
        assert!(config.relay_enabled);
        assert!(config.static_peers.is_empty());
    }

    #[test]
    fn test_config_builder() {
        let topic = TopicKey::generate();
        let config = Config::new("/tmp/sync")
            .with_topic(topic.clone())
            .with_debounce_ms(50)
            .with_bootstrap_timeout(10)
            .with_relay_disabled();

        assert_eq!(config.topic, Some(topic));
        assert_eq!(config.debounce_ms, 50);
        assert_eq!(config.bootstrap_timeout_secs, 10);
        assert!(!config.relay_enabled);
    }

    #[test]
    fn test_scratch_dir_is_sibling() {
        let config = Config::new("/data/shared");
        let node_id = iroh::SecretKey::generate(rand::thread_rng()).public();
        let scratch = config.scratch_dir(&node_id);
        assert_eq!(scratch.parent(), Some(Path::new("/data")));
        assert!(scratch
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with('.'));
    }
}
