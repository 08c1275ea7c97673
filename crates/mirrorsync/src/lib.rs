//! # mirrorsync - serverless bidirectional directory synchronization
//!
//! mirrorsync keeps a local directory tree synchronized, in near-real-time
//! and without any central server, with the same tree on any number of
//! peers that share a topic key. A freshly joining peer bootstraps from a
//! one-shot content-addressed snapshot published by a synced peer; from
//! then on, edits propagate as conflict-free replicated updates in both
//! directions.
//!
//! ## Architecture
//!
//! mirrorsync is built on three core technologies:
//!
//! - **[Automerge](https://automerge.org/)**: the shared path → content
//!   mapping is a CRDT document, so concurrent edits merge deterministically
//! - **[iroh](https://iroh.computer/)**: QUIC transport with hole punching,
//!   scoped to a topic-derived ALPN
//! - **[iroh-blobs](https://iroh.computer/)**: content-addressed storage
//!   backing the bootstrap snapshot transfer
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use mirrorsync::{Config, SyncEngine};
//!
//! # async fn example() -> mirrorsync::Result<()> {
//! // First peer: creates a topic and is authoritative for ./shared
//! let engine = SyncEngine::start(Config::new("./shared")).await?;
//! println!("topic key: {}", engine.topic());
//!
//! // Another machine joins with that key and bootstraps automatically
//! let topic = engine.topic().clone();
//! let peer = SyncEngine::start(Config::new("./replica").with_topic(topic)).await?;
//!
//! // ...files now flow both ways...
//! peer.shutdown().await?;
//! engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Module overview
//!
//! - [`config`]: engine configuration
//! - [`engine`]: the [`SyncEngine`] itself
//! - [`error`]: error types and `Result` alias
//! - [`swarm`]: topic keys and peer transport
//!
//! The remaining modules ([`doc`], [`ledger`], [`protocol`], [`snapshot`],
//! [`watch`]) are the engine's internals, exposed for reuse and testing.

#![forbid(unsafe_code)]

pub mod config;
pub mod doc;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod protocol;
pub mod snapshot;
pub mod swarm;
pub mod watch;

pub use config::Config;
pub use engine::{EngineStats, SyncEngine, SyncPhase};
pub use error::{Error, Result};
pub use iroh::{NodeAddr, NodeId};
pub use swarm::TopicKey;

/// Default quiet window before a watched path's change is processed, in
/// milliseconds. Long enough for editors to finish multi-step saves.
pub const DEFAULT_DEBOUNCE_MS: u64 = 200;

/// Default upper bound on each leg of the bootstrap round-trip, in seconds.
pub const DEFAULT_BOOTSTRAP_TIMEOUT_SECS: u64 = 120;
