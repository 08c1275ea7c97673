//! Error types for mirrorsync.
//!
//! Errors are categorized by the subsystem that failed:
//!
//! - [`Error::Init`] - engine start-up failures (fatal)
//! - [`Error::Swarm`] - transport/connection failures
//! - [`Error::Protocol`] - malformed control messages
//! - [`Error::Merge`] - corrupt or incompatible update blobs
//! - [`Error::Transfer`] - snapshot transfer failures
//! - [`Error::Filesystem`] - read/write/delete failures on the synced tree
//! - [`Error::Shutdown`] - operation on a stopped engine
//!
//! Apart from `Init`, no error is fatal: the engine logs, drops the failing
//! message or path, and keeps serving everything else.

use std::sync::Arc;
use thiserror::Error;

/// Result type alias for mirrorsync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in mirrorsync operations
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Failed to initialize the sync engine
    #[error("initialization failed: {0}")]
    Init(Arc<str>),

    /// Transport or peer connection failure
    #[error("swarm error: {0}")]
    Swarm(Arc<str>),

    /// Malformed control message
    #[error("protocol error: {0}")]
    Protocol(Arc<str>),

    /// Corrupt or incompatible document update
    #[error("merge error: {0}")]
    Merge(Arc<str>),

    /// Snapshot transfer could not locate the sender or complete the pull
    #[error("transfer error: {0}")]
    Transfer(Arc<str>),

    /// Filesystem operation on the synchronized tree failed
    #[error("filesystem error: {0}")]
    Filesystem(Arc<str>),

    /// The engine has been shut down
    #[error("engine has been shut down")]
    Shutdown,
}

impl Error {
    /// Create an initialization error
    #[inline]
    pub fn init(msg: impl Into<String>) -> Self {
        Self::Init(Arc::from(msg.into()))
    }

    /// Create a swarm error
    #[inline]
    pub fn swarm(msg: impl Into<String>) -> Self {
        Self::Swarm(Arc::from(msg.into()))
    }

    /// Create a protocol error
    #[inline]
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(Arc::from(msg.into()))
    }

    /// Create a merge error
    #[inline]
    pub fn merge(msg: impl Into<String>) -> Self {
        Self::Merge(Arc::from(msg.into()))
    }

    /// Create a transfer error
    #[inline]
    pub fn transfer(msg: impl Into<String>) -> Self {
        Self::Transfer(Arc::from(msg.into()))
    }

    /// Create a filesystem error
    #[inline]
    pub fn filesystem(msg: impl Into<String>) -> Self {
        Self::Filesystem(Arc::from(msg.into()))
    }
}
