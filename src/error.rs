//! Error types for the cache engine.
//!
//! Every failure a cache operation can surface is one of these variants. The enum is
//! serializable so that an error raised on a remote owner travels back through the
//! RPC layer and reaches the caller unchanged.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using the cache error type.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors that can occur while operating on a cache.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheError {
    /// The per-key lock could not be acquired in time.
    #[error("Unable to acquire lock on key '{key}' after {timeout_ms} ms")]
    LockTimeout { key: String, timeout_ms: u64 },

    /// An optimistic transaction read a version that changed before it prepared.
    #[error("Write skew detected on key '{key}' in transaction {tx}")]
    WriteSkew { key: String, tx: String },

    /// The command was tagged with a topology older than the receiver's.
    #[error("Topology {requested} is outdated (current topology is {current})")]
    OutdatedTopology { requested: u64, current: u64 },

    /// An RPC to another node failed or timed out. Its effect there is unknown.
    #[error("Communication with node {node} failed: {reason}")]
    RemoteCommunication { node: String, reason: String },

    /// Rejected cache definition or unsupported feature combination.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Cache not found: {0}")]
    CacheNotFound(String),

    /// Operation not allowed in the transaction's current state.
    #[error("Illegal transaction state: {0}")]
    IllegalTransactionState(String),

    #[error("Transaction {tx} was rolled back: {reason}")]
    RolledBack { tx: String, reason: String },

    #[error("Cache '{0}' is not running")]
    NotRunning(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CacheError {
    /// Conflicts that a caller may resolve by running the whole operation again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CacheError::LockTimeout { .. }
                | CacheError::WriteSkew { .. }
                | CacheError::OutdatedTopology { .. }
        )
    }

    pub(crate) fn remote(node: impl ToString, reason: impl ToString) -> Self {
        CacheError::RemoteCommunication {
            node: node.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn unexpected_response(response: impl std::fmt::Debug) -> Self {
        CacheError::Internal(format!("unexpected response: {:?}", response))
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for CacheError {
    fn from(e: bincode::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}
