//! Distributed Cache Library
//!
//! A partitioned, replicated in-memory key-value cache. Every node runs a
//! [`CacheManager`] holding any number of named caches; the nodes of a cluster
//! agree on which of them own each key and keep those copies consistent.
//!
//! ## Architecture Modules
//!
//! - **`cache`**: the manager, the per-cache component arena and the typed
//!   [`Cache`] / [`Transaction`] handles.
//! - **`config`**: cache modes, transaction settings and validation.
//! - **`container`**: per-node segmented entry storage with versions and
//!   expiration.
//! - **`distribution`**: segment-based consistent hashing and the installed
//!   cache topology.
//! - **`interceptors`**: the write path. A non-transactional write is decided
//!   once on the key's primary owner and replicated synchronously to its
//!   backups.
//! - **`lock`**: per-key exclusive locks with timeouts.
//! - **`membership`**: cluster views, from UDP gossip or an in-process network.
//! - **`rpc`**: command protocol, dispatcher and transports.
//! - **`statetransfer`**: topology planning on the coordinator and segment
//!   transfer on joiners.
//! - **`transaction`**: two-phase commit with optimistic or pessimistic
//!   locking.
//! - **`time`**: wall clock used for expiration.

pub mod cache;
pub mod config;
pub mod container;
pub mod distribution;
pub mod error;
pub mod interceptors;
pub mod lock;
pub mod membership;
pub mod rpc;
pub mod statetransfer;
pub mod time;
pub mod transaction;

pub use cache::{Cache, CacheId, CacheManager, CacheManagerBuilder, StatsSnapshot, Transaction};
pub use config::{
    CacheConfig, CacheMode, EvictionConfig, EvictionStrategy, IsolationLevel, LockingMode, TransactionConfig,
};
pub use error::{CacheError, Result};
pub use membership::types::NodeId;
