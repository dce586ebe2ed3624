//! Interceptors Module
//!
//! The per-operation pipeline of a cache. The cache mode and locking mode are
//! resolved once, when the cache is built, into strategy objects:
//!
//! - [`DistributionStrategy`]: where reads and writes execute.
//!   [`local::LocalDistribution`] for local caches,
//!   [`distribution::ClusteredDistribution`] for replicated and distributed ones.
//! - [`locking::LockingStrategy`]: how a transaction prepares a key for writing.
//!   Present only on transactional caches.
//!
//! [`inbound`] dispatches commands arriving from other nodes to the same code.

pub mod commands;
pub mod distribution;
pub mod inbound;
pub mod local;
pub mod locking;

use crate::cache::registry::CacheComponents;
use crate::config::{CacheConfig, LockingMode};
use crate::container::InternalEntry;
use crate::error::Result;
use commands::{WriteCommand, WriteResult};
use locking::LockingStrategy;

use async_trait::async_trait;

#[async_trait]
pub trait DistributionStrategy: Send + Sync {
    /// Reads the committed entry for `key`.
    async fn read(&self, cache: &CacheComponents, key: &str) -> Result<Option<InternalEntry>>;

    /// Runs a non-transactional write; the primary's outcome is returned.
    async fn write(&self, cache: &CacheComponents, command: WriteCommand) -> Result<WriteResult>;

    async fn clear(&self, cache: &CacheComponents) -> Result<()>;

    /// Snapshot of every live entry, each read from one owner.
    async fn entries(&self, cache: &CacheComponents) -> Result<Vec<InternalEntry>>;
}

pub struct Pipeline {
    pub distribution: Box<dyn DistributionStrategy>,
    pub locking: Option<Box<dyn LockingStrategy>>,
}

impl Pipeline {
    pub fn for_config(config: &CacheConfig) -> Self {
        let distribution: Box<dyn DistributionStrategy> = if config.mode.is_clustered() {
            Box::new(distribution::ClusteredDistribution)
        } else {
            Box::new(local::LocalDistribution)
        };

        let locking: Option<Box<dyn LockingStrategy>> = if config.is_transactional() {
            Some(match config.transaction.locking_mode {
                LockingMode::Optimistic => Box::new(locking::OptimisticLocking),
                LockingMode::Pessimistic => Box::new(locking::PessimisticLocking),
            })
        } else {
            None
        };

        Self {
            distribution,
            locking,
        }
    }
}
