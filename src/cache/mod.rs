//! Cache Module
//!
//! The user-facing side of the engine.
//!
//! ## Components
//! - [`manager::CacheManager`]: defines caches, owns the node's RPC dispatcher
//!   and follows membership views.
//! - [`registry::CacheComponents`]: the per-cache component set (container,
//!   locks, distribution, state transfer, transaction table) in the manager's
//!   arena.
//! - [`api::Cache`]: typed map handle routing every operation through the
//!   cache's pipeline.
//! - [`api::Transaction`]: explicit transaction on a transactional cache.
//! - [`handlers`]: REST endpoints of the node binary.

pub mod api;
pub mod handlers;
pub mod manager;
pub mod registry;
pub mod stats;

pub use api::{Cache, Transaction};
pub use manager::{CacheManager, CacheManagerBuilder};
pub use registry::CacheId;
pub use stats::StatsSnapshot;

#[cfg(test)]
mod tests;
