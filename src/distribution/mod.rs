//! Distribution Module
//!
//! Key placement. Every key hashes to one of a fixed number of segments and
//! every segment maps to an ordered owner list (primary first, then backups).
//!
//! ## Components
//! - [`hash::ConsistentHash`]: immutable segment -> owners snapshot.
//! - [`factory::ConsistentHashFactory`]: deterministic, movement-minimizing placement.
//! - [`topology::CacheTopology`]: a versioned current/pending pair of hashes.
//! - [`manager::DistributionManager`]: the node-local installed topology.

pub mod factory;
pub mod hash;
pub mod manager;
pub mod topology;

pub use factory::ConsistentHashFactory;
pub use hash::{ConsistentHash, segment_of};
pub use manager::DistributionManager;
pub use topology::CacheTopology;


#[cfg(test)]
mod proptest;
