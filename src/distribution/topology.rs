use super::hash::ConsistentHash;
use crate::membership::types::NodeId;

use serde::{Deserialize, Serialize};

/// Versioned placement snapshot of one cache.
///
/// While a rebalance is in progress `pending` holds the target placement.
/// Reads keep using `current`; writes go to the union of both so that new
/// owners receive every write made while they are fetching state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheTopology {
    pub id: u64,
    pub members: Vec<NodeId>,
    pub current: ConsistentHash,
    pub pending: Option<ConsistentHash>,
    write: ConsistentHash,
}

impl CacheTopology {
    pub fn new(
        id: u64,
        members: Vec<NodeId>,
        current: ConsistentHash,
        pending: Option<ConsistentHash>,
    ) -> Self {
        let write = match &pending {
            Some(pending) => current.union(pending),
            None => current.clone(),
        };
        Self {
            id,
            members,
            current,
            pending,
            write,
        }
    }

    pub fn is_rebalancing(&self) -> bool {
        self.pending.is_some()
    }

    pub fn read_ch(&self) -> &ConsistentHash {
        &self.current
    }

    pub fn write_ch(&self) -> &ConsistentHash {
        &self.write
    }

    /// Placement once the rebalance, if any, completes.
    pub fn target_ch(&self) -> &ConsistentHash {
        self.pending.as_ref().unwrap_or(&self.current)
    }

    pub fn num_segments(&self) -> u32 {
        self.current.num_segments()
    }

    pub fn segment_of(&self, key: &str) -> u32 {
        self.current.segment_of(key)
    }

    /// Segments `node` owns in the pending placement but not in the current one.
    pub fn incoming_segments(&self, node: &NodeId) -> Vec<u32> {
        match &self.pending {
            Some(pending) => (0..self.num_segments())
                .filter(|s| pending.is_segment_owner(*s, node) && !self.current.is_segment_owner(*s, node))
                .collect(),
            None => Vec::new(),
        }
    }
}
