use crate::membership::types::NodeId;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
/// Maps a key to one of `num_segments` segments. Independent of cluster size
/// and of the toolchain a node was built with.
pub fn segment_of(key: &str, num_segments: u32) -> u32 {
    crc32fast::hash(key.as_bytes()) % num_segments.max(1)
}

/// Immutable segment -> ordered owner list snapshot. Index 0 is the primary owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistentHash {
    num_segments: u32,
    num_owners: usize,
    members: Vec<NodeId>,
    segment_owners: Vec<Vec<NodeId>>,
}

impl ConsistentHash {
    pub(crate) fn from_parts(
        num_owners: usize,
        members: Vec<NodeId>,
        segment_owners: Vec<Vec<NodeId>>,
    ) -> Self {
        Self {
            num_segments: segment_owners.len() as u32,
            num_owners,
            members,
            segment_owners,
        }
    }

    pub fn num_segments(&self) -> u32 {
        self.num_segments
    }

    /// Target number of owners per segment.
    pub fn num_owners(&self) -> usize {
        self.num_owners
    }

    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    pub fn segment_of(&self, key: &str) -> u32 {
        segment_of(key, self.num_segments)
    }

    pub fn owners_of(&self, segment: u32) -> &[NodeId] {
        self.segment_owners
            .get(segment as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn primary_of(&self, segment: u32) -> Option<&NodeId> {
        self.owners_of(segment).first()
    }

    pub fn locate_owners(&self, key: &str) -> &[NodeId] {
        self.owners_of(self.segment_of(key))
    }

    pub fn locate_primary(&self, key: &str) -> Option<&NodeId> {
        self.locate_owners(key).first()
    }

    pub fn is_primary_owner(&self, key: &str, node: &NodeId) -> bool {
        self.locate_primary(key) == Some(node)
    }

    pub fn is_owner(&self, key: &str, node: &NodeId) -> bool {
        self.locate_owners(key).contains(node)
    }

    pub fn is_segment_owner(&self, segment: u32, node: &NodeId) -> bool {
        self.owners_of(segment).contains(node)
    }

    pub fn segments_owned_by(&self, node: &NodeId) -> Vec<u32> {
        (0..self.num_segments)
            .filter(|segment| self.is_segment_owner(*segment, node))
            .collect()
    }

    pub fn primary_segments_of(&self, node: &NodeId) -> Vec<u32> {
        (0..self.num_segments)
            .filter(|segment| self.primary_of(*segment) == Some(node))
            .collect()
    }

    /// Owner lists of both hashes merged, this one's owners first.
    ///
    /// Used as the write target during a rebalance, so that both the old and
    /// the new owners of a segment receive every write.
    pub fn union(&self, other: &ConsistentHash) -> ConsistentHash {
        let mut members = self.members.clone();
        for member in &other.members {
            if !members.contains(member) {
                members.push(member.clone());
            }
        }

        let segment_owners = (0..self.num_segments)
            .map(|segment| {
                let mut owners = self.owners_of(segment).to_vec();
                for owner in other.owners_of(segment) {
                    if !owners.contains(owner) {
                        owners.push(owner.clone());
                    }
                }
                owners
            })
            .collect();

        ConsistentHash::from_parts(
            self.num_owners.max(other.num_owners),
            members,
            segment_owners,
        )
    }

    /// Drops owners that are no longer members, keeping the survivors' order.
    ///
    /// A segment that lost every owner is handed to the member with the fewest
    /// primary segments. Returns `None` when no member survives.
    pub fn remove_leavers(&self, members: &[NodeId]) -> Option<ConsistentHash> {
        let survivors: Vec<NodeId> = self
            .members
            .iter()
            .filter(|member| members.contains(member))
            .cloned()
            .collect();
        if survivors.is_empty() {
            return None;
        }

        let mut segment_owners: Vec<Vec<NodeId>> = self
            .segment_owners
            .iter()
            .map(|owners| {
                owners
                    .iter()
                    .filter(|owner| survivors.contains(owner))
                    .cloned()
                    .collect()
            })
            .collect();

        let mut primaries: HashMap<&NodeId, usize> =
            survivors.iter().map(|member| (member, 0)).collect();
        for owners in &segment_owners {
            if let Some(primary) = owners.first()
                && let Some(count) = primaries.get_mut(primary)
            {
                *count += 1;
            }
        }

        let mut orphaned = 0;
        for owners in segment_owners.iter_mut() {
            if !owners.is_empty() {
                continue;
            }
            orphaned += 1;
            let Some(least_loaded) = survivors
                .iter()
                .min_by_key(|member| primaries.get(member).copied().unwrap_or(0))
            else {
                continue;
            };
            if let Some(count) = primaries.get_mut(least_loaded) {
                *count += 1;
            }
            owners.push(least_loaded.clone());
        }
        if orphaned > 0 {
            tracing::warn!("{} segment(s) lost every owner", orphaned);
        }

        Some(ConsistentHash::from_parts(
            self.num_owners,
            survivors,
            segment_owners,
        ))
    }
}
