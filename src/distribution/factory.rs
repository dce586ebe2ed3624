use super::hash::ConsistentHash;
use crate::error::{CacheError, Result};
use crate::membership::types::NodeId;

use std::collections::HashMap;

/// Builds balanced consistent hashes while keeping existing owners in place.
///
/// Placement works on member indices in `members` order, so every node that
/// runs it with the same inputs gets the same result. Rebalancing an already
/// balanced hash with unchanged membership returns it unchanged.
pub struct ConsistentHashFactory;

impl ConsistentHashFactory {
    pub fn create(members: &[NodeId], num_owners: usize, num_segments: u32) -> Result<ConsistentHash> {
        let empty = ConsistentHash::from_parts(
            num_owners,
            Vec::new(),
            vec![Vec::new(); num_segments.max(1) as usize],
        );
        Self::rebalance(&empty, members, num_owners)
    }

    /// Places segments on `members`, moving as few owners as needed to
    /// balance primary and total ownership.
    pub fn rebalance(
        base: &ConsistentHash,
        members: &[NodeId],
        num_owners: usize,
    ) -> Result<ConsistentHash> {
        if members.is_empty() {
            return Err(CacheError::Internal(
                "cannot build a consistent hash without members".into(),
            ));
        }

        let mut builder = Builder::new(base, members, num_owners);
        builder.assign_orphans();
        builder.balance_primaries();
        builder.fit_owner_counts();
        builder.balance_ownership();
        Ok(builder.build())
    }
}

struct Builder<'a> {
    members: &'a [NodeId],
    num_owners: usize,
    owners: Vec<Vec<usize>>,
}

impl<'a> Builder<'a> {
    fn new(base: &ConsistentHash, members: &'a [NodeId], num_owners: usize) -> Self {
        let index: HashMap<&NodeId, usize> = members
            .iter()
            .enumerate()
            .map(|(i, member)| (member, i))
            .collect();

        let owners = (0..base.num_segments())
            .map(|segment| {
                let mut list: Vec<usize> = Vec::new();
                for owner in base.owners_of(segment) {
                    if let Some(i) = index.get(owner)
                        && !list.contains(i)
                    {
                        list.push(*i);
                    }
                }
                list
            })
            .collect();

        Self {
            members,
            num_owners: num_owners.min(members.len()).max(1),
            owners,
        }
    }

    fn primary_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.members.len()];
        for list in &self.owners {
            if let Some(primary) = list.first() {
                counts[*primary] += 1;
            }
        }
        counts
    }

    fn owned_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.members.len()];
        for list in &self.owners {
            for owner in list {
                counts[*owner] += 1;
            }
        }
        counts
    }

    fn assign_orphans(&mut self) {
        let mut primaries = self.primary_counts();
        for list in self.owners.iter_mut() {
            if list.is_empty() {
                let member = least_loaded(&primaries, |_| true);
                primaries[member] += 1;
                list.push(member);
            }
        }
    }

    /// Brings every member's primary count within one of the others.
    fn balance_primaries(&mut self) {
        let mut primaries = self.primary_counts();
        loop {
            let most = most_loaded(&primaries);
            let least = least_loaded(&primaries, |_| true);
            if primaries[most] <= primaries[least] + 1 {
                break;
            }

            // Promoting an existing backup moves no data.
            let promoted = self
                .owners
                .iter()
                .rposition(|list| list[0] == most && list.contains(&least));
            match promoted {
                Some(segment) => {
                    let list = &mut self.owners[segment];
                    list.retain(|owner| *owner != least);
                    list.insert(0, least);
                }
                None => {
                    let Some(segment) = self.owners.iter().rposition(|list| list[0] == most)
                    else {
                        break;
                    };
                    self.owners[segment].insert(0, least);
                }
            }
            primaries[most] -= 1;
            primaries[least] += 1;
        }
    }

    /// Trims or fills every owner list to exactly `num_owners` entries.
    fn fit_owner_counts(&mut self) {
        let mut owned = self.owned_counts();

        for list in self.owners.iter_mut() {
            while list.len() > self.num_owners {
                let Some(position) = (1..list.len()).max_by_key(|p| (owned[list[*p]], *p)) else {
                    break;
                };
                owned[list[position]] -= 1;
                list.remove(position);
            }
        }

        for list in self.owners.iter_mut() {
            while list.len() < self.num_owners {
                let member = least_loaded(&owned, |m| !list.contains(&m));
                if list.contains(&member) {
                    break;
                }
                owned[member] += 1;
                list.push(member);
            }
        }
    }

    /// Swaps backups from over-owning to under-owning members.
    fn balance_ownership(&mut self) {
        let mut owned = self.owned_counts();
        let n = self.members.len();

        loop {
            let mut from_order: Vec<usize> = (0..n).collect();
            from_order.sort_by_key(|m| (std::cmp::Reverse(owned[*m]), *m));
            let mut to_order: Vec<usize> = (0..n).collect();
            to_order.sort_by_key(|m| (owned[*m], *m));

            let mut swap = None;
            'search: for from in &from_order {
                for to in &to_order {
                    if owned[*from] <= owned[*to] + 1 {
                        continue;
                    }
                    let candidate = self.owners.iter().rposition(|list| {
                        list[1..].contains(from) && !list.contains(to)
                    });
                    if let Some(segment) = candidate {
                        swap = Some((segment, *from, *to));
                        break 'search;
                    }
                }
            }

            let Some((segment, from, to)) = swap else {
                break;
            };
            if let Some(position) = self.owners[segment].iter().position(|o| *o == from) {
                self.owners[segment][position] = to;
                owned[from] -= 1;
                owned[to] += 1;
            }
        }
    }

    fn build(self) -> ConsistentHash {
        let segment_owners = self
            .owners
            .iter()
            .map(|list| list.iter().map(|i| self.members[*i].clone()).collect())
            .collect();
        ConsistentHash::from_parts(self.num_owners, self.members.to_vec(), segment_owners)
    }
}

/// Index of the smallest count accepted by `eligible`, lowest index on ties.
fn least_loaded(counts: &[usize], eligible: impl Fn(usize) -> bool) -> usize {
    (0..counts.len())
        .filter(|m| eligible(*m))
        .min_by_key(|m| (counts[*m], *m))
        .unwrap_or(0)
}

/// Index of the largest count, lowest index on ties.
fn most_loaded(counts: &[usize]) -> usize {
    (0..counts.len())
        .max_by_key(|m| (counts[*m], std::cmp::Reverse(*m)))
        .unwrap_or(0)
}
