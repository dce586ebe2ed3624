//! Property-Based Tests for Segment Placement
//!
//! # Test Properties
//!
//! 1. **Owner invariant**: every segment has `min(num_owners, members)` distinct live owners
//! 2. **Primary balance**: primary counts differ by at most one
//! 3. **Stability**: rebalancing with unchanged membership is the identity
//! 4. **Leave safety**: a surviving owner of a segment keeps owning it

#![cfg(test)]

use proptest::prelude::*;
use std::collections::HashSet;

use super::factory::ConsistentHashFactory;
use super::hash::ConsistentHash;
use crate::membership::types::NodeId;

fn members(n: usize) -> Vec<NodeId> {
    (0..n).map(|i| NodeId(format!("node-{:02}", i))).collect()
}

fn assert_invariants(ch: &ConsistentHash, members: &[NodeId], num_owners: usize) -> Result<(), TestCaseError> {
    let expected = num_owners.min(members.len());
    let mut primaries = vec![0usize; members.len()];
    for segment in 0..ch.num_segments() {
        let owners = ch.owners_of(segment);
        prop_assert_eq!(owners.len(), expected);
        let unique: HashSet<_> = owners.iter().collect();
        prop_assert_eq!(unique.len(), owners.len());
        for owner in owners {
            prop_assert!(members.contains(owner));
        }
        if let Some(i) = members.iter().position(|m| m == &owners[0]) {
            primaries[i] += 1;
        }
    }
    let max = primaries.iter().max().copied().unwrap_or(0);
    let min = primaries.iter().min().copied().unwrap_or(0);
    prop_assert!(max - min <= 1);
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_create_satisfies_invariants(
        n in 1usize..=8,
        num_owners in 1usize..=4,
        num_segments in 1u32..=128,
    ) {
        let members = members(n);
        let ch = ConsistentHashFactory::create(&members, num_owners, num_segments)?;
        assert_invariants(&ch, &members, num_owners)?;

        let again = ConsistentHashFactory::rebalance(&ch, &members, num_owners)?;
        prop_assert_eq!(again, ch);
    }

    #[test]
    fn prop_join_keeps_invariants(
        n in 1usize..=6,
        num_owners in 1usize..=3,
        num_segments in 1u32..=128,
    ) {
        let before = members(n);
        let ch = ConsistentHashFactory::create(&before, num_owners, num_segments)?;

        let after = members(n + 1);
        let balanced = ConsistentHashFactory::rebalance(&ch, &after, num_owners)?;
        assert_invariants(&balanced, &after, num_owners)?;
    }

    #[test]
    fn prop_leave_keeps_surviving_owners(
        n in 2usize..=6,
        num_owners in 1usize..=3,
        num_segments in 1u32..=64,
        leaver in 0usize..6,
    ) {
        let before = members(n);
        let leaver = before[leaver % n].clone();
        let ch = ConsistentHashFactory::create(&before, num_owners, num_segments)?;

        let survivors: Vec<NodeId> = before.iter().filter(|m| **m != leaver).cloned().collect();
        let reduced = ch.remove_leavers(&survivors).ok_or_else(|| TestCaseError::fail("no survivors"))?;
        for segment in 0..num_segments {
            for owner in ch.owners_of(segment) {
                if *owner != leaver {
                    prop_assert!(reduced.owners_of(segment).contains(owner));
                }
            }
        }

        let balanced = ConsistentHashFactory::rebalance(&reduced, &survivors, num_owners)?;
        assert_invariants(&balanced, &survivors, num_owners)?;
    }
}
