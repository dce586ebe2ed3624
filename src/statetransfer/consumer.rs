//! Inbound side of state transfer.
//!
//! A node that gains segments in a pending placement pulls their entries from
//! the current owners, applies them under the newer-version rule and confirms
//! to the coordinator. Segments it no longer owns are dropped once the
//! coordinator publishes the finished placement.

use crate::cache::registry::CacheComponents;
use crate::container::{DataContainer, InternalEntry};
use crate::distribution::CacheTopology;
use crate::error::{CacheError, Result};
use crate::membership::types::NodeId;
use crate::rpc::protocol::{CacheCommand, CacheResponse};

use dashmap::DashSet;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const DEPARTING_LOCKS_POLL: Duration = Duration::from_millis(20);

/// Tracks the segments this node is receiving and the keys regular writes
/// touched meanwhile, so transferred state never overwrites them.
#[derive(Debug, Default)]
pub struct StateConsumer {
    inbound: DashSet<u32>,
    updated_keys: DashSet<String>,
    transfer_topology: AtomicU64,
}

impl StateConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, topology_id: u64, segments: &[u32]) {
        self.transfer_topology.store(topology_id, Ordering::SeqCst);
        for segment in segments {
            self.inbound.insert(*segment);
        }
    }

    pub fn is_transferring(&self) -> bool {
        !self.inbound.is_empty()
    }

    pub fn is_inbound(&self, segment: u32) -> bool {
        self.inbound.contains(&segment)
    }

    /// Called for every write applied locally.
    pub fn note_updated(&self, key: &str, segment: u32) {
        if self.inbound.contains(&segment) {
            self.updated_keys.insert(key.to_string());
        }
    }

    /// Stores transferred entries, skipping keys written since the transfer
    /// began. Returns the number of entries stored.
    pub fn apply_state(&self, container: &DataContainer, entries: Vec<InternalEntry>) -> usize {
        entries
            .into_iter()
            .filter(|entry| !self.updated_keys.contains(&entry.key))
            .filter(|entry| container.put_if_newer(entry.clone()))
            .count()
    }

    /// Ends the transfer started for `topology_id`. A transfer begun for a
    /// newer topology keeps its tracking.
    pub fn finish(&self, topology_id: u64) -> bool {
        if self.transfer_topology.load(Ordering::SeqCst) != topology_id {
            return false;
        }
        self.reset();
        true
    }

    pub fn reset(&self) {
        self.inbound.clear();
        self.updated_keys.clear();
    }
}

/// Installs a topology published by the coordinator.
pub(crate) async fn handle_topology_update(
    cache: &Arc<CacheComponents>,
    coordinator: NodeId,
    topology: CacheTopology,
) -> Result<CacheResponse> {
    let id = topology.id;
    let incoming = {
        let _exclusive = cache.st_lock.acquire_exclusive().await;
        if !cache.distribution.install(topology) {
            tracing::debug!(
                "{} ignored stale topology {} for cache {}",
                cache.local,
                id,
                cache.name
            );
            return Ok(CacheResponse::Ack);
        }
        let installed = cache.distribution.require_topology()?;
        let incoming = installed.incoming_segments(&cache.local);
        if !incoming.is_empty() {
            cache.consumer.begin(id, &incoming);
        }
        if !installed.is_rebalancing() {
            cache.consumer.reset();
            drop_unowned_segments(cache, &installed);
        }
        incoming
    };

    let topology = cache.distribution.require_topology()?;
    tracing::info!(
        "Cache {} on {} installed topology {} ({} members, rebalancing: {}, incoming segments: {})",
        cache.name,
        cache.local,
        id,
        topology.members.len(),
        topology.is_rebalancing(),
        incoming.len()
    );

    if topology.is_rebalancing() {
        let task_cache = cache.clone();
        let handle = tokio::spawn(async move {
            receive_state(task_cache, coordinator, topology, incoming).await;
        });
        cache.track_task(handle);
    }
    Ok(CacheResponse::Ack)
}

fn drop_unowned_segments(cache: &CacheComponents, topology: &CacheTopology) {
    let unowned: Vec<u32> = (0..topology.num_segments())
        .filter(|segment| !topology.read_ch().is_segment_owner(*segment, &cache.local))
        .collect();
    let removed = cache.container.remove_segments(&unowned);
    if removed > 0 {
        tracing::info!(
            "Cache {} on {} dropped {} entries of segments it no longer owns",
            cache.name,
            cache.local,
            removed
        );
    }
}

async fn receive_state(
    cache: Arc<CacheComponents>,
    coordinator: NodeId,
    topology: Arc<CacheTopology>,
    segments: Vec<u32>,
) {
    if !segments.is_empty() {
        let applied = fetch_segments(&cache, &topology, &segments).await;
        tracing::info!(
            "Cache {} on {} received {} entries for {} segments of topology {}",
            cache.name,
            cache.local,
            applied,
            segments.len(),
            topology.id
        );
    }

    if cache.distribution.topology_id() != topology.id {
        tracing::debug!(
            "Topology {} was superseded before {} confirmed its rebalance",
            topology.id,
            cache.local
        );
        return;
    }
    cache.consumer.finish(topology.id);
    await_departing_transactions(&cache, &topology).await;

    let confirm = CacheCommand::RebalanceConfirm {
        topology_id: topology.id,
        node: cache.local.clone(),
    };
    if let Err(e) = cache
        .rpc
        .invoke(&coordinator, &cache.name, confirm, cache.config.remote_timeout())
        .await
    {
        tracing::warn!(
            "Failed to confirm rebalance {} to {}: {}",
            topology.id,
            coordinator,
            e
        );
    }
}

/// Keys this node is primary for now but not once the rebalance completes.
fn departing_locked_keys(cache: &CacheComponents, topology: &CacheTopology) -> Vec<String> {
    cache
        .locks
        .transaction_locked_keys()
        .into_iter()
        .filter(|key| {
            topology.write_ch().is_primary_owner(key, &cache.local)
                && !topology.target_ch().is_primary_owner(key, &cache.local)
        })
        .collect()
}

/// Holds back the rebalance confirmation while transactions keep locks on
/// keys whose primary moves away, so they commit before the new primary
/// starts accepting writes. After the state transfer timeout the
/// confirmation goes out anyway and those commits fail at the old primary.
async fn await_departing_transactions(cache: &CacheComponents, topology: &CacheTopology) {
    let deadline = tokio::time::Instant::now() + cache.config.state_transfer_timeout();
    loop {
        let departing = departing_locked_keys(cache, topology);
        if departing.is_empty() || cache.distribution.topology_id() != topology.id {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            tracing::warn!(
                "Cache {} on {}: confirming rebalance {} while transactions still lock {} departing keys",
                cache.name,
                cache.local,
                topology.id,
                departing.len()
            );
            return;
        }
        tokio::time::sleep(DEPARTING_LOCKS_POLL).await;
    }
}

/// Pulls `segments` from their current owners, primary first. Returns the
/// number of entries stored.
async fn fetch_segments(cache: &CacheComponents, topology: &CacheTopology, segments: &[u32]) -> usize {
    let sources_of = |segment: u32| -> Vec<NodeId> {
        topology
            .read_ch()
            .owners_of(segment)
            .iter()
            .filter(|owner| *owner != &cache.local)
            .cloned()
            .collect()
    };

    // segment -> index of the next source to try
    let mut pending: BTreeMap<u32, usize> = segments.iter().map(|s| (*s, 0)).collect();
    let mut applied = 0;

    while !pending.is_empty() {
        let mut by_source: BTreeMap<NodeId, Vec<u32>> = BTreeMap::new();
        let mut lost = Vec::new();
        for (segment, attempt) in &pending {
            match sources_of(*segment).get(*attempt) {
                Some(source) => by_source.entry(source.clone()).or_default().push(*segment),
                None => lost.push(*segment),
            }
        }
        if !lost.is_empty() {
            tracing::warn!(
                "Cache {} on {}: no owner left to transfer segments {:?}",
                cache.name,
                cache.local,
                lost
            );
            for segment in lost {
                pending.remove(&segment);
            }
        }

        for (source, requested) in by_source {
            match request_segments(cache, &source, topology.id, &requested).await {
                Ok(entries) => {
                    for version in entries.iter().filter_map(|entry| entry.version) {
                        cache.versions.observe(version);
                    }
                    applied += cache.consumer.apply_state(&cache.container, entries);
                    for segment in requested {
                        pending.remove(&segment);
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        "State request for {} segments to {} failed: {}",
                        requested.len(),
                        source,
                        e
                    );
                    for segment in requested {
                        if let Some(attempt) = pending.get_mut(&segment) {
                            *attempt += 1;
                        }
                    }
                }
            }
        }

        if cache.distribution.topology_id() != topology.id {
            break;
        }
    }
    applied
}

async fn request_segments(
    cache: &CacheComponents,
    source: &NodeId,
    topology_id: u64,
    segments: &[u32],
) -> Result<Vec<InternalEntry>> {
    let command = CacheCommand::StateRequest {
        segments: segments.to_vec(),
        topology_id,
    };
    match cache
        .rpc
        .invoke(source, &cache.name, command, cache.config.state_transfer_timeout())
        .await?
    {
        CacheResponse::Entries(entries) => Ok(entries),
        other => Err(CacheError::unexpected_response(other)),
    }
}

/// Source side: waits until it has installed the requester's topology, so
/// every write it applied under an older one is already in its container.
pub(crate) async fn handle_state_request(
    cache: &CacheComponents,
    segments: &[u32],
    topology_id: u64,
) -> Result<CacheResponse> {
    cache
        .distribution
        .wait_for_topology(topology_id, cache.config.state_transfer_timeout())
        .await?;
    let entries = cache.container.entries_for_segments(segments);
    tracing::debug!(
        "Cache {} on {} sending {} entries for {} segments",
        cache.name,
        cache.local,
        entries.len(),
        segments.len()
    );
    Ok(CacheResponse::Entries(entries))
}
