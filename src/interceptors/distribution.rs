//! Clustered routing of reads and writes.
//!
//! Writes are forwarded to the key's primary owner, which serializes them with
//! the per-key lock, evaluates the operation once, applies it with a fresh
//! version and replicates the result to every other owner before answering.
//! Reads are served by any owner in the current placement, primary first.

use super::DistributionStrategy;
use super::commands::{Mutation, WriteCommand, WriteResult};
use crate::cache::registry::CacheComponents;
use crate::container::{EntryVersion, InternalEntry};
use crate::distribution::CacheTopology;
use crate::error::{CacheError, Result};
use crate::lock::LockOwner;
use crate::membership::types::NodeId;
use crate::rpc::protocol::{CacheCommand, CacheResponse};

use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;

pub struct ClusteredDistribution;

#[async_trait]
impl DistributionStrategy for ClusteredDistribution {
    async fn read(&self, cache: &CacheComponents, key: &str) -> Result<Option<InternalEntry>> {
        let mut topology = cache.current_topology().await?;
        let mut attempt = 0;
        loop {
            match read_once(cache, &topology, key).await {
                Err(CacheError::OutdatedTopology { current, .. })
                    if attempt < cache.config.max_topology_retries =>
                {
                    attempt += 1;
                    topology = refresh_topology(cache, &topology, current, attempt).await?;
                }
                other => return other,
            }
        }
    }

    async fn write(&self, cache: &CacheComponents, command: WriteCommand) -> Result<WriteResult> {
        let mut topology = cache.current_topology().await?;
        let mut attempt = 0;
        loop {
            match write_once(cache, &topology, &command).await {
                Err(CacheError::OutdatedTopology { current, .. })
                    if attempt < cache.config.max_topology_retries =>
                {
                    tracing::debug!(
                        "Write to {} hit an outdated topology {}, retrying",
                        command.key,
                        topology.id
                    );
                    attempt += 1;
                    topology = refresh_topology(cache, &topology, current, attempt).await?;
                }
                other => return other,
            }
        }
    }

    async fn clear(&self, cache: &CacheComponents) -> Result<()> {
        let topology = cache.current_topology().await?;
        cache
            .rpc
            .invoke_all(
                &topology.members,
                &cache.name,
                CacheCommand::Clear,
                cache.config.remote_timeout(),
            )
            .await?;
        Ok(())
    }

    async fn entries(&self, cache: &CacheComponents) -> Result<Vec<InternalEntry>> {
        let mut topology = cache.current_topology().await?;
        let mut attempt = 0;
        loop {
            match entries_once(cache, &topology).await {
                Err(CacheError::OutdatedTopology { current, .. })
                    if attempt < cache.config.max_topology_retries =>
                {
                    attempt += 1;
                    topology = refresh_topology(cache, &topology, current, attempt).await?;
                }
                other => return other,
            }
        }
    }
}

/// Topology to retry with after a node reported `reported` as its current one.
pub(crate) async fn refresh_topology(
    cache: &CacheComponents,
    seen: &CacheTopology,
    reported: u64,
    attempt: u32,
) -> Result<Arc<CacheTopology>> {
    if reported <= seen.id {
        // The other side is behind; give it a moment to catch up.
        tokio::time::sleep(Duration::from_millis(10 * attempt as u64)).await;
    }
    cache
        .distribution
        .wait_for_topology(reported.max(seen.id), cache.config.state_transfer_timeout())
        .await
}

async fn read_once(cache: &CacheComponents, topology: &CacheTopology, key: &str) -> Result<Option<InternalEntry>> {
    let owners = topology.read_ch().locate_owners(key);
    if owners.contains(&cache.local) {
        return Ok(cache.container.get(key));
    }

    let mut last_error = None;
    for owner in owners {
        let command = CacheCommand::Get {
            key: key.to_string(),
            topology_id: topology.id,
        };
        match cache
            .rpc
            .invoke(owner, &cache.name, command, cache.config.remote_timeout())
            .await
        {
            Ok(CacheResponse::Entry(entry)) => return Ok(entry),
            Ok(other) => return Err(CacheError::unexpected_response(other)),
            Err(e @ CacheError::OutdatedTopology { .. }) => return Err(e),
            Err(e) => {
                tracing::debug!("Read of {} from {} failed: {}", key, owner, e);
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| CacheError::Internal(format!("no owners for key {}", key))))
}

async fn write_once(cache: &CacheComponents, topology: &CacheTopology, command: &WriteCommand) -> Result<WriteResult> {
    let primary = topology
        .write_ch()
        .locate_primary(&command.key)
        .cloned()
        .ok_or_else(|| CacheError::Internal(format!("no primary owner for key {}", command.key)))?;

    if primary == cache.local {
        return execute_on_primary(cache, command, topology.id).await;
    }

    let forwarded = CacheCommand::ExecuteWrite {
        command: command.clone(),
        topology_id: topology.id,
    };
    match cache
        .rpc
        .invoke(&primary, &cache.name, forwarded, cache.config.remote_timeout())
        .await?
    {
        CacheResponse::Write(result) => Ok(result),
        other => Err(CacheError::unexpected_response(other)),
    }
}

async fn entries_once(cache: &CacheComponents, topology: &CacheTopology) -> Result<Vec<InternalEntry>> {
    let requests = topology.members.iter().filter_map(|member| {
        let segments = topology.read_ch().primary_segments_of(member);
        if segments.is_empty() {
            return None;
        }
        let command = CacheCommand::SegmentEntries {
            segments,
            topology_id: topology.id,
        };
        Some(async move {
            cache
                .rpc
                .invoke(member, &cache.name, command, cache.config.remote_timeout())
                .await
        })
    });

    let mut entries = Vec::new();
    for reply in join_all(requests).await {
        match reply? {
            CacheResponse::Entries(part) => entries.extend(part),
            other => return Err(CacheError::unexpected_response(other)),
        }
    }
    Ok(entries)
}

/// Runs a write on this node as the key's primary owner.
pub(crate) async fn execute_on_primary(
    cache: &CacheComponents,
    command: &WriteCommand,
    topology_id: u64,
) -> Result<WriteResult> {
    cache
        .distribution
        .wait_for_topology(topology_id, cache.config.state_transfer_timeout())
        .await?;

    let owner = LockOwner::Invocation(command.invocation_id.clone());
    let token = cache
        .locks
        .try_lock(&command.key, &owner, cache.config.lock_timeout())
        .await?;
    let result = apply_as_primary(cache, command, topology_id).await;
    cache.locks.unlock(&token);
    result
}

async fn apply_as_primary(cache: &CacheComponents, command: &WriteCommand, topology_id: u64) -> Result<WriteResult> {
    let _shared = cache.st_lock.acquire_shared().await;
    let topology = cache.distribution.require_topology()?;
    if topology.id != topology_id || !topology.write_ch().is_primary_owner(&command.key, &cache.local) {
        return Err(CacheError::OutdatedTopology {
            requested: topology_id,
            current: topology.id,
        });
    }

    let current = cache.container.peek(&command.key);
    let evaluation = command.kind.evaluate(current.as_ref().map(|entry| &entry.value));
    if let Some(effect) = evaluation.effect.clone() {
        let mutation = Mutation::from_effect(effect, next_version(cache, &topology, &command.key));
        apply_mutation(cache, &command.key, &mutation);
        replicate(cache, &topology, &command.key, mutation).await?;
    }
    Ok(WriteResult::from(&evaluation))
}

/// Version for the next write of `key` on its primary.
pub(crate) fn next_version(cache: &CacheComponents, topology: &CacheTopology, key: &str) -> EntryVersion {
    cache
        .versions
        .next_after(topology.id, cache.container.stored_version(key))
}

/// Stores an already validated write in the local container.
pub(crate) fn apply_mutation(cache: &CacheComponents, key: &str, mutation: &Mutation) {
    cache.versions.observe(mutation.version());
    match mutation {
        Mutation::Store {
            value,
            metadata,
            version,
        } => {
            let entry = InternalEntry::new(
                key.to_string(),
                value.clone(),
                Some(*version),
                *metadata,
                cache.container.now(),
            );
            cache.container.put_if_newer(entry);
        }
        Mutation::Remove { version } => {
            cache.container.remove_if_not_newer(key, Some(*version));
        }
    }
    cache
        .consumer
        .note_updated(key, cache.container.segment_of(key));
}

/// Sends `mutation` to every owner of `key` except this node and waits for
/// all of them. Any failure fails the write: the backups' state is unknown.
pub(crate) async fn replicate(
    cache: &CacheComponents,
    topology: &CacheTopology,
    key: &str,
    mutation: Mutation,
) -> Result<()> {
    let backups: Vec<NodeId> = topology
        .write_ch()
        .locate_owners(key)
        .iter()
        .filter(|owner| *owner != &cache.local)
        .cloned()
        .collect();
    if backups.is_empty() {
        return Ok(());
    }

    let command = CacheCommand::Replicate {
        key: key.to_string(),
        mutation,
    };
    let replies = cache
        .rpc
        .invoke_many(&backups, &cache.name, command, cache.config.remote_timeout())
        .await;

    let mut first_error = None;
    for (node, reply) in replies {
        if let Err(e) = reply {
            tracing::warn!("Replication of {} to {} failed: {}", key, node, e);
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

// --- Inbound handlers ---

pub(crate) async fn handle_get(cache: &CacheComponents, key: &str, topology_id: u64) -> Result<CacheResponse> {
    let topology = cache
        .distribution
        .wait_for_topology(topology_id, cache.config.state_transfer_timeout())
        .await?;
    if !topology.read_ch().is_owner(key, &cache.local) {
        return Err(CacheError::OutdatedTopology {
            requested: topology_id,
            current: topology.id,
        });
    }
    Ok(CacheResponse::Entry(cache.container.get(key)))
}

/// Backup side of replication. Owners apply without re-evaluating; a node
/// that no longer owns the key drops the write.
pub(crate) fn handle_replicate(cache: &CacheComponents, key: &str, mutation: Mutation) -> CacheResponse {
    if let Some(topology) = cache.distribution.topology()
        && !topology.write_ch().is_owner(key, &cache.local)
    {
        tracing::debug!(
            "{} is not an owner of {} in topology {}, ignoring replicated write",
            cache.local,
            key,
            topology.id
        );
        return CacheResponse::Ack;
    }
    apply_mutation(cache, key, &mutation);
    CacheResponse::Ack
}

/// Waits for writes this node is executing as primary, then empties the
/// local container.
pub(crate) async fn handle_clear(cache: &CacheComponents) -> CacheResponse {
    let _exclusive = cache.st_lock.acquire_exclusive().await;
    cache.container.clear();
    tracing::debug!("Cache {} cleared on {}", cache.name, cache.local);
    CacheResponse::Ack
}

pub(crate) async fn handle_segment_entries(
    cache: &CacheComponents,
    segments: &[u32],
    topology_id: u64,
) -> Result<CacheResponse> {
    let topology = cache
        .distribution
        .wait_for_topology(topology_id, cache.config.state_transfer_timeout())
        .await?;
    if segments
        .iter()
        .any(|segment| !topology.read_ch().is_segment_owner(*segment, &cache.local))
    {
        return Err(CacheError::OutdatedTopology {
            requested: topology_id,
            current: topology.id,
        });
    }
    Ok(CacheResponse::Entries(cache.container.entries_for_segments(segments)))
}
