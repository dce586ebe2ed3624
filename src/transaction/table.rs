//! Owner side of the two-phase protocol.
//!
//! Every primary keeps the transactions that hold locks on it, with the
//! modifications they prepared there, until the originator commits or rolls
//! them back.

use super::context::GlobalTxId;
use crate::cache::registry::CacheComponents;
use crate::error::{CacheError, Result};
use crate::interceptors::commands::{Modification, Mutation};
use crate::interceptors::distribution::{apply_mutation, next_version, replicate};
use crate::lock::LockOwner;
use crate::membership::types::NodeId;
use crate::rpc::protocol::CacheResponse;

use dashmap::DashMap;
use futures::future::join_all;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Completed ids kept for refusing late prepares.
const COMPLETED_RETENTION: Duration = Duration::from_secs(60);
const COMPLETED_PRUNE_THRESHOLD: usize = 10_000;

#[derive(Debug, Clone)]
pub struct RemoteTransaction {
    pub origin: NodeId,
    pub modifications: Vec<Modification>,
    pub prepared: bool,
    /// Topology the modifications were validated against.
    pub topology_id: u64,
}

#[derive(Debug, Default)]
pub struct TransactionTable {
    remote: DashMap<GlobalTxId, RemoteTransaction>,
    /// Transactions rolled back or committed here, with completion time.
    completed: DashMap<GlobalTxId, u64>,
    local_ids: AtomicU64,
}

impl TransactionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id for a transaction started on `node`.
    pub fn next_tx_id(&self, node: &NodeId) -> GlobalTxId {
        GlobalTxId::new(node.clone(), self.local_ids.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn register(&self, tx: &GlobalTxId, origin: &NodeId) {
        self.remote
            .entry(tx.clone())
            .or_insert_with(|| RemoteTransaction {
                origin: origin.clone(),
                modifications: Vec::new(),
                prepared: false,
                topology_id: 0,
            });
    }

    fn store_prepared(
        &self,
        tx: &GlobalTxId,
        origin: &NodeId,
        modifications: Vec<Modification>,
        topology_id: u64,
    ) {
        self.remote.insert(
            tx.clone(),
            RemoteTransaction {
                origin: origin.clone(),
                modifications,
                prepared: true,
                topology_id,
            },
        );
    }

    fn take(&self, tx: &GlobalTxId) -> Option<RemoteTransaction> {
        self.remote.remove(tx).map(|(_, remote)| remote)
    }

    fn mark_completed(&self, tx: &GlobalTxId, now: u64) {
        if self.completed.len() > COMPLETED_PRUNE_THRESHOLD {
            let cutoff = now.saturating_sub(COMPLETED_RETENTION.as_millis() as u64);
            self.completed.retain(|_, completed_at| *completed_at >= cutoff);
        }
        self.completed.insert(tx.clone(), now);
    }

    pub fn is_completed(&self, tx: &GlobalTxId) -> bool {
        self.completed.contains_key(tx)
    }

    pub fn get(&self, tx: &GlobalTxId) -> Option<RemoteTransaction> {
        self.remote.get(tx).map(|remote| remote.value().clone())
    }

    pub fn len(&self) -> usize {
        self.remote.len()
    }

    pub fn is_empty(&self) -> bool {
        self.remote.is_empty()
    }

    fn originated_outside(&self, members: &[NodeId]) -> Vec<GlobalTxId> {
        self.remote
            .iter()
            .filter(|remote| !members.contains(&remote.value().origin))
            .map(|remote| remote.key().clone())
            .collect()
    }
}

fn refuse_completed(tx: &GlobalTxId) -> CacheError {
    CacheError::RolledBack {
        tx: tx.to_string(),
        reason: "transaction already completed on this node".into(),
    }
}

/// Releases everything `tx` holds here without remembering it as completed.
fn abandon(cache: &CacheComponents, tx: &GlobalTxId) {
    cache.tx_table.take(tx);
    cache.locks.release_owner(&LockOwner::Transaction(tx.clone()));
}

fn sort_for_locking(cache: &CacheComponents, keys: &mut Vec<String>) {
    keys.sort_by(|a, b| {
        (cache.container.segment_of(a), a).cmp(&(cache.container.segment_of(b), b))
    });
    keys.dedup();
}

/// Locks `keys` for `tx` in canonical order. On failure the caller's
/// rollback releases whatever was acquired.
async fn lock_keys(cache: &CacheComponents, tx: &GlobalTxId, keys: &[String]) -> Result<()> {
    let owner = LockOwner::Transaction(tx.clone());
    for key in keys {
        cache
            .locks
            .try_lock(key, &owner, cache.config.lock_timeout())
            .await?;
    }
    Ok(())
}

/// Eager locking for a pessimistic transaction.
pub(crate) async fn handle_lock_keys(
    cache: &CacheComponents,
    origin: NodeId,
    tx: GlobalTxId,
    mut keys: Vec<String>,
    topology_id: u64,
) -> Result<CacheResponse> {
    if cache.tx_table.is_completed(&tx) {
        return Err(refuse_completed(&tx));
    }
    cache
        .distribution
        .wait_for_topology(topology_id, cache.config.state_transfer_timeout())
        .await?;

    cache.tx_table.register(&tx, &origin);
    sort_for_locking(cache, &mut keys);
    lock_keys(cache, &tx, &keys).await?;

    if cache.tx_table.is_completed(&tx) {
        abandon(cache, &tx);
        return Err(refuse_completed(&tx));
    }

    let _shared = cache.st_lock.acquire_shared().await;
    let topology = cache.distribution.require_topology()?;
    if topology.id != topology_id
        || keys
            .iter()
            .any(|key| !topology.write_ch().is_primary_owner(key, &cache.local))
    {
        return Err(CacheError::OutdatedTopology {
            requested: topology_id,
            current: topology.id,
        });
    }

    tracing::debug!("{} locked {} keys for {}", cache.local, keys.len(), tx);
    let locked = keys
        .into_iter()
        .map(|key| {
            let entry = cache.container.peek(&key);
            (key, entry)
        })
        .collect();
    Ok(CacheResponse::Locked(locked))
}

/// First phase: lock, validate and remember the modifications.
pub(crate) async fn handle_prepare(
    cache: &CacheComponents,
    origin: NodeId,
    tx: GlobalTxId,
    modifications: Vec<Modification>,
    topology_id: u64,
) -> Result<CacheResponse> {
    if cache.tx_table.is_completed(&tx) {
        abandon(cache, &tx);
        return Err(refuse_completed(&tx));
    }
    cache
        .distribution
        .wait_for_topology(topology_id, cache.config.state_transfer_timeout())
        .await?;

    cache.tx_table.register(&tx, &origin);
    let mut keys: Vec<String> = modifications.iter().map(|m| m.key.clone()).collect();
    sort_for_locking(cache, &mut keys);
    if let Err(e) = lock_keys(cache, &tx, &keys).await {
        abandon(cache, &tx);
        return Err(e);
    }

    if cache.tx_table.is_completed(&tx) {
        abandon(cache, &tx);
        return Err(refuse_completed(&tx));
    }

    {
        let _shared = cache.st_lock.acquire_shared().await;
        let topology = cache.distribution.require_topology()?;
        if topology.id != topology_id
            || keys
                .iter()
                .any(|key| !topology.write_ch().is_primary_owner(key, &cache.local))
        {
            abandon(cache, &tx);
            return Err(CacheError::OutdatedTopology {
                requested: topology_id,
                current: topology.id,
            });
        }

        for modification in &modifications {
            let Some(guard) = modification.guard else {
                continue;
            };
            let current = cache
                .container
                .peek(&modification.key)
                .and_then(|entry| entry.version);
            if current != guard.expected {
                tracing::debug!(
                    "{} rejects {}: key {} is at {:?}, expected {:?}",
                    cache.local,
                    tx,
                    modification.key,
                    current,
                    guard.expected
                );
                abandon(cache, &tx);
                return Err(CacheError::WriteSkew {
                    key: modification.key.clone(),
                    tx: tx.to_string(),
                });
            }
        }
    }

    tracing::debug!(
        "{} prepared {} with {} modifications",
        cache.local,
        tx,
        modifications.len()
    );
    cache
        .tx_table
        .store_prepared(&tx, &origin, modifications, topology_id);
    Ok(CacheResponse::Prepared)
}

/// Second phase: apply the prepared modifications with fresh versions,
/// replicate them and release the locks.
///
/// A commit arriving after this node stopped being primary for one of the
/// keys is refused: another node may already have accepted writes for it.
pub(crate) async fn handle_commit(cache: &CacheComponents, tx: GlobalTxId) -> Result<CacheResponse> {
    let remote = cache.tx_table.take(&tx);
    let mut result = Ok(CacheResponse::Ack);

    if let Some(remote) = remote.filter(|remote| remote.prepared) {
        let _shared = cache.st_lock.acquire_shared().await;
        match cache.distribution.require_topology() {
            Ok(topology)
                if remote
                    .modifications
                    .iter()
                    .any(|m| !topology.write_ch().is_primary_owner(&m.key, &cache.local)) =>
            {
                tracing::warn!(
                    "{} refuses to commit {}: primary ownership moved since topology {}",
                    cache.local,
                    tx,
                    remote.topology_id
                );
                result = Err(CacheError::OutdatedTopology {
                    requested: remote.topology_id,
                    current: topology.id,
                });
            }
            Ok(topology) => {
                let replications = remote.modifications.into_iter().filter_map(|modification| {
                    let key = modification.key;
                    let effect = modification.effect?;
                    let mutation = Mutation::from_effect(effect, next_version(cache, &topology, &key));
                    apply_mutation(cache, &key, &mutation);
                    let topology = topology.clone();
                    Some(async move { replicate(cache, &topology, &key, mutation).await })
                });
                let failures: Vec<CacheError> = join_all(replications.collect::<Vec<_>>())
                    .await
                    .into_iter()
                    .filter_map(|replicated| replicated.err())
                    .collect();
                if let Some(e) = failures.into_iter().next() {
                    tracing::warn!("{} committed {} but replication failed: {}", cache.local, tx, e);
                    result = Err(e);
                }
            }
            Err(e) => result = Err(e),
        }
    }

    let released = cache.locks.release_owner(&LockOwner::Transaction(tx.clone()));
    cache.tx_table.mark_completed(&tx, cache.container.now());
    tracing::debug!("{} committed {}, released {} locks", cache.local, tx, released);
    result
}

/// Final rollback. Any later prepare of `tx` on this node is refused.
pub(crate) fn handle_rollback(cache: &CacheComponents, tx: GlobalTxId) -> CacheResponse {
    abandon(cache, &tx);
    cache.tx_table.mark_completed(&tx, cache.container.now());
    tracing::debug!("{} rolled back {}", cache.local, tx);
    CacheResponse::Ack
}

/// Drops locks and prepared state so the originator can prepare again.
pub(crate) fn handle_release_locks(cache: &CacheComponents, tx: GlobalTxId) -> CacheResponse {
    abandon(cache, &tx);
    CacheResponse::Ack
}

/// Rolls back transactions whose originator is no longer a member.
pub(crate) fn cleanup_leavers(cache: &CacheComponents, members: &[NodeId]) -> usize {
    let orphaned = cache.tx_table.originated_outside(members);
    for tx in &orphaned {
        tracing::info!(
            "Cache {} on {}: rolling back {} after its originator left",
            cache.name,
            cache.local,
            tx
        );
        handle_rollback(cache, tx.clone());
    }
    orphaned.len()
}
