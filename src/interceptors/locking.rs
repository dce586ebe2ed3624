use super::distribution::refresh_topology;
use crate::cache::registry::CacheComponents;
use crate::config::LockingMode;
use crate::error::{CacheError, Result};
use crate::rpc::protocol::{CacheCommand, CacheResponse};
use crate::transaction::TransactionContext;

use async_trait::async_trait;

/// How a transaction brings a key into its context before writing it.
#[async_trait]
pub trait LockingStrategy: Send + Sync {
    fn mode(&self) -> LockingMode;

    async fn acquire_for_write(
        &self,
        cache: &CacheComponents,
        ctx: &mut TransactionContext,
        key: &str,
    ) -> Result<()>;

    /// Whether conditional writes carry a version guard to prepare.
    fn guards_conditional_writes(&self) -> bool;

    /// Whether every written key is guarded at prepare.
    fn guards_all_writes(&self) -> bool;
}

/// Locks are taken at prepare; the value a write is decided on is read
/// without locking and validated by version at prepare.
pub struct OptimisticLocking;

#[async_trait]
impl LockingStrategy for OptimisticLocking {
    fn mode(&self) -> LockingMode {
        LockingMode::Optimistic
    }

    async fn acquire_for_write(
        &self,
        cache: &CacheComponents,
        ctx: &mut TransactionContext,
        key: &str,
    ) -> Result<()> {
        if ctx.entries.contains_key(key) {
            return Ok(());
        }
        let entry = cache.pipeline.distribution.read(cache, key).await?;
        match entry {
            Some(entry) => ctx.track_for_write(key, Some(entry.value), entry.metadata, entry.version),
            None => ctx.track_for_write(key, None, Default::default(), None),
        }
        Ok(())
    }

    fn guards_conditional_writes(&self) -> bool {
        true
    }

    fn guards_all_writes(&self) -> bool {
        false
    }
}

/// Every write first locks its key on the primary owner, which also returns
/// the value the write is decided on.
pub struct PessimisticLocking;

#[async_trait]
impl LockingStrategy for PessimisticLocking {
    fn mode(&self) -> LockingMode {
        LockingMode::Pessimistic
    }

    async fn acquire_for_write(
        &self,
        cache: &CacheComponents,
        ctx: &mut TransactionContext,
        key: &str,
    ) -> Result<()> {
        if ctx.locked_keys.contains(key) {
            return Ok(());
        }

        let mut topology = cache.current_topology().await?;
        let mut attempt = 0;
        let locked = loop {
            let primary = topology
                .write_ch()
                .locate_primary(key)
                .cloned()
                .ok_or_else(|| CacheError::Internal(format!("no primary owner for key {}", key)))?;
            // Recorded before sending: the lock may be taken even if the reply is lost.
            ctx.lock_owners.insert(primary.clone());

            let command = CacheCommand::LockKeys {
                tx: ctx.tx_id.clone(),
                keys: vec![key.to_string()],
                topology_id: topology.id,
            };
            match cache
                .rpc
                .invoke(&primary, &cache.name, command, cache.config.remote_timeout())
                .await
            {
                Ok(CacheResponse::Locked(locked)) => break locked,
                Ok(other) => return Err(CacheError::unexpected_response(other)),
                Err(CacheError::OutdatedTopology { current, .. })
                    if attempt < cache.config.max_topology_retries =>
                {
                    attempt += 1;
                    topology = refresh_topology(cache, &topology, current, attempt).await?;
                }
                Err(e) => return Err(e),
            }
        };

        for (locked_key, entry) in locked {
            let (value, metadata, version) = match entry {
                Some(entry) => (Some(entry.value), entry.metadata, entry.version),
                None => (None, Default::default(), None),
            };
            match ctx.entries.get_mut(&locked_key) {
                // The stored value can only change until the lock is held.
                Some(tracked) if !tracked.modified => {
                    tracked.value = value;
                    tracked.metadata = metadata;
                    tracked.base_version = version;
                }
                Some(_) => {}
                None => ctx.track_for_write(&locked_key, value, metadata, version),
            }
            ctx.locked_keys.insert(locked_key);
        }
        Ok(())
    }

    fn guards_conditional_writes(&self) -> bool {
        false
    }

    /// Holding the lock keeps the guard satisfied; it only fails when the
    /// key's primary changed since the lock was taken.
    fn guards_all_writes(&self) -> bool {
        true
    }
}
