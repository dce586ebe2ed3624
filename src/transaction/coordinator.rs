//! Originator side of a transaction.
//!
//! A [`LocalTransaction`] buffers writes in its [`TransactionContext`] and
//! runs the two-phase protocol against the primary owners of the written keys
//! when it commits.

use super::context::{GlobalTxId, TransactionContext, TxState};
use crate::cache::registry::CacheComponents;
use crate::container::Metadata;
use crate::error::{CacheError, Result};
use crate::interceptors::commands::{Modification, WriteKind, WriteResult};
use crate::interceptors::distribution::refresh_topology;
use crate::interceptors::locking::LockingStrategy;
use crate::membership::types::NodeId;
use crate::rpc::protocol::{CacheCommand, CacheResponse};

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct LocalTransaction {
    cache: Arc<CacheComponents>,
    id: GlobalTxId,
    ctx: Mutex<TransactionContext>,
}

impl LocalTransaction {
    pub(crate) fn begin(cache: Arc<CacheComponents>) -> Result<Self> {
        cache.ensure_running()?;
        if !cache.config.is_transactional() {
            return Err(CacheError::Configuration(format!(
                "cache '{}' is not transactional",
                cache.name
            )));
        }

        let id = cache.tx_table.next_tx_id(&cache.local);
        let tx_config = &cache.config.transaction;
        let ctx = TransactionContext::new(
            id.clone(),
            tx_config.locking_mode,
            tx_config.isolation,
            tx_config.write_skew_check,
        );
        tracing::debug!("Began transaction {} on cache {}", id, cache.name);
        Ok(Self {
            cache,
            id,
            ctx: Mutex::new(ctx),
        })
    }

    pub fn id(&self) -> &GlobalTxId {
        &self.id
    }

    pub async fn state(&self) -> TxState {
        self.ctx.lock().await.state
    }

    fn locking(&self) -> Result<&dyn LockingStrategy> {
        self.cache
            .pipeline
            .locking
            .as_deref()
            .ok_or_else(|| CacheError::Configuration(format!("cache '{}' is not transactional", self.cache.name)))
    }

    fn ensure_active(ctx: &TransactionContext) -> Result<()> {
        if ctx.state == TxState::Active {
            Ok(())
        } else {
            Err(CacheError::IllegalTransactionState(format!(
                "transaction {} is {:?}",
                ctx.tx_id, ctx.state
            )))
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        self.cache.ensure_running()?;
        let mut ctx = self.ctx.lock().await;
        Self::ensure_active(&ctx)?;

        if let Some(entry) = ctx.visible(key) {
            return Ok(entry.value.clone());
        }

        let entry = self.cache.pipeline.distribution.read(&self.cache, key).await?;
        self.cache.stats.record_read(entry.is_some());
        Ok(match entry {
            Some(entry) => {
                ctx.record_read(key, Some(entry.value.clone()), entry.metadata, entry.version);
                Some(entry.value)
            }
            None => {
                ctx.record_read(key, None, Metadata::default(), None);
                None
            }
        })
    }

    /// Decides `kind` against the transaction's view of `key` and buffers the
    /// outcome until commit.
    pub async fn write(&self, key: &str, kind: WriteKind) -> Result<WriteResult> {
        self.cache.ensure_running()?;
        let locking = self.locking()?;
        let mut ctx = self.ctx.lock().await;
        Self::ensure_active(&ctx)?;

        locking.acquire_for_write(&self.cache, &mut ctx, key).await?;

        let current = ctx.entries.get(key).and_then(|entry| entry.value.clone());
        let evaluation = kind.evaluate(current.as_ref());
        let guard = locking.guards_conditional_writes() && kind.is_conditional();
        ctx.apply(key, kind, evaluation.effect.clone(), guard);
        Ok(WriteResult::from(&evaluation))
    }

    /// Committed entries with this transaction's writes on top.
    pub async fn entries(&self) -> Result<Vec<(String, Value)>> {
        self.cache.ensure_running()?;
        let ctx = self.ctx.lock().await;
        Self::ensure_active(&ctx)?;

        let committed = self
            .cache
            .pipeline
            .distribution
            .entries(&self.cache)
            .await?
            .into_iter()
            .map(|entry| (entry.key, entry.value))
            .collect();
        Ok(ctx.overlay(committed))
    }

    /// Locks and validates every written key on its primary owner. A failure
    /// rolls the transaction back everywhere.
    pub async fn prepare(&self) -> Result<()> {
        let mut ctx = self.ctx.lock().await;
        self.prepare_locked(&mut ctx).await
    }

    async fn prepare_locked(&self, ctx: &mut TransactionContext) -> Result<()> {
        match ctx.state {
            TxState::Active => {}
            TxState::Prepared => return Ok(()),
            state => {
                return Err(CacheError::IllegalTransactionState(format!(
                    "cannot prepare transaction {} in state {:?}",
                    ctx.tx_id, state
                )));
            }
        }

        ctx.state = TxState::Preparing;
        match self.send_prepare(ctx).await {
            Ok(()) => {
                ctx.state = TxState::Prepared;
                Ok(())
            }
            Err(e) => {
                tracing::debug!("Prepare of {} failed: {}", ctx.tx_id, e);
                self.rollback_locked(ctx).await;
                Err(e)
            }
        }
    }

    async fn send_prepare(&self, ctx: &mut TransactionContext) -> Result<()> {
        let cache = &self.cache;
        let mut guard_all = self.locking()?.guards_all_writes();
        let mut topology = cache.current_topology().await?;
        let mut attempt = 0;

        loop {
            let modifications = ctx.build_modifications(guard_all);
            if modifications.is_empty() {
                return Ok(());
            }

            let mut by_primary: BTreeMap<NodeId, Vec<Modification>> = BTreeMap::new();
            for modification in modifications {
                let primary = topology
                    .write_ch()
                    .locate_primary(&modification.key)
                    .cloned()
                    .ok_or_else(|| {
                        CacheError::Internal(format!("no primary owner for key {}", modification.key))
                    })?;
                by_primary.entry(primary).or_default().push(modification);
            }

            let mut outcome = Ok(());
            for (primary, modifications) in by_primary {
                ctx.lock_owners.insert(primary.clone());
                let command = CacheCommand::Prepare {
                    tx: ctx.tx_id.clone(),
                    modifications,
                    topology_id: topology.id,
                };
                match cache
                    .rpc
                    .invoke(&primary, &cache.name, command, cache.config.remote_timeout())
                    .await
                {
                    Ok(CacheResponse::Prepared) => {}
                    Ok(other) => {
                        outcome = Err(CacheError::unexpected_response(other));
                        break;
                    }
                    Err(e) => {
                        outcome = Err(e);
                        break;
                    }
                }
            }

            match outcome {
                Err(CacheError::OutdatedTopology { current, .. })
                    if attempt < cache.config.max_topology_retries =>
                {
                    tracing::debug!(
                        "Prepare of {} hit an outdated topology {}, preparing again",
                        ctx.tx_id,
                        topology.id
                    );
                    self.broadcast_to_lock_owners(ctx, CacheCommand::ReleaseLocks {
                        tx: ctx.tx_id.clone(),
                    })
                    .await;
                    ctx.locked_keys.clear();
                    // Locks were dropped: every written key must now prove it did not change.
                    guard_all = true;
                    attempt += 1;
                    topology = refresh_topology(cache, &topology, current, attempt).await?;
                }
                other => return other,
            }
        }
    }

    /// Commits, preparing first if needed.
    pub async fn commit(&self) -> Result<()> {
        self.cache.ensure_running()?;
        let mut ctx = self.ctx.lock().await;
        if ctx.state == TxState::Active {
            self.prepare_locked(&mut ctx).await?;
        }
        if ctx.state != TxState::Prepared {
            return Err(CacheError::IllegalTransactionState(format!(
                "cannot commit transaction {} in state {:?}",
                ctx.tx_id, ctx.state
            )));
        }

        ctx.state = TxState::Committing;
        let owners: Vec<NodeId> = ctx.lock_owners.iter().cloned().collect();
        let replies = self
            .cache
            .rpc
            .invoke_many(
                &owners,
                &self.cache.name,
                CacheCommand::Commit {
                    tx: ctx.tx_id.clone(),
                },
                self.cache.config.remote_timeout(),
            )
            .await;
        ctx.state = TxState::Committed;
        self.cache.stats.record_commit();

        let mut first_error = None;
        for (node, reply) in replies {
            if let Err(e) = reply {
                tracing::warn!("Commit of {} on {} failed: {}", ctx.tx_id, node, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                tracing::debug!("Committed {} on {} owners", ctx.tx_id, owners.len());
                Ok(())
            }
        }
    }

    /// Rolls back from any non-terminal state. Rolling back twice is a no-op.
    pub async fn rollback(&self) -> Result<()> {
        let mut ctx = self.ctx.lock().await;
        match ctx.state {
            TxState::RolledBack => Ok(()),
            TxState::Committed => Err(CacheError::IllegalTransactionState(format!(
                "transaction {} is already committed",
                ctx.tx_id
            ))),
            _ => {
                self.rollback_locked(&mut ctx).await;
                Ok(())
            }
        }
    }

    async fn rollback_locked(&self, ctx: &mut TransactionContext) {
        ctx.state = TxState::RollingBack;
        self.broadcast_to_lock_owners(ctx, CacheCommand::Rollback {
            tx: ctx.tx_id.clone(),
        })
        .await;
        ctx.state = TxState::RolledBack;
        ctx.locked_keys.clear();
        self.cache.stats.record_rollback();
        tracing::debug!("Rolled back {}", ctx.tx_id);
    }

    /// Best effort: an owner that cannot be reached releases the
    /// transaction's locks once this node leaves its view.
    async fn broadcast_to_lock_owners(&self, ctx: &TransactionContext, command: CacheCommand) {
        let owners: Vec<NodeId> = ctx.lock_owners.iter().cloned().collect();
        if owners.is_empty() {
            return;
        }
        let name = command.name();
        let replies = self
            .cache
            .rpc
            .invoke_many(&owners, &self.cache.name, command, self.cache.config.remote_timeout())
            .await;
        for (node, reply) in replies {
            if let Err(e) = reply {
                tracing::warn!("{} of {} failed on {}: {}", name, ctx.tx_id, node, e);
            }
        }
    }
}

impl Drop for LocalTransaction {
    /// A transaction dropped while holding locks is rolled back in the background.
    fn drop(&mut self) {
        let Ok(ctx) = self.ctx.try_lock() else {
            return;
        };
        if ctx.state.is_terminal() || ctx.lock_owners.is_empty() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let cache = self.cache.clone();
        let tx = ctx.tx_id.clone();
        let owners: Vec<NodeId> = ctx.lock_owners.iter().cloned().collect();
        runtime.spawn(async move {
            tracing::debug!("Rolling back abandoned transaction {}", tx);
            cache
                .rpc
                .invoke_many(
                    &owners,
                    &cache.name,
                    CacheCommand::Rollback { tx },
                    cache.config.remote_timeout(),
                )
                .await;
            cache.stats.record_rollback();
        });
    }
}
