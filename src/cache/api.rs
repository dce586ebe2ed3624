//! Typed map API.
//!
//! Keys travel as their string form and values as JSON, so any
//! `ToString + FromStr` key and any serde value type can be used.

use super::registry::{CacheComponents, CacheId};
use super::stats::StatsSnapshot;
use crate::config::CacheConfig;
use crate::container::Metadata;
use crate::distribution::CacheTopology;
use crate::error::{CacheError, Result};
use crate::interceptors::commands::{WriteCommand, WriteKind, WriteResult};
use crate::membership::types::NodeId;
use crate::transaction::{GlobalTxId, LocalTransaction, TxState};

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::fmt::Display;
use std::future::Future;
use std::marker::PhantomData;
use std::str::FromStr;
use std::sync::Arc;

fn encode<V: Serialize>(value: &V) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

fn decode<V: DeserializeOwned>(value: Value) -> Result<V> {
    Ok(serde_json::from_value(value)?)
}

fn decode_opt<V: DeserializeOwned>(value: Option<Value>) -> Result<Option<V>> {
    value.map(decode).transpose()
}

fn decode_key<K>(key: String) -> Result<K>
where
    K: FromStr,
    <K as FromStr>::Err: Display,
{
    key.parse()
        .map_err(|e: <K as FromStr>::Err| CacheError::Serialization(format!("invalid key '{}': {}", key, e)))
}

/// Builds write kinds with the cache's default expiration filled in.
#[derive(Debug, Clone, Copy)]
struct Writes {
    default_lifespan_ms: i64,
    default_max_idle_ms: i64,
}

impl Writes {
    fn of(config: &CacheConfig) -> Self {
        Self {
            default_lifespan_ms: config.default_lifespan_ms,
            default_max_idle_ms: config.default_max_idle_ms,
        }
    }

    fn metadata(&self, metadata: Metadata) -> Metadata {
        metadata.or_defaults(self.default_lifespan_ms, self.default_max_idle_ms)
    }

    fn put<V: Serialize>(&self, value: &V, metadata: Metadata) -> Result<WriteKind> {
        Ok(WriteKind::Put {
            value: encode(value)?,
            metadata: self.metadata(metadata),
        })
    }

    fn put_if_absent<V: Serialize>(&self, value: &V) -> Result<WriteKind> {
        Ok(WriteKind::PutIfAbsent {
            value: encode(value)?,
            metadata: self.metadata(Metadata::default()),
        })
    }

    fn replace<V: Serialize>(&self, value: &V) -> Result<WriteKind> {
        Ok(WriteKind::Replace {
            value: encode(value)?,
            metadata: self.metadata(Metadata::default()),
        })
    }

    fn replace_if_equals<V: Serialize>(&self, expected: &V, value: &V) -> Result<WriteKind> {
        Ok(WriteKind::ReplaceIfEquals {
            expected: encode(expected)?,
            value: encode(value)?,
            metadata: self.metadata(Metadata::default()),
        })
    }

    fn remove_if_equals<V: Serialize>(&self, expected: &V) -> Result<WriteKind> {
        Ok(WriteKind::RemoveIfEquals {
            expected: encode(expected)?,
        })
    }
}

fn record_write(cache: &CacheComponents, kind: &WriteKind, result: &WriteResult) {
    if !result.applied {
        return;
    }
    match kind {
        WriteKind::Remove | WriteKind::RemoveIfEquals { .. } => cache.stats.record_remove(),
        _ => cache.stats.record_store(),
    }
}

/// Handle to one cache. Cheap to clone.
pub struct Cache<K, V> {
    id: CacheId,
    components: Arc<CacheComponents>,
    _types: PhantomData<fn() -> (K, V)>,
}

impl<K, V> Clone for Cache<K, V> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            components: self.components.clone(),
            _types: PhantomData,
        }
    }
}

impl<K, V> Cache<K, V>
where
    K: ToString + FromStr,
    <K as FromStr>::Err: Display,
    V: Serialize + DeserializeOwned,
{
    pub(crate) fn new(id: CacheId, components: Arc<CacheComponents>) -> Self {
        Self {
            id,
            components,
            _types: PhantomData,
        }
    }

    pub fn id(&self) -> CacheId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.components.name
    }

    pub fn config(&self) -> &CacheConfig {
        &self.components.config
    }

    pub async fn get(&self, key: &K) -> Result<Option<V>> {
        let cache = &self.components;
        cache.ensure_running()?;
        let entry = cache
            .pipeline
            .distribution
            .read(cache, &key.to_string())
            .await?;
        cache.stats.record_read(entry.is_some());
        decode_opt(entry.map(|entry| entry.value))
    }

    pub async fn contains_key(&self, key: &K) -> Result<bool> {
        let cache = &self.components;
        cache.ensure_running()?;
        Ok(cache
            .pipeline
            .distribution
            .read(cache, &key.to_string())
            .await?
            .is_some())
    }

    /// Stores `value` and returns the previous one.
    pub async fn put(&self, key: &K, value: &V) -> Result<Option<V>> {
        self.put_with_metadata(key, value, Metadata::default()).await
    }

    pub async fn put_with_metadata(&self, key: &K, value: &V, metadata: Metadata) -> Result<Option<V>> {
        let kind = self.writes().put(value, metadata)?;
        decode_opt(self.write(key, kind).await?.previous)
    }

    /// Stores `value` unless the key is present. Returns the value already
    /// present, or `None` if this call stored it.
    pub async fn put_if_absent(&self, key: &K, value: &V) -> Result<Option<V>> {
        let kind = self.writes().put_if_absent(value)?;
        decode_opt(self.write(key, kind).await?.previous)
    }

    /// Replaces the value of a present key. Returns the replaced value, or
    /// `None` if the key was absent and nothing was stored.
    pub async fn replace(&self, key: &K, value: &V) -> Result<Option<V>> {
        let kind = self.writes().replace(value)?;
        let result = self.write(key, kind).await?;
        if result.applied {
            decode_opt(result.previous)
        } else {
            Ok(None)
        }
    }

    pub async fn replace_if_equals(&self, key: &K, expected: &V, value: &V) -> Result<bool> {
        let kind = self.writes().replace_if_equals(expected, value)?;
        Ok(self.write(key, kind).await?.applied)
    }

    pub async fn remove(&self, key: &K) -> Result<Option<V>> {
        decode_opt(self.write(key, WriteKind::Remove).await?.previous)
    }

    pub async fn remove_if_equals(&self, key: &K, expected: &V) -> Result<bool> {
        let kind = self.writes().remove_if_equals(expected)?;
        Ok(self.write(key, kind).await?.applied)
    }

    /// Empties the cache on every member. Not atomic across the cluster.
    pub async fn clear(&self) -> Result<()> {
        let cache = &self.components;
        cache.ensure_running()?;
        cache.pipeline.distribution.clear(cache).await
    }

    pub async fn size(&self) -> Result<usize> {
        Ok(self.raw_entries().await?.len())
    }

    pub async fn keys(&self) -> Result<Vec<K>> {
        self.raw_entries()
            .await?
            .into_iter()
            .map(|(key, _)| decode_key(key))
            .collect()
    }

    pub async fn values(&self) -> Result<Vec<V>> {
        self.raw_entries()
            .await?
            .into_iter()
            .map(|(_, value)| decode(value))
            .collect()
    }

    /// Snapshot of the whole cache, each entry read from one owner.
    pub async fn entries(&self) -> Result<Vec<(K, V)>> {
        self.raw_entries()
            .await?
            .into_iter()
            .map(|(key, value)| Ok((decode_key(key)?, decode(value)?)))
            .collect()
    }

    async fn raw_entries(&self) -> Result<Vec<(String, Value)>> {
        let cache = &self.components;
        cache.ensure_running()?;
        let mut entries: Vec<(String, Value)> = cache
            .pipeline
            .distribution
            .entries(cache)
            .await?
            .into_iter()
            .map(|entry| (entry.key, entry.value))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }

    fn writes(&self) -> Writes {
        Writes::of(&self.components.config)
    }

    async fn write(&self, key: &K, kind: WriteKind) -> Result<WriteResult> {
        let cache = &self.components;
        cache.ensure_running()?;
        let key = key.to_string();

        let result = if cache.pipeline.locking.is_some() {
            self.implicit_transaction(&key, &kind).await?
        } else {
            cache
                .pipeline
                .distribution
                .write(cache, WriteCommand::new(key, kind.clone()))
                .await?
        };
        record_write(cache, &kind, &result);
        Ok(result)
    }

    /// A single write on a transactional cache commits on its own. A
    /// conditional write decided on a value that changed before it prepared
    /// is decided again.
    async fn implicit_transaction(&self, key: &str, kind: &WriteKind) -> Result<WriteResult> {
        let cache = &self.components;
        let mut attempt = 0;
        loop {
            let tx = LocalTransaction::begin(cache.clone())?;
            let result = match tx.write(key, kind.clone()).await {
                Ok(result) => result,
                Err(e) => {
                    let _ = tx.rollback().await;
                    return Err(e);
                }
            };
            match tx.commit().await {
                Ok(()) => return Ok(result),
                Err(CacheError::WriteSkew { .. }) if attempt < cache.config.max_topology_retries => {
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Starts an explicit transaction.
    pub fn begin(&self) -> Result<Transaction<K, V>> {
        let tx = LocalTransaction::begin(self.components.clone())?;
        Ok(Transaction {
            inner: Arc::new(tx),
            writes: self.writes(),
            components: self.components.clone(),
            _types: PhantomData,
        })
    }

    /// Runs `f` in a transaction and commits it. Conflicts that a fresh
    /// attempt may resolve (`is_retryable`) run the whole closure again, up to
    /// `max_retries` times.
    pub async fn in_transaction<F, Fut, T>(&self, max_retries: u32, mut f: F) -> Result<T>
    where
        F: FnMut(Transaction<K, V>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            let tx = self.begin()?;
            let outcome = match f(tx.clone()).await {
                Ok(value) => tx.commit().await.map(|()| value),
                Err(e) => {
                    let _ = tx.rollback().await;
                    Err(e)
                }
            };
            match outcome {
                Err(e) if e.is_retryable() && attempt < max_retries => {
                    tracing::debug!("Transaction {} failed ({}), retrying", tx.id(), e);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    // --- Introspection ---

    /// Entries held by this node, primary and backup copies alike.
    pub fn local_size(&self) -> usize {
        self.components.container.size()
    }

    /// Reads this node's copy of `key` without routing or touching it.
    pub fn peek_local(&self, key: &K) -> Result<Option<V>> {
        decode_opt(
            self.components
                .container
                .peek(&key.to_string())
                .map(|entry| entry.value),
        )
    }

    pub fn lock_count(&self) -> usize {
        self.components.locks.num_locks_held()
    }

    pub fn is_locked(&self, key: &K) -> bool {
        self.components.locks.is_locked(&key.to_string())
    }

    /// Transactions holding locks or prepared state on this node.
    pub fn remote_transaction_count(&self) -> usize {
        self.components.tx_table.len()
    }

    pub fn locate_owners(&self, key: &K) -> Result<Vec<NodeId>> {
        self.components.distribution.locate_owners(&key.to_string())
    }

    pub fn is_primary_owner(&self, key: &K) -> bool {
        self.components.distribution.is_primary_owner(&key.to_string())
    }

    pub fn topology(&self) -> Option<CacheTopology> {
        self.components.distribution.topology().map(|t| (*t).clone())
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.components.stats.snapshot(
            self.components.container.size(),
            self.components.locks.num_locks_held(),
            self.components.container.evictions(),
        )
    }
}

/// An explicit transaction. Clones share the same transaction.
pub struct Transaction<K, V> {
    inner: Arc<LocalTransaction>,
    writes: Writes,
    components: Arc<CacheComponents>,
    _types: PhantomData<fn() -> (K, V)>,
}

impl<K, V> Clone for Transaction<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            writes: self.writes,
            components: self.components.clone(),
            _types: PhantomData,
        }
    }
}

impl<K, V> Transaction<K, V>
where
    K: ToString + FromStr,
    <K as FromStr>::Err: Display,
    V: Serialize + DeserializeOwned,
{
    pub fn id(&self) -> &GlobalTxId {
        self.inner.id()
    }

    pub async fn state(&self) -> TxState {
        self.inner.state().await
    }

    pub async fn get(&self, key: &K) -> Result<Option<V>> {
        decode_opt(self.inner.get(&key.to_string()).await?)
    }

    pub async fn contains_key(&self, key: &K) -> Result<bool> {
        Ok(self.inner.get(&key.to_string()).await?.is_some())
    }

    async fn write(&self, key: &K, kind: WriteKind) -> Result<WriteResult> {
        let result = self.inner.write(&key.to_string(), kind.clone()).await?;
        record_write(&self.components, &kind, &result);
        Ok(result)
    }

    pub async fn put(&self, key: &K, value: &V) -> Result<Option<V>> {
        self.put_with_metadata(key, value, Metadata::default()).await
    }

    pub async fn put_with_metadata(&self, key: &K, value: &V, metadata: Metadata) -> Result<Option<V>> {
        let kind = self.writes.put(value, metadata)?;
        decode_opt(self.write(key, kind).await?.previous)
    }

    pub async fn put_if_absent(&self, key: &K, value: &V) -> Result<Option<V>> {
        let kind = self.writes.put_if_absent(value)?;
        decode_opt(self.write(key, kind).await?.previous)
    }

    pub async fn replace(&self, key: &K, value: &V) -> Result<Option<V>> {
        let kind = self.writes.replace(value)?;
        let result = self.write(key, kind).await?;
        if result.applied {
            decode_opt(result.previous)
        } else {
            Ok(None)
        }
    }

    pub async fn replace_if_equals(&self, key: &K, expected: &V, value: &V) -> Result<bool> {
        let kind = self.writes.replace_if_equals(expected, value)?;
        Ok(self.write(key, kind).await?.applied)
    }

    pub async fn remove(&self, key: &K) -> Result<Option<V>> {
        decode_opt(self.write(key, WriteKind::Remove).await?.previous)
    }

    pub async fn remove_if_equals(&self, key: &K, expected: &V) -> Result<bool> {
        let kind = self.writes.remove_if_equals(expected)?;
        Ok(self.write(key, kind).await?.applied)
    }

    pub async fn entries(&self) -> Result<Vec<(K, V)>> {
        self.inner
            .entries()
            .await?
            .into_iter()
            .map(|(key, value)| Ok((decode_key(key)?, decode(value)?)))
            .collect()
    }

    pub async fn keys(&self) -> Result<Vec<K>> {
        self.inner
            .entries()
            .await?
            .into_iter()
            .map(|(key, _)| decode_key(key))
            .collect()
    }

    pub async fn size(&self) -> Result<usize> {
        Ok(self.inner.entries().await?.len())
    }

    pub async fn prepare(&self) -> Result<()> {
        self.inner.prepare().await
    }

    pub async fn commit(&self) -> Result<()> {
        self.inner.commit().await
    }

    pub async fn rollback(&self) -> Result<()> {
        self.inner.rollback().await
    }
}
