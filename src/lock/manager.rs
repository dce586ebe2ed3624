use crate::error::{CacheError, Result};
use crate::transaction::GlobalTxId;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Upper bound between two ownership checks of a waiter.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Who holds a key lock: a transaction, or a single non-transactional write.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockOwner {
    Transaction(GlobalTxId),
    Invocation(String),
}

impl fmt::Display for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockOwner::Transaction(tx) => write!(f, "tx {}", tx),
            LockOwner::Invocation(id) => write!(f, "invocation {}", id),
        }
    }
}

/// Proof of a successful `try_lock`.
///
/// A reentrant token (the owner already held the lock) does not release the
/// lock when unlocked; the first acquisition's token does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub key: String,
    pub owner: LockOwner,
    lock_id: u64,
    reentrant: bool,
}

impl LockToken {
    pub fn is_reentrant(&self) -> bool {
        self.reentrant
    }
}

struct LockEntry {
    owner: LockOwner,
    lock_id: u64,
    acquired_at: Instant,
    released: Arc<Notify>,
}

/// Per-key exclusive locks. Keys that are not locked have no entry.
pub struct LockManager {
    locks: DashMap<String, LockEntry>,
    next_lock_id: AtomicU64,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
            next_lock_id: AtomicU64::new(1),
        }
    }

    /// Acquires the lock on `key` for `owner`, waiting up to `timeout`.
    pub async fn try_lock(&self, key: &str, owner: &LockOwner, timeout: Duration) -> Result<LockToken> {
        let deadline = Instant::now() + timeout;

        loop {
            let released = match self.locks.entry(key.to_string()) {
                Entry::Vacant(vacant) => {
                    let lock_id = self.next_lock_id.fetch_add(1, Ordering::Relaxed);
                    vacant.insert(LockEntry {
                        owner: owner.clone(),
                        lock_id,
                        acquired_at: Instant::now(),
                        released: Arc::new(Notify::new()),
                    });
                    tracing::trace!("{} locked key {}", owner, key);
                    return Ok(LockToken {
                        key: key.to_string(),
                        owner: owner.clone(),
                        lock_id,
                        reentrant: false,
                    });
                }
                Entry::Occupied(occupied) => {
                    let held = occupied.get();
                    if &held.owner == owner {
                        return Ok(LockToken {
                            key: key.to_string(),
                            owner: owner.clone(),
                            lock_id: held.lock_id,
                            reentrant: true,
                        });
                    }
                    held.released.clone()
                }
            };

            let now = Instant::now();
            if now >= deadline {
                tracing::debug!("{} timed out waiting for key {}", owner, key);
                return Err(CacheError::LockTimeout {
                    key: key.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            let wait = (deadline - now).min(POLL_INTERVAL);
            let _ = tokio::time::timeout(wait, released.notified()).await;
        }
    }

    /// Releases the lock a token stands for. Releasing twice is a no-op.
    pub fn unlock(&self, token: &LockToken) {
        if token.reentrant {
            return;
        }
        let removed = self.locks.remove_if(&token.key, |_, held| {
            held.lock_id == token.lock_id && held.owner == token.owner
        });
        if let Some((key, held)) = removed {
            tracing::trace!(
                "{} released key {} after {:?}",
                held.owner,
                key,
                held.acquired_at.elapsed()
            );
            held.released.notify_waiters();
        }
    }

    pub fn unlock_all(&self, tokens: &[LockToken]) {
        for token in tokens {
            self.unlock(token);
        }
    }

    /// Releases `key` if `owner` holds it.
    pub fn unlock_key(&self, key: &str, owner: &LockOwner) -> bool {
        match self.locks.remove_if(key, |_, held| &held.owner == owner) {
            Some((_, held)) => {
                held.released.notify_waiters();
                true
            }
            None => false,
        }
    }

    /// Releases every lock held by `owner`. Returns the number released.
    pub fn release_owner(&self, owner: &LockOwner) -> usize {
        let keys: Vec<String> = self
            .locks
            .iter()
            .filter(|entry| &entry.value().owner == owner)
            .map(|entry| entry.key().clone())
            .collect();
        keys.iter().filter(|key| self.unlock_key(key, owner)).count()
    }

    pub fn is_locked(&self, key: &str) -> bool {
        self.locks.contains_key(key)
    }

    pub fn owner_of(&self, key: &str) -> Option<LockOwner> {
        self.locks.get(key).map(|held| held.owner.clone())
    }

    pub fn num_locks_held(&self) -> usize {
        self.locks.len()
    }

    pub fn locked_keys(&self) -> Vec<String> {
        self.locks.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Keys currently locked by a transaction.
    pub fn transaction_locked_keys(&self) -> Vec<String> {
        self.locks
            .iter()
            .filter(|entry| matches!(entry.value().owner, LockOwner::Transaction(_)))
            .map(|entry| entry.key().clone())
            .collect()
    }
}
