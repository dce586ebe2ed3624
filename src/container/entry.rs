use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};

/// Version stamp assigned by a key's primary owner when it applies a write.
///
/// Ordered by topology first, so a write applied under a newer topology always
/// wins over a replay from an older one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntryVersion {
    pub topology_id: u64,
    pub counter: u64,
}

impl EntryVersion {
    pub fn new(topology_id: u64, counter: u64) -> Self {
        Self {
            topology_id,
            counter,
        }
    }
}

/// Per-node monotonic counter behind [`EntryVersion`].
#[derive(Debug, Default)]
pub struct VersionGenerator {
    counter: AtomicU64,
}

impl VersionGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self, topology_id: u64) -> EntryVersion {
        let counter = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        EntryVersion::new(topology_id, counter)
    }

    /// Keeps later local versions above `version`.
    pub fn observe(&self, version: EntryVersion) {
        self.counter.fetch_max(version.counter, Ordering::SeqCst);
    }

    /// A version strictly newer than `current`, which may have been assigned
    /// by another node. Advances the local counter past it.
    pub fn next_after(&self, topology_id: u64, current: Option<EntryVersion>) -> EntryVersion {
        let Some(current) = current else {
            return self.next(topology_id);
        };
        if current.topology_id > topology_id {
            self.counter.fetch_max(current.counter, Ordering::SeqCst);
            return self.next(current.topology_id);
        }
        if current.topology_id == topology_id {
            self.counter.fetch_max(current.counter, Ordering::SeqCst);
        }
        self.next(topology_id)
    }
}

/// Expiration settings. Negative values mean "not set".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub lifespan_ms: i64,
    pub max_idle_ms: i64,
}

impl Default for Metadata {
    fn default() -> Self {
        Self::immortal()
    }
}

impl Metadata {
    pub fn immortal() -> Self {
        Self {
            lifespan_ms: -1,
            max_idle_ms: -1,
        }
    }

    pub fn with_lifespan(lifespan_ms: i64) -> Self {
        Self {
            lifespan_ms,
            max_idle_ms: -1,
        }
    }

    pub fn with_max_idle(max_idle_ms: i64) -> Self {
        Self {
            lifespan_ms: -1,
            max_idle_ms,
        }
    }

    pub fn is_immortal(&self) -> bool {
        self.lifespan_ms < 0 && self.max_idle_ms < 0
    }

    /// Fills unset fields from the cache defaults.
    pub fn or_defaults(self, default_lifespan_ms: i64, default_max_idle_ms: i64) -> Self {
        Self {
            lifespan_ms: if self.lifespan_ms < 0 {
                default_lifespan_ms
            } else {
                self.lifespan_ms
            },
            max_idle_ms: if self.max_idle_ms < 0 {
                default_max_idle_ms
            } else {
                self.max_idle_ms
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InternalEntry {
    pub key: String,
    pub value: Value,
    pub version: Option<EntryVersion>,
    pub metadata: Metadata,
    pub created_at: u64,
    pub last_used: u64,
}

impl InternalEntry {
    pub fn new(
        key: String,
        value: Value,
        version: Option<EntryVersion>,
        metadata: Metadata,
        now: u64,
    ) -> Self {
        Self {
            key,
            value,
            version,
            metadata,
            created_at: now,
            last_used: now,
        }
    }

    pub fn is_expired(&self, now: u64) -> bool {
        if self.metadata.lifespan_ms >= 0
            && now >= self.created_at + self.metadata.lifespan_ms as u64
        {
            return true;
        }
        self.metadata.max_idle_ms >= 0 && now >= self.last_used + self.metadata.max_idle_ms as u64
    }
}
