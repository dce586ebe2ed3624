use super::entry::{EntryVersion, InternalEntry};
use super::eviction::EvictionOrder;
use crate::config::{EvictionConfig, EvictionStrategy};
use crate::distribution::hash::segment_of;
use crate::time::TimeService;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-node entry storage, partitioned by segment.
///
/// Each segment gets its own map so that state transfer can hand over, read
/// and drop whole segments without scanning the rest of the node's data.
///
/// A bounded container evicts one entry for every new key stored beyond
/// `max_entries`. Eviction is local: other owners keep their copies.
pub struct DataContainer {
    segments: Vec<DashMap<String, InternalEntry>>,
    time: Arc<dyn TimeService>,
    eviction: Option<EvictionOrder>,
    evictions: AtomicU64,
}

impl DataContainer {
    pub fn new(num_segments: u32, time: Arc<dyn TimeService>) -> Self {
        let segments = (0..num_segments.max(1)).map(|_| DashMap::new()).collect();
        Self {
            segments,
            time,
            eviction: None,
            evictions: AtomicU64::new(0),
        }
    }

    pub fn with_eviction(mut self, config: &EvictionConfig) -> Self {
        self.eviction = match config.strategy {
            EvictionStrategy::None => None,
            strategy => Some(EvictionOrder::new(strategy, config.max_entries as usize)),
        };
        self
    }

    /// Entries dropped to stay within `max_entries`.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    fn stored(&self, key: &str) {
        let Some(order) = &self.eviction else {
            return;
        };
        for victim in order.record_write(key) {
            if self.segment_map(&victim).remove(&victim).is_some() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::trace!("Evicted {}", victim);
            }
        }
    }

    fn forget(&self, key: &str) {
        if let Some(order) = &self.eviction {
            order.forget(key);
        }
    }

    pub fn num_segments(&self) -> u32 {
        self.segments.len() as u32
    }

    pub fn segment_of(&self, key: &str) -> u32 {
        segment_of(key, self.num_segments())
    }

    fn segment_map(&self, key: &str) -> &DashMap<String, InternalEntry> {
        &self.segments[self.segment_of(key) as usize]
    }

    pub fn now(&self) -> u64 {
        self.time.wall_clock_ms()
    }

    /// Reads an entry and refreshes its idle timer. Expired entries are dropped.
    pub fn get(&self, key: &str) -> Option<InternalEntry> {
        let map = self.segment_map(key);
        let now = self.now();
        let expired = match map.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => {
                entry.last_used = now;
                let found = entry.value().clone();
                drop(entry);
                if let Some(order) = &self.eviction {
                    order.record_read(key);
                }
                return Some(found);
            }
            Some(_) => true,
            None => false,
        };
        if expired && map.remove_if(key, |_, entry| entry.is_expired(now)).is_some() {
            self.forget(key);
        }
        None
    }

    /// Reads an entry without touching it.
    pub fn peek(&self, key: &str) -> Option<InternalEntry> {
        let now = self.now();
        self.segment_map(key)
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value().clone())
    }

    /// Version of the stored entry, expired or not.
    pub fn stored_version(&self, key: &str) -> Option<EntryVersion> {
        self.segment_map(key).get(key).and_then(|entry| entry.version)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.peek(key).is_some()
    }

    pub fn put(&self, entry: InternalEntry) -> Option<InternalEntry> {
        let now = self.now();
        let key = entry.key.clone();
        let previous = self.segment_map(&key).insert(key.clone(), entry);
        self.stored(&key);
        previous.filter(|previous| !previous.is_expired(now))
    }

    /// Stores `entry` unless the container already holds a newer version of it.
    pub fn put_if_newer(&self, entry: InternalEntry) -> bool {
        let key = entry.key.clone();
        let map = self.segment_map(&key);
        match map.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().version > entry.version {
                    return false;
                }
                occupied.insert(entry);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
            }
        }
        self.stored(&key);
        true
    }

    pub fn remove(&self, key: &str) -> Option<InternalEntry> {
        let now = self.now();
        let removed = self.segment_map(key).remove(key).map(|(_, entry)| entry);
        if removed.is_some() {
            self.forget(key);
        }
        removed.filter(|entry| !entry.is_expired(now))
    }

    /// Removes the entry unless it carries a version newer than `version`.
    pub fn remove_if_not_newer(&self, key: &str, version: Option<EntryVersion>) -> bool {
        let removed = self
            .segment_map(key)
            .remove_if(key, |_, entry| entry.version <= version)
            .is_some();
        if removed {
            self.forget(key);
        }
        removed
    }

    pub fn clear(&self) {
        for segment in &self.segments {
            segment.clear();
        }
        if let Some(order) = &self.eviction {
            order.clear();
        }
    }

    /// Number of live entries.
    pub fn size(&self) -> usize {
        let now = self.now();
        self.segments
            .iter()
            .map(|segment| segment.iter().filter(|e| !e.is_expired(now)).count())
            .sum()
    }

    pub fn segment_size(&self, segment: u32) -> usize {
        let now = self.now();
        self.segments
            .get(segment as usize)
            .map(|map| map.iter().filter(|e| !e.is_expired(now)).count())
            .unwrap_or(0)
    }

    pub fn segment_entries(&self, segment: u32) -> Vec<InternalEntry> {
        let now = self.now();
        match self.segments.get(segment as usize) {
            Some(map) => map
                .iter()
                .filter(|entry| !entry.is_expired(now))
                .map(|entry| entry.value().clone())
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn entries_for_segments(&self, segments: &[u32]) -> Vec<InternalEntry> {
        segments
            .iter()
            .flat_map(|segment| self.segment_entries(*segment))
            .collect()
    }

    pub fn entries(&self) -> Vec<InternalEntry> {
        let all: Vec<u32> = (0..self.num_segments()).collect();
        self.entries_for_segments(&all)
    }

    /// Drops every entry of the given segments. Returns how many were removed.
    pub fn remove_segments(&self, segments: &[u32]) -> usize {
        let mut removed = 0;
        for segment in segments {
            if let Some(map) = self.segments.get(*segment as usize) {
                if self.eviction.is_some() {
                    let keys: Vec<String> = map.iter().map(|entry| entry.key().clone()).collect();
                    for key in keys {
                        if map.remove(&key).is_some() {
                            self.forget(&key);
                            removed += 1;
                        }
                    }
                } else {
                    removed += map.len();
                    map.clear();
                }
            }
        }
        removed
    }

    pub fn purge_expired(&self) -> usize {
        let now = self.now();
        let mut purged = 0;
        for segment in &self.segments {
            let mut expired = Vec::new();
            segment.retain(|key, entry| {
                let keep = !entry.is_expired(now);
                if !keep {
                    expired.push(key.clone());
                }
                keep
            });
            purged += expired.len();
            for key in expired {
                self.forget(&key);
            }
        }
        purged
    }
}
