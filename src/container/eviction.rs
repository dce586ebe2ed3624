use crate::config::EvictionStrategy;

use lru::LruCache;
use parking_lot::Mutex;

/// Eviction order of the keys stored on one node.
///
/// FIFO keeps the order in which keys were first stored; LRU also moves a
/// key to the back whenever it is read or overwritten.
pub struct EvictionOrder {
    strategy: EvictionStrategy,
    max_entries: usize,
    order: Mutex<LruCache<String, ()>>,
}

impl EvictionOrder {
    pub fn new(strategy: EvictionStrategy, max_entries: usize) -> Self {
        Self {
            strategy,
            max_entries,
            order: Mutex::new(LruCache::unbounded()),
        }
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Records a stored key. Returns the keys to evict to stay within bounds,
    /// never `key` itself.
    pub fn record_write(&self, key: &str) -> Vec<String> {
        let mut order = self.order.lock();
        if !order.contains(key) {
            order.push(key.to_string(), ());
        } else if self.strategy == EvictionStrategy::Lru {
            order.promote(key);
        }

        let mut victims = Vec::new();
        while order.len() > self.max_entries {
            match order.peek_lru() {
                Some((oldest, _)) if oldest != key => {}
                _ => break,
            }
            if let Some((oldest, _)) = order.pop_lru() {
                victims.push(oldest);
            }
        }
        victims
    }

    pub fn record_read(&self, key: &str) {
        if self.strategy == EvictionStrategy::Lru {
            self.order.lock().promote(key);
        }
    }

    pub fn forget(&self, key: &str) {
        self.order.lock().pop(key);
    }

    pub fn clear(&self) {
        self.order.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.order.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
