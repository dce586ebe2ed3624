//! Cache configuration.
//!
//! A configuration is validated once, when the cache is defined. The mode enums are
//! resolved into a fixed pipeline of strategy objects when the cache starts, so the
//! hot path never re-inspects them.

use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_NUM_SEGMENTS: u32 = 256;
pub const DEFAULT_NUM_OWNERS: u32 = 2;

/// How a cache spreads its data over the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CacheMode {
    /// Data lives only on the local node.
    Local,
    /// Every member owns every segment.
    Replicated,
    /// Each segment is owned by `num_owners` members.
    #[default]
    Distributed,
}

impl CacheMode {
    pub fn is_clustered(&self) -> bool {
        !matches!(self, CacheMode::Local)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum LockingMode {
    /// Locks are taken at prepare time, in canonical key order.
    #[default]
    Optimistic,
    /// Locks are taken eagerly, on every write.
    Pessimistic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum IsolationLevel {
    ReadCommitted,
    #[default]
    RepeatableRead,
}

/// Which entry a full container drops to make room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EvictionStrategy {
    /// The container is unbounded.
    #[default]
    None,
    /// The entry stored first.
    Fifo,
    /// The entry read or written least recently.
    Lru,
}

/// Per-node bound on the number of stored entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EvictionConfig {
    pub strategy: EvictionStrategy,
    pub max_entries: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    pub enabled: bool,
    pub locking_mode: LockingMode,
    pub isolation: IsolationLevel,
    /// Abort at prepare when a key read by the transaction changed since the read.
    pub write_skew_check: bool,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            locking_mode: LockingMode::Optimistic,
            isolation: IsolationLevel::RepeatableRead,
            write_skew_check: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub mode: CacheMode,
    pub num_segments: u32,
    pub num_owners: u32,
    pub lock_timeout_ms: u64,
    pub remote_timeout_ms: u64,
    /// Upper bound on waiting for a topology or a state transfer step.
    pub state_transfer_timeout_ms: u64,
    /// How many times an operation is retried after an outdated topology.
    pub max_topology_retries: u32,
    pub transaction: TransactionConfig,
    pub eviction: EvictionConfig,
    pub default_lifespan_ms: i64,
    pub default_max_idle_ms: i64,
    pub expiration_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            mode: CacheMode::Distributed,
            num_segments: DEFAULT_NUM_SEGMENTS,
            num_owners: DEFAULT_NUM_OWNERS,
            lock_timeout_ms: 10_000,
            remote_timeout_ms: 15_000,
            state_transfer_timeout_ms: 30_000,
            max_topology_retries: 8,
            transaction: TransactionConfig::default(),
            eviction: EvictionConfig::default(),
            default_lifespan_ms: -1,
            default_max_idle_ms: -1,
            expiration_interval_ms: 1_000,
        }
    }
}

impl CacheConfig {
    pub fn local() -> Self {
        Self {
            mode: CacheMode::Local,
            num_owners: 1,
            ..Self::default()
        }
    }

    pub fn distributed(num_owners: u32) -> Self {
        Self {
            mode: CacheMode::Distributed,
            num_owners,
            ..Self::default()
        }
    }

    pub fn replicated() -> Self {
        Self {
            mode: CacheMode::Replicated,
            ..Self::default()
        }
    }

    pub fn with_segments(mut self, num_segments: u32) -> Self {
        self.num_segments = num_segments;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn transactional(mut self, locking_mode: LockingMode, isolation: IsolationLevel) -> Self {
        self.transaction.enabled = true;
        self.transaction.locking_mode = locking_mode;
        self.transaction.isolation = isolation;
        self
    }

    pub fn with_write_skew_check(mut self, enabled: bool) -> Self {
        self.transaction.write_skew_check = enabled;
        self
    }

    pub fn with_eviction(mut self, strategy: EvictionStrategy, max_entries: u64) -> Self {
        self.eviction = EvictionConfig {
            strategy,
            max_entries,
        };
        self
    }

    pub fn with_default_lifespan(mut self, lifespan: Duration) -> Self {
        self.default_lifespan_ms = lifespan.as_millis() as i64;
        self
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    pub fn state_transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.state_transfer_timeout_ms)
    }

    pub fn is_transactional(&self) -> bool {
        self.transaction.enabled
    }

    /// Number of owners a segment gets in a cluster of `members` nodes.
    pub fn owners_for(&self, members: usize) -> usize {
        let wanted = match self.mode {
            CacheMode::Local => 1,
            CacheMode::Replicated => members,
            CacheMode::Distributed => self.num_owners as usize,
        };
        wanted.min(members).max(1)
    }

    /// Rejects structurally invalid definitions before any data operation runs.
    pub fn validate(&self) -> Result<()> {
        if self.num_segments == 0 {
            return Err(CacheError::Configuration(
                "num_segments must be greater than 0".into(),
            ));
        }
        if self.mode == CacheMode::Distributed && self.num_owners == 0 {
            return Err(CacheError::Configuration(
                "num_owners must be greater than 0 in distributed mode".into(),
            ));
        }
        if self.mode.is_clustered() && self.remote_timeout_ms == 0 {
            return Err(CacheError::Configuration(
                "remote_timeout_ms must be greater than 0 in a clustered cache".into(),
            ));
        }
        if self.max_topology_retries == 0 && self.mode.is_clustered() {
            return Err(CacheError::Configuration(
                "max_topology_retries must be at least 1 in a clustered cache".into(),
            ));
        }
        match (self.eviction.strategy, self.eviction.max_entries) {
            (EvictionStrategy::None, 0) => {}
            (EvictionStrategy::None, _) => {
                return Err(CacheError::Configuration(
                    "max_entries requires an eviction strategy".into(),
                ));
            }
            (_, 0) => {
                return Err(CacheError::Configuration(
                    "an eviction strategy requires max_entries greater than 0".into(),
                ));
            }
            _ => {}
        }
        let tx = &self.transaction;
        if tx.write_skew_check {
            if !tx.enabled {
                return Err(CacheError::Configuration(
                    "write skew check requires a transactional cache".into(),
                ));
            }
            if tx.isolation != IsolationLevel::RepeatableRead {
                return Err(CacheError::Configuration(
                    "write skew check requires REPEATABLE_READ isolation".into(),
                ));
            }
            if tx.locking_mode != LockingMode::Optimistic {
                return Err(CacheError::Configuration(
                    "write skew check requires OPTIMISTIC locking".into(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(CacheConfig::default().validate().is_ok());
        assert!(CacheConfig::local().validate().is_ok());
        assert!(CacheConfig::replicated().validate().is_ok());
    }

    #[test]
    fn test_zero_segments_rejected() {
        let config = CacheConfig::distributed(2).with_segments(0);
        assert!(matches!(
            config.validate(),
            Err(CacheError::Configuration(_))
        ));
    }

    #[test]
    fn test_zero_owners_rejected_in_distributed_mode() {
        assert!(CacheConfig::distributed(0).validate().is_err());
    }

    #[test]
    fn test_write_skew_requires_optimistic_repeatable_read() {
        let non_tx = CacheConfig::distributed(2).with_write_skew_check(true);
        assert!(non_tx.validate().is_err());

        let pessimistic = CacheConfig::distributed(2)
            .transactional(LockingMode::Pessimistic, IsolationLevel::RepeatableRead)
            .with_write_skew_check(true);
        assert!(pessimistic.validate().is_err());

        let read_committed = CacheConfig::distributed(2)
            .transactional(LockingMode::Optimistic, IsolationLevel::ReadCommitted)
            .with_write_skew_check(true);
        assert!(read_committed.validate().is_err());

        let ok = CacheConfig::distributed(2)
            .transactional(LockingMode::Optimistic, IsolationLevel::RepeatableRead)
            .with_write_skew_check(true);
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_eviction_needs_strategy_and_bound() {
        let bounded = CacheConfig::local().with_eviction(EvictionStrategy::Lru, 100);
        assert!(bounded.validate().is_ok());

        let no_bound = CacheConfig::local().with_eviction(EvictionStrategy::Fifo, 0);
        assert!(matches!(no_bound.validate(), Err(CacheError::Configuration(_))));

        let no_strategy = CacheConfig::local().with_eviction(EvictionStrategy::None, 100);
        assert!(matches!(no_strategy.validate(), Err(CacheError::Configuration(_))));
    }

    #[test]
    fn test_owners_for_is_capped_by_members() {
        assert_eq!(CacheConfig::distributed(2).owners_for(1), 1);
        assert_eq!(CacheConfig::distributed(2).owners_for(5), 2);
        assert_eq!(CacheConfig::replicated().owners_for(4), 4);
        assert_eq!(CacheConfig::local().owners_for(3), 1);
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: CacheConfig =
            serde_json::from_str(r#"{"mode":"Replicated","lock_timeout_ms":500}"#).unwrap();
        assert_eq!(config.mode, CacheMode::Replicated);
        assert_eq!(config.lock_timeout_ms, 500);
        assert_eq!(config.num_segments, DEFAULT_NUM_SEGMENTS);
        assert!(!config.transaction.enabled);
        assert_eq!(config.eviction.strategy, EvictionStrategy::None);

        let bounded: CacheConfig =
            serde_json::from_str(r#"{"eviction":{"strategy":"Lru","max_entries":10}}"#).unwrap();
        assert_eq!(bounded.eviction.max_entries, 10);
        assert!(bounded.validate().is_ok());
    }
}
