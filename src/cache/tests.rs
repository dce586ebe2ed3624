//! Cache Module Tests
//!
//! Single-node behaviour of the manager and the typed API: lifecycle,
//! conditional writes, expiration and both transaction locking modes. Clustered
//! scenarios live in `tests/cluster_scenarios.rs`.

#[cfg(test)]
mod tests {
    use crate::cache::{Cache, CacheManager};
    use crate::config::{CacheConfig, EvictionStrategy, IsolationLevel, LockingMode};
    use crate::container::Metadata;
    use crate::error::CacheError;
    use crate::time::ControlledTimeService;
    use crate::transaction::TxState;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    async fn manager_with(name: &str, config: CacheConfig) -> CacheManager {
        let manager = CacheManager::local();
        manager.define_configuration(name, config).unwrap();
        manager.init().await.unwrap();
        manager
    }

    async fn local_cache() -> (CacheManager, Cache<String, i64>) {
        let manager = manager_with("numbers", CacheConfig::local()).await;
        let cache = manager.cache("numbers").unwrap();
        (manager, cache)
    }

    async fn tx_cache(mode: LockingMode, isolation: IsolationLevel) -> (CacheManager, Cache<String, i64>) {
        let skew_check = mode == LockingMode::Optimistic && isolation == IsolationLevel::RepeatableRead;
        let config = CacheConfig::local()
            .transactional(mode, isolation)
            .with_write_skew_check(skew_check)
            .with_lock_timeout(Duration::from_millis(200));
        let manager = manager_with("accounts", config).await;
        let cache = manager.cache("accounts").unwrap();
        (manager, cache)
    }

    fn k(key: &str) -> String {
        key.to_string()
    }

    // ============================================================
    // TEST 1: Manager lifecycle and definitions
    // ============================================================

    #[tokio::test]
    async fn test_duplicate_definition_is_rejected() {
        let manager = CacheManager::local();
        manager.define_configuration("users", CacheConfig::local()).unwrap();

        let err = manager
            .define_configuration("users", CacheConfig::local())
            .unwrap_err();
        assert!(matches!(err, CacheError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_clustered_cache_needs_a_transport() {
        let manager = CacheManager::local();
        let err = manager
            .define_configuration("dist", CacheConfig::distributed(2))
            .unwrap_err();
        assert!(matches!(err, CacheError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_alias_resolves_to_the_same_cache() {
        let manager = CacheManager::local();
        manager.define_configuration("users", CacheConfig::local()).unwrap();
        manager.define_alias("people", "users").unwrap();
        manager.init().await.unwrap();

        let users: Cache<String, String> = manager.cache("users").unwrap();
        let people: Cache<String, String> = manager.cache("people").unwrap();
        users.put(&k("ana"), &"admin".to_string()).await.unwrap();

        assert_eq!(people.get(&k("ana")).await.unwrap(), Some("admin".to_string()));
        assert_eq!(people.id(), users.id());
        assert!(manager.define_alias("people", "users").is_err());
        assert!(manager.define_alias("users", "users").is_err());
        assert!(matches!(
            manager.define_alias("ghosts", "missing"),
            Err(CacheError::CacheNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_cache_is_not_found() {
        let manager = CacheManager::local();
        manager.init().await.unwrap();
        assert!(matches!(
            manager.cache::<String, i64>("missing"),
            Err(CacheError::CacheNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_operations_fail_before_init_and_after_shutdown() {
        let manager = CacheManager::local();
        manager.define_configuration("numbers", CacheConfig::local()).unwrap();
        let cache: Cache<String, i64> = manager.cache("numbers").unwrap();
        assert!(matches!(cache.get(&k("a")).await, Err(CacheError::NotRunning(_))));

        manager.init().await.unwrap();
        cache.put(&k("a"), &1).await.unwrap();

        manager.shutdown().await;
        assert!(!manager.is_running());
        assert!(matches!(cache.put(&k("a"), &2).await, Err(CacheError::NotRunning(_))));
        assert!(manager.define_configuration("late", CacheConfig::local()).is_err());
        assert!(manager.init().await.is_err());
    }

    #[tokio::test]
    async fn test_cache_defined_after_init_starts_immediately() {
        let manager = CacheManager::local();
        manager.init().await.unwrap();
        manager.define_configuration("late", CacheConfig::local()).unwrap();

        let cache: Cache<String, i64> = manager.cache("late").unwrap();
        cache.put(&k("a"), &1).await.unwrap();
        assert_eq!(cache.get(&k("a")).await.unwrap(), Some(1));
        assert_eq!(manager.cache_names(), vec!["late".to_string()]);
    }

    // ============================================================
    // TEST 2: Map operations
    // ============================================================

    #[tokio::test]
    async fn test_put_get_remove() {
        let (_manager, cache) = local_cache().await;

        assert_eq!(cache.put(&k("a"), &1).await.unwrap(), None);
        assert_eq!(cache.put(&k("a"), &2).await.unwrap(), Some(1));
        assert_eq!(cache.get(&k("a")).await.unwrap(), Some(2));
        assert!(cache.contains_key(&k("a")).await.unwrap());

        assert_eq!(cache.remove(&k("a")).await.unwrap(), Some(2));
        assert_eq!(cache.get(&k("a")).await.unwrap(), None);
        assert_eq!(cache.remove(&k("a")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_conditional_writes() {
        let (_manager, cache) = local_cache().await;

        assert_eq!(cache.put_if_absent(&k("a"), &1).await.unwrap(), None);
        assert_eq!(cache.put_if_absent(&k("a"), &2).await.unwrap(), Some(1));

        assert_eq!(cache.replace(&k("missing"), &5).await.unwrap(), None);
        assert!(!cache.contains_key(&k("missing")).await.unwrap());
        assert_eq!(cache.replace(&k("a"), &3).await.unwrap(), Some(1));

        assert!(!cache.replace_if_equals(&k("a"), &1, &4).await.unwrap());
        assert!(cache.replace_if_equals(&k("a"), &3, &4).await.unwrap());

        assert!(!cache.remove_if_equals(&k("a"), &3).await.unwrap());
        assert!(cache.remove_if_equals(&k("a"), &4).await.unwrap());
        assert_eq!(cache.get(&k("a")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_bulk_views_and_clear() {
        let (_manager, cache) = local_cache().await;
        for (i, key) in ["c", "a", "b"].iter().enumerate() {
            cache.put(&k(key), &(i as i64)).await.unwrap();
        }

        assert_eq!(cache.size().await.unwrap(), 3);
        assert_eq!(cache.keys().await.unwrap(), vec![k("a"), k("b"), k("c")]);
        assert_eq!(cache.values().await.unwrap(), vec![1, 2, 0]);
        assert_eq!(cache.entries().await.unwrap()[0], (k("a"), 1));

        cache.clear().await.unwrap();
        assert_eq!(cache.size().await.unwrap(), 0);
        assert_eq!(cache.local_size(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_replace_has_exactly_one_winner() {
        let (_manager, cache) = local_cache().await;
        cache.put(&k("counter"), &0).await.unwrap();

        let mut handles = Vec::new();
        for i in 1..=8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache.replace_if_equals(&k("counter"), &0, &i).await.unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_ne!(cache.get(&k("counter")).await.unwrap(), Some(0));
        assert_eq!(cache.lock_count(), 0);
    }

    #[tokio::test]
    async fn test_stats_count_hits_and_writes() {
        let (_manager, cache) = local_cache().await;
        cache.put(&k("a"), &1).await.unwrap();
        cache.put_if_absent(&k("a"), &2).await.unwrap();
        cache.get(&k("a")).await.unwrap();
        cache.get(&k("b")).await.unwrap();
        cache.remove(&k("a")).await.unwrap();

        let stats = cache.stats();
        assert_eq!(stats.stores, 1);
        assert_eq!(stats.removes, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.local_entries, 0);
    }

    #[tokio::test]
    async fn test_bounded_cache_evicts_least_recently_used() {
        let config = CacheConfig::local().with_eviction(EvictionStrategy::Lru, 2);
        let manager = manager_with("bounded", config).await;
        let cache: Cache<String, i64> = manager.cache("bounded").unwrap();

        cache.put(&k("a"), &1).await.unwrap();
        cache.put(&k("b"), &2).await.unwrap();
        assert_eq!(cache.get(&k("a")).await.unwrap(), Some(1));
        cache.put(&k("c"), &3).await.unwrap();

        assert_eq!(cache.keys().await.unwrap(), vec![k("a"), k("c")]);
        assert_eq!(cache.stats().evictions, 1);
    }

    // ============================================================
    // TEST 3: Expiration
    // ============================================================

    #[tokio::test]
    async fn test_entries_expire_with_controlled_time() {
        let time = Arc::new(ControlledTimeService::new());
        let manager = CacheManager::builder().time_service(time.clone()).build().unwrap();
        manager
            .define_configuration(
                "sessions",
                CacheConfig::local().with_default_lifespan(Duration::from_secs(10)),
            )
            .unwrap();
        manager.init().await.unwrap();
        let cache: Cache<String, i64> = manager.cache("sessions").unwrap();

        cache.put(&k("default"), &1).await.unwrap();
        cache
            .put_with_metadata(&k("short"), &2, Metadata::with_lifespan(1_000))
            .await
            .unwrap();
        cache
            .put_with_metadata(&k("idle"), &3, Metadata::with_max_idle(2_000))
            .await
            .unwrap();

        time.advance(Duration::from_millis(1_500));
        assert_eq!(cache.get(&k("short")).await.unwrap(), None);
        assert_eq!(cache.get(&k("idle")).await.unwrap(), Some(3));

        time.advance(Duration::from_millis(1_500));
        assert_eq!(cache.get(&k("idle")).await.unwrap(), Some(3));
        assert_eq!(cache.get(&k("default")).await.unwrap(), Some(1));

        time.advance(Duration::from_secs(10));
        assert_eq!(cache.get(&k("default")).await.unwrap(), None);
        assert_eq!(cache.get(&k("idle")).await.unwrap(), None);
    }

    // ============================================================
    // TEST 4: Transactions
    // ============================================================

    #[tokio::test]
    async fn test_begin_on_non_transactional_cache_fails() {
        let (_manager, cache) = local_cache().await;
        assert!(matches!(cache.begin(), Err(CacheError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_commit_applies_every_write_and_releases_locks() {
        let (_manager, cache) = tx_cache(LockingMode::Optimistic, IsolationLevel::RepeatableRead).await;
        cache.put(&k("x"), &1).await.unwrap();

        let tx = cache.begin().unwrap();
        tx.put(&k("x"), &10).await.unwrap();
        tx.put(&k("y"), &20).await.unwrap();
        assert_eq!(tx.get(&k("x")).await.unwrap(), Some(10));
        assert_eq!(cache.get(&k("x")).await.unwrap(), Some(1));
        assert_eq!(tx.size().await.unwrap(), 2);

        tx.commit().await.unwrap();
        assert_eq!(tx.state().await, TxState::Committed);
        assert_eq!(cache.get(&k("x")).await.unwrap(), Some(10));
        assert_eq!(cache.get(&k("y")).await.unwrap(), Some(20));
        assert_eq!(cache.lock_count(), 0);
        assert_eq!(cache.remote_transaction_count(), 0);
        assert!(cache.stats().commits >= 1);
    }

    #[tokio::test]
    async fn test_rollback_discards_writes() {
        let (_manager, cache) = tx_cache(LockingMode::Optimistic, IsolationLevel::RepeatableRead).await;
        cache.put(&k("x"), &1).await.unwrap();

        let tx = cache.begin().unwrap();
        tx.put(&k("x"), &2).await.unwrap();
        tx.remove(&k("x")).await.unwrap();
        tx.rollback().await.unwrap();
        tx.rollback().await.unwrap();

        assert_eq!(cache.get(&k("x")).await.unwrap(), Some(1));
        assert_eq!(cache.lock_count(), 0);
        assert!(matches!(
            tx.put(&k("x"), &3).await,
            Err(CacheError::IllegalTransactionState(_))
        ));
        assert!(tx.commit().await.is_err());
    }

    #[tokio::test]
    async fn test_optimistic_write_skew_is_detected() {
        let (_manager, cache) = tx_cache(LockingMode::Optimistic, IsolationLevel::RepeatableRead).await;
        cache.put(&k("balance"), &100).await.unwrap();

        let tx = cache.begin().unwrap();
        let seen = tx.get(&k("balance")).await.unwrap().unwrap();
        cache.put(&k("balance"), &50).await.unwrap();
        tx.put(&k("balance"), &(seen - 10)).await.unwrap();

        let err = tx.commit().await.unwrap_err();
        assert!(matches!(err, CacheError::WriteSkew { .. }));
        assert_eq!(tx.state().await, TxState::RolledBack);
        assert_eq!(cache.get(&k("balance")).await.unwrap(), Some(50));
        assert_eq!(cache.lock_count(), 0);
    }

    #[tokio::test]
    async fn test_blind_write_does_not_conflict() {
        let (_manager, cache) = tx_cache(LockingMode::Optimistic, IsolationLevel::RepeatableRead).await;
        cache.put(&k("a"), &1).await.unwrap();

        let tx = cache.begin().unwrap();
        tx.put(&k("a"), &3).await.unwrap();
        cache.put(&k("a"), &2).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(cache.get(&k("a")).await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_repeatable_read_keeps_first_value() {
        let (_manager, cache) = tx_cache(LockingMode::Optimistic, IsolationLevel::RepeatableRead).await;
        cache.put(&k("a"), &1).await.unwrap();

        let tx = cache.begin().unwrap();
        assert_eq!(tx.get(&k("a")).await.unwrap(), Some(1));
        cache.put(&k("a"), &2).await.unwrap();
        assert_eq!(tx.get(&k("a")).await.unwrap(), Some(1));
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_committed_sees_new_commits() {
        let (_manager, cache) = tx_cache(LockingMode::Optimistic, IsolationLevel::ReadCommitted).await;
        cache.put(&k("a"), &1).await.unwrap();

        let tx = cache.begin().unwrap();
        assert_eq!(tx.get(&k("a")).await.unwrap(), Some(1));
        cache.put(&k("a"), &2).await.unwrap();
        assert_eq!(tx.get(&k("a")).await.unwrap(), Some(2));
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_pessimistic_lock_is_held_until_commit() {
        let (_manager, cache) = tx_cache(LockingMode::Pessimistic, IsolationLevel::RepeatableRead).await;
        cache.put(&k("a"), &1).await.unwrap();

        let tx = cache.begin().unwrap();
        tx.put(&k("a"), &2).await.unwrap();
        assert!(cache.is_locked(&k("a")));
        assert_eq!(cache.remote_transaction_count(), 1);

        let err = cache.put(&k("a"), &3).await.unwrap_err();
        assert!(matches!(err, CacheError::LockTimeout { .. }));

        tx.commit().await.unwrap();
        assert!(!cache.is_locked(&k("a")));
        assert_eq!(cache.get(&k("a")).await.unwrap(), Some(2));
        cache.put(&k("a"), &3).await.unwrap();
    }

    #[tokio::test]
    async fn test_pessimistic_rollback_releases_locks() {
        let (_manager, cache) = tx_cache(LockingMode::Pessimistic, IsolationLevel::RepeatableRead).await;

        let tx = cache.begin().unwrap();
        tx.put(&k("a"), &1).await.unwrap();
        tx.put(&k("b"), &2).await.unwrap();
        assert_eq!(cache.lock_count(), 2);

        tx.rollback().await.unwrap();
        assert_eq!(cache.lock_count(), 0);
        assert_eq!(cache.get(&k("a")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_in_transaction_retries_after_write_skew() {
        let (_manager, cache) = tx_cache(LockingMode::Optimistic, IsolationLevel::RepeatableRead).await;
        cache.put(&k("counter"), &0).await.unwrap();
        let attempts = Arc::new(AtomicU32::new(0));

        let result = cache
            .in_transaction(3, |tx| {
                let cache = cache.clone();
                let attempts = attempts.clone();
                async move {
                    let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                    let current = tx.get(&k("counter")).await?.unwrap_or(0);
                    if attempt == 0 {
                        cache.put(&k("counter"), &100).await?;
                    }
                    tx.put(&k("counter"), &(current + 1)).await?;
                    Ok(current + 1)
                }
            })
            .await
            .unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(result, 101);
        assert_eq!(cache.get(&k("counter")).await.unwrap(), Some(101));
    }

    #[tokio::test]
    async fn test_in_transaction_rolls_back_on_error() {
        let (_manager, cache) = tx_cache(LockingMode::Pessimistic, IsolationLevel::RepeatableRead).await;

        let result: crate::error::Result<()> = cache
            .in_transaction(3, |tx| async move {
                tx.put(&k("a"), &1).await?;
                Err(CacheError::Internal("abort".into()))
            })
            .await;

        assert!(matches!(result, Err(CacheError::Internal(_))));
        assert_eq!(cache.get(&k("a")).await.unwrap(), None);
        assert_eq!(cache.lock_count(), 0);
    }
}
