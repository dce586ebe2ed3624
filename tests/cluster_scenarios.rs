//! Cluster Scenarios
//!
//! Multi-node behaviour over the in-process network: routing to owners,
//! replication, transactions across primaries, node failures and rebalancing.

mod common;

use common::{TestCluster, test_config};
use distributed_cache::{Cache, CacheConfig, CacheError, IsolationLevel, LockingMode, NodeId};
use std::collections::HashSet;
use std::time::Duration;

fn k(key: &str) -> String {
    key.to_string()
}

fn s(value: &str) -> String {
    value.to_string()
}

/// First `key-N` whose primary owner is `primary`.
fn key_with_primary(cache: &Cache<String, String>, primary: &NodeId, skip: &HashSet<String>) -> String {
    (0..10_000)
        .map(|i| format!("key-{}", i))
        .find(|key| !skip.contains(key) && cache.locate_owners(key).unwrap().first() == Some(primary))
        .unwrap()
}

fn assert_owners_agree(cluster: &TestCluster, name: &str, key: &str, expected: Option<&str>) {
    let any = cluster.cache::<String, String>(0, name);
    for owner in any.locate_owners(&k(key)).unwrap() {
        let node = cluster.index_of(&owner);
        let local = cluster.cache::<String, String>(node, name).peek_local(&k(key)).unwrap();
        assert_eq!(local.as_deref(), expected, "owner {} disagrees on {}", owner, key);
    }
}

// =============================================================================
// Distribution and replication
// =============================================================================

mod distribution_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_put_fails_when_a_backup_is_unreachable() {
        let mut cluster = TestCluster::start(3, &[("dist", test_config(CacheConfig::distributed(2)))]).await;
        let a = cluster.cache::<String, String>(0, "dist");
        let node_a = cluster.nodes[0].id.clone();
        let node_c = cluster.nodes[2].id.clone();
        let key = (0..10_000)
            .map(|i| format!("key-{}", i))
            .find(|key| a.locate_owners(key).unwrap() == vec![node_a.clone(), node_c.clone()])
            .unwrap();

        cluster.crash_silently(2);
        let err = a.put(&key, &s("v")).await.unwrap_err();
        assert!(
            matches!(&err, CacheError::RemoteCommunication { node, .. } if node == &node_c.0),
            "unexpected error {:?}",
            err
        );
        assert_eq!(cluster.total_locks("dist"), 0);

        cluster.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_put_on_one_node_is_visible_on_all() {
        let cluster = TestCluster::start(3, &[("dist", test_config(CacheConfig::distributed(2)))]).await;
        let a = cluster.cache::<String, String>(0, "dist");
        let b = cluster.cache::<String, String>(1, "dist");
        let c = cluster.cache::<String, String>(2, "dist");

        a.put(&k("k"), &s("v1")).await.unwrap();

        assert_eq!(b.get(&k("k")).await.unwrap(), Some(s("v1")));
        assert_eq!(c.get(&k("k")).await.unwrap(), Some(s("v1")));
        assert_eq!(a.locate_owners(&k("k")).unwrap().len(), 2);
        assert_owners_agree(&cluster, "dist", "k", Some("v1"));

        cluster.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_every_owner_holds_the_latest_value() {
        let cluster = TestCluster::start(3, &[("dist", test_config(CacheConfig::distributed(2)))]).await;

        for i in 0..60 {
            let writer = cluster.cache::<String, String>(i % 3, "dist");
            writer.put(&format!("key-{}", i), &format!("v{}", i)).await.unwrap();
        }
        for i in 0..60 {
            let overwriter = cluster.cache::<String, String>((i + 1) % 3, "dist");
            overwriter.put(&format!("key-{}", i), &format!("w{}", i)).await.unwrap();
        }

        for i in 0..60 {
            assert_owners_agree(&cluster, "dist", &format!("key-{}", i), Some(format!("w{}", i).as_str()));
        }
        let stored: usize = (0..3)
            .map(|node| cluster.cache::<String, String>(node, "dist").local_size())
            .sum();
        assert_eq!(stored, 120);

        cluster.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_replicated_cache_stores_everywhere() {
        let cluster = TestCluster::start(3, &[("repl", test_config(CacheConfig::replicated()))]).await;
        let b = cluster.cache::<String, String>(1, "repl");

        b.put(&k("shared"), &s("x")).await.unwrap();

        for node in 0..3 {
            let cache = cluster.cache::<String, String>(node, "repl");
            assert_eq!(cache.peek_local(&k("shared")).unwrap(), Some(s("x")));
        }

        cluster.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_replace_has_one_winner() {
        let cluster = TestCluster::start(3, &[("dist", test_config(CacheConfig::distributed(2)))]).await;
        cluster
            .cache::<String, String>(0, "dist")
            .put(&k("race"), &s("start"))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..9 {
            let cache = cluster.cache::<String, String>(i % 3, "dist");
            handles.push(tokio::spawn(async move {
                let value = format!("winner-{}", i);
                let won = cache.replace_if_equals(&k("race"), &s("start"), &value).await.unwrap();
                (won, value)
            }));
        }

        let mut winners = Vec::new();
        for handle in handles {
            let (won, value) = handle.await.unwrap();
            if won {
                winners.push(value);
            }
        }
        assert_eq!(winners.len(), 1);

        let stored = cluster.cache::<String, String>(2, "dist").get(&k("race")).await.unwrap();
        assert_eq!(stored.as_deref(), Some(winners[0].as_str()));
        assert_owners_agree(&cluster, "dist", "race", Some(winners[0].as_str()));
        assert_eq!(cluster.total_locks("dist"), 0);

        cluster.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_clear_empties_every_node() {
        let cluster = TestCluster::start(3, &[("dist", test_config(CacheConfig::distributed(2)))]).await;
        for i in 0..40 {
            cluster
                .cache::<String, String>(i % 3, "dist")
                .put(&format!("key-{}", i), &s("v"))
                .await
                .unwrap();
        }
        assert_eq!(cluster.cache::<String, String>(0, "dist").size().await.unwrap(), 40);

        cluster.cache::<String, String>(1, "dist").clear().await.unwrap();

        for node in 0..3 {
            let cache = cluster.cache::<String, String>(node, "dist");
            assert_eq!(cache.size().await.unwrap(), 0);
            assert_eq!(cache.local_size(), 0);
        }

        cluster.shutdown().await;
    }
}

// =============================================================================
// Transactions
// =============================================================================

mod transaction_tests {
    use super::*;

    fn optimistic() -> CacheConfig {
        test_config(
            CacheConfig::distributed(2)
                .transactional(LockingMode::Optimistic, IsolationLevel::RepeatableRead)
                .with_write_skew_check(true),
        )
    }

    fn pessimistic() -> CacheConfig {
        test_config(
            CacheConfig::distributed(2).transactional(LockingMode::Pessimistic, IsolationLevel::RepeatableRead),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_commit_is_visible_everywhere_and_leaves_no_locks() {
        let cluster = TestCluster::start(3, &[("tx", optimistic())]).await;
        let a = cluster.cache::<String, String>(0, "tx");

        let tx = a.begin().unwrap();
        tx.put(&k("k1"), &s("v1")).await.unwrap();
        tx.put(&k("k2"), &s("v2")).await.unwrap();
        tx.commit().await.unwrap();

        for node in 0..3 {
            let cache = cluster.cache::<String, String>(node, "tx");
            assert_eq!(cache.get(&k("k1")).await.unwrap(), Some(s("v1")));
            assert_eq!(cache.get(&k("k2")).await.unwrap(), Some(s("v2")));
            assert_eq!(cache.remote_transaction_count(), 0);
        }
        assert_owners_agree(&cluster, "tx", "k1", Some("v1"));
        assert_owners_agree(&cluster, "tx", "k2", Some("v2"));
        assert_eq!(cluster.total_locks("tx"), 0);

        cluster.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_write_skew_across_nodes() {
        let cluster = TestCluster::start(3, &[("tx", optimistic())]).await;
        let a = cluster.cache::<String, String>(0, "tx");
        let b = cluster.cache::<String, String>(1, "tx");
        a.put(&k("k"), &s("initial")).await.unwrap();

        let tx1 = a.begin().unwrap();
        let tx2 = b.begin().unwrap();
        assert_eq!(tx1.get(&k("k")).await.unwrap(), Some(s("initial")));
        assert_eq!(tx2.get(&k("k")).await.unwrap(), Some(s("initial")));
        tx1.put(&k("k"), &s("from-a")).await.unwrap();
        tx2.put(&k("k"), &s("from-b")).await.unwrap();

        tx1.commit().await.unwrap();
        let err = tx2.commit().await.unwrap_err();
        assert!(matches!(err, CacheError::WriteSkew { .. }), "unexpected error {:?}", err);

        assert_eq!(b.get(&k("k")).await.unwrap(), Some(s("from-a")));
        assert_owners_agree(&cluster, "tx", "k", Some("from-a"));
        assert_eq!(cluster.total_locks("tx"), 0);

        cluster.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pessimistic_lock_blocks_other_nodes_until_commit() {
        let cluster = TestCluster::start(3, &[("tx", pessimistic())]).await;
        let a = cluster.cache::<String, String>(0, "tx");
        let c = cluster.cache::<String, String>(2, "tx");

        let tx1 = a.begin().unwrap();
        tx1.put(&k("k"), &s("first")).await.unwrap();
        assert_eq!(cluster.total_locks("tx"), 1);

        let tx2 = c.begin().unwrap();
        let err = tx2.put(&k("k"), &s("second")).await.unwrap_err();
        assert!(matches!(err, CacheError::LockTimeout { .. }), "unexpected error {:?}", err);
        tx2.rollback().await.unwrap();

        tx1.commit().await.unwrap();
        assert_eq!(c.get(&k("k")).await.unwrap(), Some(s("first")));
        assert_eq!(cluster.total_locks("tx"), 0);

        cluster.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_crossed_pessimistic_locks_time_out() {
        let cluster = TestCluster::start(3, &[("tx", pessimistic())]).await;
        let a = cluster.cache::<String, String>(0, "tx");
        let b = cluster.cache::<String, String>(1, "tx");

        let tx1 = a.begin().unwrap();
        let tx2 = b.begin().unwrap();
        tx1.put(&k("k1"), &s("tx1")).await.unwrap();
        tx2.put(&k("k2"), &s("tx2")).await.unwrap();

        let (k1, k2) = (k("k1"), k("k2"));
        let (v1, v2) = (s("tx1"), s("tx2"));
        let (r1, r2) = tokio::join!(tx1.put(&k2, &v1), tx2.put(&k1, &v2));
        assert!(matches!(r1, Err(CacheError::LockTimeout { .. })), "unexpected result {:?}", r1);
        assert!(matches!(r2, Err(CacheError::LockTimeout { .. })), "unexpected result {:?}", r2);

        tx1.rollback().await.unwrap();
        tx2.rollback().await.unwrap();
        assert_eq!(cluster.total_locks("tx"), 0);
        assert_eq!(a.get(&k1).await.unwrap(), None);
        assert_eq!(b.get(&k2).await.unwrap(), None);

        cluster.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_primary_crash_before_prepare_rolls_back_everywhere() {
        let mut cluster = TestCluster::start(3, &[("tx", optimistic())]).await;
        let a = cluster.cache::<String, String>(0, "tx");
        let node_a = cluster.nodes[0].id.clone();
        let node_b = cluster.nodes[1].id.clone();

        let mut used = HashSet::new();
        let on_b = key_with_primary(&a, &node_b, &used);
        used.insert(on_b.clone());
        let on_a = key_with_primary(&a, &node_a, &used);
        a.put(&on_b, &s("old-b")).await.unwrap();
        a.put(&on_a, &s("old-a")).await.unwrap();

        let tx = a.begin().unwrap();
        tx.put(&on_a, &s("new-a")).await.unwrap();
        tx.put(&on_b, &s("new-b")).await.unwrap();

        cluster.crash_silently(1);
        let err = tx.commit().await.unwrap_err();
        assert!(
            matches!(err, CacheError::RemoteCommunication { .. }),
            "unexpected error {:?}",
            err
        );

        let c = cluster.cache::<String, String>(2, "tx");
        for cache in [&a, &c] {
            assert_eq!(cache.get(&on_a).await.unwrap(), Some(s("old-a")));
            assert_eq!(cache.get(&on_b).await.unwrap(), Some(s("old-b")));
        }
        assert_eq!(cluster.total_locks("tx"), 0);

        cluster.network.remove_from_view(&node_b);
        cluster.wait_for_stable("tx").await;
        for cache in [&a, &c] {
            assert_eq!(cache.get(&on_a).await.unwrap(), Some(s("old-a")));
            assert_eq!(cache.get(&on_b).await.unwrap(), Some(s("old-b")));
            assert_eq!(cache.remote_transaction_count(), 0);
        }
        assert_owners_agree(&cluster, "tx", &on_b, Some("old-b"));

        cluster.shutdown().await;
    }
}

// =============================================================================
// Transactions across a rebalance
// =============================================================================

mod rebalance_transaction_tests {
    use super::*;

    const KEYS: usize = 64;

    fn optimistic(state_transfer_timeout_ms: u64) -> CacheConfig {
        let mut config = test_config(
            CacheConfig::distributed(2)
                .transactional(LockingMode::Optimistic, IsolationLevel::RepeatableRead)
                .with_write_skew_check(true),
        );
        config.state_transfer_timeout_ms = state_transfer_timeout_ms;
        config
    }

    fn keys() -> Vec<String> {
        (0..KEYS).map(|i| format!("key-{}", i)).collect()
    }

    async fn prepared_transaction(cache: &Cache<String, String>) -> distributed_cache::Transaction<String, String> {
        for key in keys() {
            cache.put(&key, &s("before")).await.unwrap();
        }
        let tx = cache.begin().unwrap();
        for key in keys() {
            assert_eq!(tx.get(&key).await.unwrap(), Some(s("before")));
            tx.put(&key, &s("tx1")).await.unwrap();
        }
        tx.prepare().await.unwrap();
        tx
    }

    async fn wait_for_rebalance(cache: &Cache<String, String>) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !cache.topology().is_some_and(|t| t.is_rebalancing()) {
            assert!(tokio::time::Instant::now() < deadline, "rebalance never started");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_rebalance_waits_for_prepared_transaction() {
        let mut cluster = TestCluster::start(2, &[("tx", optimistic(10_000))]).await;
        let a = cluster.cache::<String, String>(0, "tx");
        let tx = prepared_transaction(&a).await;
        assert!(cluster.total_locks("tx") >= KEYS);

        let joiner = cluster.add_node().await;
        let c = cluster.cache::<String, String>(joiner, "tx");
        let node_c = cluster.nodes[joiner].id.clone();
        wait_for_rebalance(&a).await;
        let pending = a.topology().unwrap();
        let moved = keys()
            .into_iter()
            .find(|key| pending.target_ch().locate_primary(key) == Some(&node_c))
            .unwrap();

        // The old primary still holds the lock, so a competing write cannot get through.
        assert!(c.put(&moved, &s("concurrent")).await.is_err());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(a.topology().unwrap().is_rebalancing());

        tx.commit().await.unwrap();
        cluster.wait_for_stable("tx").await;
        assert_eq!(c.locate_owners(&moved).unwrap().first(), Some(&node_c));
        for key in keys() {
            assert_owners_agree(&cluster, "tx", &key, Some("tx1"));
        }

        c.put(&moved, &s("later")).await.unwrap();
        for node in 0..3 {
            let cache = cluster.cache::<String, String>(node, "tx");
            assert_eq!(cache.get(&moved).await.unwrap(), Some(s("later")));
        }
        assert_owners_agree(&cluster, "tx", &moved, Some("later"));
        assert_eq!(cluster.total_locks("tx"), 0);

        cluster.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_commit_after_primary_moved_is_refused() {
        let mut cluster = TestCluster::start(2, &[("tx", optimistic(1_000))]).await;
        let a = cluster.cache::<String, String>(0, "tx");
        let tx = prepared_transaction(&a).await;

        let joiner = cluster.add_node().await;
        cluster.wait_for_stable("tx").await;
        let c = cluster.cache::<String, String>(joiner, "tx");
        let node_c = cluster.nodes[joiner].id.clone();
        let moved = keys()
            .into_iter()
            .find(|key| c.locate_owners(key).unwrap().first() == Some(&node_c))
            .unwrap();

        c.put(&moved, &s("concurrent")).await.unwrap();
        let err = tx.commit().await.unwrap_err();
        assert!(
            matches!(err, CacheError::OutdatedTopology { .. }),
            "unexpected error {:?}",
            err
        );
        assert_eq!(a.get(&moved).await.unwrap(), Some(s("concurrent")));

        c.put(&moved, &s("later")).await.unwrap();
        assert_eq!(a.get(&moved).await.unwrap(), Some(s("later")));
        assert_owners_agree(&cluster, "tx", &moved, Some("later"));
        assert_eq!(cluster.total_locks("tx"), 0);

        cluster.shutdown().await;
    }
}

// =============================================================================
// Rebalancing
// =============================================================================

mod rebalance_tests {
    use super::*;

    async fn populate(cache: &Cache<String, String>, count: usize) {
        for i in 0..count {
            cache.put(&format!("key-{}", i), &format!("value-{}", i)).await.unwrap();
        }
    }

    async fn assert_all_present(cluster: &TestCluster, count: usize) {
        for node in cluster.alive() {
            let cache = cluster.cache::<String, String>(cluster.index_of(&node.id), "dist");
            for i in 0..count {
                let key = format!("key-{}", i);
                assert_eq!(
                    cache.get(&key).await.unwrap(),
                    Some(format!("value-{}", i)),
                    "{} lost {}",
                    node.id,
                    key
                );
            }
        }
        for i in 0..count {
            assert_owners_agree(cluster, "dist", &format!("key-{}", i), Some(format!("value-{}", i).as_str()));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_join_moves_segments_and_keeps_values() {
        let mut cluster = TestCluster::start(2, &[("dist", test_config(CacheConfig::distributed(2)))]).await;
        let a = cluster.cache::<String, String>(0, "dist");
        populate(&a, 100).await;
        let before = a.topology().unwrap().id;

        cluster.add_node().await;
        cluster.wait_for_stable("dist").await;

        assert!(a.topology().unwrap().id > before);
        assert_all_present(&cluster, 100).await;
        let joiner = cluster.cache::<String, String>(2, "dist");
        assert!(joiner.local_size() > 0);

        cluster.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_graceful_leave_keeps_values() {
        let mut cluster = TestCluster::start(3, &[("dist", test_config(CacheConfig::distributed(2)))]).await;
        populate(&cluster.cache::<String, String>(1, "dist"), 100).await;

        cluster.stop_node(1).await;
        cluster.wait_for_stable("dist").await;

        assert_all_present(&cluster, 100).await;
        cluster.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_coordinator_leave_hands_over() {
        let mut cluster = TestCluster::start(3, &[("dist", test_config(CacheConfig::distributed(2)))]).await;
        populate(&cluster.cache::<String, String>(0, "dist"), 50).await;

        cluster.stop_node(0).await;
        cluster.wait_for_stable("dist").await;
        assert_all_present(&cluster, 50).await;

        cluster.add_node().await;
        cluster.wait_for_stable("dist").await;
        assert_all_present(&cluster, 50).await;

        cluster.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_writes_during_rebalance_are_not_lost() {
        let mut cluster = TestCluster::start(2, &[("dist", test_config(CacheConfig::distributed(2)))]).await;
        let a = cluster.cache::<String, String>(0, "dist");
        populate(&a, 50).await;

        let writer = {
            let a = a.clone();
            tokio::spawn(async move {
                for i in 50..100 {
                    a.put(&format!("key-{}", i), &format!("value-{}", i)).await.unwrap();
                }
            })
        };
        cluster.add_node().await;
        writer.await.unwrap();
        cluster.wait_for_stable("dist").await;

        assert_all_present(&cluster, 100).await;
        cluster.shutdown().await;
    }
}
