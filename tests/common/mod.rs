//! In-process cluster harness.
//!
//! Nodes share a `LocalNetwork`; they are named `node-a`, `node-b`, ... in
//! join order, so the first node is the coordinator.

#![allow(dead_code)]

use distributed_cache::rpc::local::LocalNetwork;
use distributed_cache::{Cache, CacheConfig, CacheManager, NodeId};
use serde::{Serialize, de::DeserializeOwned};
use std::time::Duration;

pub const STABLE_TIMEOUT: Duration = Duration::from_secs(15);

pub struct TestNode {
    pub id: NodeId,
    pub manager: CacheManager,
    pub alive: bool,
}

pub struct TestCluster {
    pub network: LocalNetwork,
    pub nodes: Vec<TestNode>,
    caches: Vec<(String, CacheConfig)>,
}

/// Short timeouts so failure scenarios finish quickly.
pub fn test_config(config: CacheConfig) -> CacheConfig {
    let mut config = config
        .with_segments(32)
        .with_lock_timeout(Duration::from_millis(500))
        .with_remote_timeout(Duration::from_secs(2));
    config.state_transfer_timeout_ms = 10_000;
    config
}

impl TestCluster {
    pub async fn start(size: usize, caches: &[(&str, CacheConfig)]) -> Self {
        let mut cluster = Self {
            network: LocalNetwork::new(),
            nodes: Vec::new(),
            caches: caches
                .iter()
                .map(|(name, config)| (name.to_string(), config.clone()))
                .collect(),
        };
        for _ in 0..size {
            cluster.add_node().await;
        }
        for (name, _) in caches {
            cluster.wait_for_stable(name).await;
        }
        cluster
    }

    /// Starts one more node and returns its index. Does not wait for the
    /// rebalance.
    pub async fn add_node(&mut self) -> usize {
        let index = self.nodes.len();
        let id = NodeId(format!("node-{}", (b'a' + index as u8) as char));
        let manager = CacheManager::builder()
            .transport(self.network.transport(id.clone()))
            .membership(self.network.membership(id.clone()))
            .build()
            .unwrap();
        for (name, config) in &self.caches {
            manager.define_configuration(name, config.clone()).unwrap();
        }
        manager.init().await.unwrap();
        self.nodes.push(TestNode {
            id,
            manager,
            alive: true,
        });
        index
    }

    pub fn cache<K, V>(&self, node: usize, name: &str) -> Cache<K, V>
    where
        K: ToString + std::str::FromStr,
        <K as std::str::FromStr>::Err: std::fmt::Display,
        V: Serialize + DeserializeOwned,
    {
        self.nodes[node].manager.cache(name).unwrap()
    }

    pub fn alive(&self) -> impl Iterator<Item = &TestNode> {
        self.nodes.iter().filter(|node| node.alive)
    }

    pub fn index_of(&self, id: &NodeId) -> usize {
        self.nodes
            .iter()
            .position(|node| &node.id == id)
            .unwrap()
    }

    /// Graceful shutdown of one node.
    pub async fn stop_node(&mut self, node: usize) {
        self.nodes[node].manager.shutdown().await;
        self.nodes[node].alive = false;
    }

    /// The node stops answering but stays in the view.
    pub fn crash_silently(&mut self, node: usize) {
        self.network.crash_silently(&self.nodes[node].id);
        self.nodes[node].alive = false;
    }

    /// Waits until every live node has installed the same topology, without a
    /// pending hash, whose members are exactly the live nodes.
    pub async fn wait_for_stable(&self, name: &str) {
        let mut expected: Vec<NodeId> = self.alive().map(|node| node.id.clone()).collect();
        expected.sort();

        let deadline = tokio::time::Instant::now() + STABLE_TIMEOUT;
        loop {
            if self.is_stable(name, &expected) {
                return;
            }
            if tokio::time::Instant::now() > deadline {
                let topologies: Vec<_> = self
                    .alive()
                    .map(|node| node.manager.topology(name).unwrap().map(|t| (t.id, t.members, t.pending.is_some())))
                    .collect();
                panic!("cache {} did not stabilize: {:?}", name, topologies);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    fn is_stable(&self, name: &str, expected: &[NodeId]) -> bool {
        let mut seen_id = None;
        for node in self.alive() {
            let Some(topology) = node.manager.topology(name).unwrap() else {
                return false;
            };
            if topology.is_rebalancing() {
                return false;
            }
            let mut members = topology.members.clone();
            members.sort();
            if members != expected {
                return false;
            }
            match seen_id {
                None => seen_id = Some(topology.id),
                Some(id) if id != topology.id => return false,
                Some(_) => {}
            }
        }
        true
    }

    /// Locks held on every live node.
    pub fn total_locks(&self, name: &str) -> usize {
        self.alive()
            .map(|node| self.cache::<String, serde_json::Value>(self.index_of(&node.id), name).lock_count())
            .sum()
    }

    pub async fn shutdown(self) {
        for node in self.nodes.iter().filter(|node| node.alive) {
            node.manager.shutdown().await;
        }
    }
}
