use super::stats::CacheStats;
use crate::config::CacheConfig;
use crate::container::{DataContainer, VersionGenerator};
use crate::distribution::{CacheTopology, ConsistentHashFactory, DistributionManager};
use crate::error::{CacheError, Result};
use crate::interceptors::Pipeline;
use crate::lock::LockManager;
use crate::membership::types::NodeId;
use crate::rpc::RpcManager;
use crate::statetransfer::{ClusterTopologyManager, StateConsumer, StateTransferLock};
use crate::time::TimeService;
use crate::transaction::TransactionTable;

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Stable index of a cache in its manager's component arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheId(pub(crate) usize);

/// Everything one cache needs on one node.
pub struct CacheComponents {
    pub name: String,
    pub config: CacheConfig,
    pub local: NodeId,
    pub time: Arc<dyn TimeService>,
    pub container: DataContainer,
    pub versions: VersionGenerator,
    pub locks: LockManager,
    pub distribution: DistributionManager,
    pub rpc: Arc<RpcManager>,
    pub st_lock: StateTransferLock,
    pub consumer: StateConsumer,
    pub topology_manager: ClusterTopologyManager,
    pub tx_table: TransactionTable,
    pub stats: CacheStats,
    pub pipeline: Pipeline,
    running: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CacheComponents {
    pub fn new(
        name: &str,
        config: CacheConfig,
        local: NodeId,
        time: Arc<dyn TimeService>,
        rpc: Arc<RpcManager>,
    ) -> Arc<Self> {
        let pipeline = Pipeline::for_config(&config);
        Arc::new(Self {
            name: name.to_string(),
            container: DataContainer::new(config.num_segments, time.clone()).with_eviction(&config.eviction),
            versions: VersionGenerator::new(),
            locks: LockManager::new(),
            distribution: DistributionManager::new(local.clone()),
            st_lock: StateTransferLock::new(),
            consumer: StateConsumer::new(),
            topology_manager: ClusterTopologyManager::new(),
            tx_table: TransactionTable::new(),
            stats: CacheStats::default(),
            pipeline,
            running: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            config,
            local,
            time,
            rpc,
        })
    }

    pub fn is_clustered(&self) -> bool {
        self.config.mode.is_clustered()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(CacheError::NotRunning(self.name.clone()))
        }
    }

    /// Starts background work. A local cache installs its single-node topology here;
    /// a clustered one waits for the coordinator's first topology.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if !self.is_clustered() {
            let ch = ConsistentHashFactory::create(
                std::slice::from_ref(&self.local),
                1,
                self.config.num_segments,
            )?;
            self.distribution
                .install(CacheTopology::new(1, vec![self.local.clone()], ch, None));
        }

        let reaper = {
            let cache = Arc::downgrade(self);
            let interval = Duration::from_millis(self.config.expiration_interval_ms.max(10));
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    let Some(cache) = cache.upgrade() else {
                        break;
                    };
                    let purged = cache.container.purge_expired();
                    if purged > 0 {
                        tracing::debug!("Cache {} purged {} expired entries", cache.name, purged);
                    }
                }
            })
        };
        self.tasks.lock().push(reaper);

        self.running.store(true, Ordering::SeqCst);
        tracing::info!("Started cache {} ({:?}) on {}", self.name, self.config.mode, self.local);
        Ok(())
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
        tracing::info!("Stopped cache {} on {}", self.name, self.local);
    }

    pub(crate) fn track_task(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    /// Installed topology, waiting for the first one if none arrived yet.
    pub async fn current_topology(&self) -> Result<Arc<CacheTopology>> {
        match self.distribution.topology() {
            Some(topology) => Ok(topology),
            None => {
                self.distribution
                    .wait_for_topology(1, self.config.state_transfer_timeout())
                    .await
            }
        }
    }
}

/// Arena of per-cache components owned by a cache manager.
#[derive(Default)]
pub struct ComponentRegistry {
    caches: RwLock<Vec<Arc<CacheComponents>>>,
    by_name: RwLock<HashMap<String, CacheId>>,
}

impl ComponentRegistry {
    pub fn register(&self, components: Arc<CacheComponents>) -> CacheId {
        let mut caches = self.caches.write();
        let id = CacheId(caches.len());
        self.by_name.write().insert(components.name.clone(), id);
        caches.push(components);
        id
    }

    pub fn get(&self, id: CacheId) -> Option<Arc<CacheComponents>> {
        self.caches.read().get(id.0).cloned()
    }

    pub fn id_of(&self, name: &str) -> Option<CacheId> {
        self.by_name.read().get(name).copied()
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<CacheComponents>> {
        self.id_of(name).and_then(|id| self.get(id))
    }

    pub fn all(&self) -> Vec<Arc<CacheComponents>> {
        self.caches.read().clone()
    }
}
