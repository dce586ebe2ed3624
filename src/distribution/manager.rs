use super::topology::CacheTopology;
use crate::error::{CacheError, Result};
use crate::membership::types::NodeId;

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Holds the topology a node has installed for one cache and answers
/// ownership questions against it.
pub struct DistributionManager {
    local: NodeId,
    topology: RwLock<Option<Arc<CacheTopology>>>,
    installed: watch::Sender<u64>,
}

impl DistributionManager {
    pub fn new(local: NodeId) -> Self {
        let (installed, _) = watch::channel(0);
        Self {
            local,
            topology: RwLock::new(None),
            installed,
        }
    }

    pub fn local_node(&self) -> &NodeId {
        &self.local
    }

    pub fn topology(&self) -> Option<Arc<CacheTopology>> {
        self.topology.read().clone()
    }

    pub fn topology_id(&self) -> u64 {
        self.topology.read().as_ref().map(|t| t.id).unwrap_or(0)
    }

    pub fn require_topology(&self) -> Result<Arc<CacheTopology>> {
        self.topology()
            .ok_or_else(|| CacheError::Internal("no topology installed yet".into()))
    }

    /// Installs `topology` if it is newer than the installed one.
    pub fn install(&self, topology: CacheTopology) -> bool {
        let id = topology.id;
        {
            let mut slot = self.topology.write();
            if slot.as_ref().is_some_and(|current| current.id >= id) {
                return false;
            }
            *slot = Some(Arc::new(topology));
        }
        self.installed.send_replace(id);
        tracing::debug!("{} installed topology {}", self.local, id);
        true
    }

    /// Waits until a topology with id >= `min_id` is installed.
    pub async fn wait_for_topology(&self, min_id: u64, timeout: Duration) -> Result<Arc<CacheTopology>> {
        let mut rx = self.installed.subscribe();
        let waited = tokio::time::timeout(timeout, async {
            rx.wait_for(|id| *id >= min_id).await.map(|_| ())
        })
        .await;
        match waited {
            Ok(Ok(())) => self.require_topology(),
            Ok(Err(_)) => Err(CacheError::Internal("topology channel closed".into())),
            Err(_) => Err(CacheError::OutdatedTopology {
                requested: min_id,
                current: self.topology_id(),
            }),
        }
    }

    pub fn locate_owners(&self, key: &str) -> Result<Vec<NodeId>> {
        let topology = self.require_topology()?;
        Ok(topology.read_ch().locate_owners(key).to_vec())
    }

    pub fn is_primary_owner(&self, key: &str) -> bool {
        self.topology()
            .is_some_and(|t| t.write_ch().is_primary_owner(key, &self.local))
    }

    pub fn is_owner(&self, key: &str) -> bool {
        self.topology()
            .is_some_and(|t| t.write_ch().is_owner(key, &self.local))
    }
}
