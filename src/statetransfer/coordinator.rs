//! Cluster-wide topology decisions for one cache.
//!
//! Only the membership coordinator (first member of the view) runs this. On
//! every view change it drops departed owners, computes the balanced target
//! placement and publishes a rebalancing topology; once every member confirms
//! it received its new segments, it publishes the target as the new current
//! placement.

use crate::cache::registry::CacheComponents;
use crate::distribution::{CacheTopology, ConsistentHashFactory};
use crate::error::Result;
use crate::membership::types::{ClusterView, NodeId};
use crate::rpc::protocol::{CacheCommand, CacheResponse};

use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct RebalanceStatus {
    topology: Option<CacheTopology>,
    /// Members that still have to confirm the pending placement.
    awaiting: BTreeSet<NodeId>,
    /// Whether this node already collected the members' topologies since it
    /// became coordinator.
    recovered: bool,
}

#[derive(Debug, Default)]
pub struct ClusterTopologyManager {
    status: Mutex<RebalanceStatus>,
}

impl ClusterTopologyManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forgets coordinator state after another node took over.
    pub async fn step_down(&self) {
        let mut status = self.status.lock().await;
        if status.recovered {
            tracing::debug!("No longer coordinating topology");
        }
        *status = RebalanceStatus::default();
    }

    pub async fn is_rebalancing(&self) -> bool {
        self.status
            .lock()
            .await
            .topology
            .as_ref()
            .is_some_and(CacheTopology::is_rebalancing)
    }
}

/// Reacts to a new membership view. Must only run on the view's coordinator.
pub(crate) async fn handle_view_change(cache: &Arc<CacheComponents>, view: &ClusterView) -> Result<()> {
    let mut status = cache.topology_manager.status.lock().await;

    let just_recovered = !status.recovered;
    if just_recovered {
        status.topology = recover_topology(cache, view).await;
        status.recovered = true;
        if let Some(topology) = &status.topology {
            tracing::info!(
                "Cache {}: coordinator {} continues from topology {}",
                cache.name,
                cache.local,
                topology.id
            );
        }
    }

    let members = view.members.clone();
    let num_owners = cache.config.owners_for(members.len());
    let num_segments = cache.config.num_segments;

    let next = match &status.topology {
        None => {
            let ch = ConsistentHashFactory::create(&members, num_owners, num_segments)?;
            CacheTopology::new(1, members, ch, None)
        }
        Some(current) => {
            let unchanged = current.members == members;
            if unchanged && !(just_recovered && current.is_rebalancing()) {
                return Ok(());
            }
            if current.is_rebalancing() {
                tracing::info!(
                    "Cache {}: membership changed during rebalance {}, restarting it",
                    cache.name,
                    current.id
                );
            }

            match current.read_ch().remove_leavers(&members) {
                None => {
                    tracing::error!(
                        "Cache {}: every owner left, starting from an empty placement",
                        cache.name
                    );
                    let ch = ConsistentHashFactory::create(&members, num_owners, num_segments)?;
                    CacheTopology::new(current.id + 1, members, ch, None)
                }
                Some(base) => {
                    let target = ConsistentHashFactory::rebalance(&base, &members, num_owners)?;
                    if target == base {
                        CacheTopology::new(current.id + 1, members, base, None)
                    } else {
                        CacheTopology::new(current.id + 1, members, base, Some(target))
                    }
                }
            }
        }
    };

    status.awaiting = if next.is_rebalancing() {
        next.members.iter().cloned().collect()
    } else {
        BTreeSet::new()
    };
    status.topology = Some(next.clone());
    publish(cache, next).await;
    Ok(())
}

/// A member finished receiving its segments of `topology_id`.
pub(crate) async fn handle_rebalance_confirm(
    cache: &Arc<CacheComponents>,
    topology_id: u64,
    node: NodeId,
) -> Result<CacheResponse> {
    let mut status = cache.topology_manager.status.lock().await;

    let Some(current) = status.topology.clone() else {
        return Ok(CacheResponse::Ack);
    };
    if current.id != topology_id || !current.is_rebalancing() {
        tracing::debug!(
            "Ignoring confirmation of topology {} from {} (current is {})",
            topology_id,
            node,
            current.id
        );
        return Ok(CacheResponse::Ack);
    }

    status.awaiting.remove(&node);
    if !status.awaiting.is_empty() {
        tracing::debug!(
            "Cache {}: {} confirmed rebalance {}, waiting for {:?}",
            cache.name,
            node,
            topology_id,
            status.awaiting
        );
        return Ok(CacheResponse::Ack);
    }

    let Some(target) = current.pending.clone() else {
        return Ok(CacheResponse::Ack);
    };
    let finished = CacheTopology::new(current.id + 1, current.members.clone(), target, None);
    tracing::info!(
        "Cache {}: rebalance {} complete, publishing topology {}",
        cache.name,
        topology_id,
        finished.id
    );
    status.topology = Some(finished.clone());
    publish(cache, finished).await;
    Ok(CacheResponse::Ack)
}

pub(crate) fn handle_topology_status(cache: &CacheComponents) -> CacheResponse {
    CacheResponse::Topology(cache.distribution.topology().map(|t| (*t).clone()))
}

/// Highest topology installed on any member, including this one.
async fn recover_topology(cache: &CacheComponents, view: &ClusterView) -> Option<CacheTopology> {
    let mut best = cache.distribution.topology().map(|t| (*t).clone());

    let others: Vec<NodeId> = view
        .members
        .iter()
        .filter(|member| *member != &cache.local)
        .cloned()
        .collect();
    let replies = cache
        .rpc
        .invoke_many(
            &others,
            &cache.name,
            CacheCommand::TopologyStatus,
            cache.config.remote_timeout(),
        )
        .await;

    for (node, reply) in replies {
        match reply {
            Ok(CacheResponse::Topology(Some(topology))) => {
                if best.as_ref().is_none_or(|b| topology.id > b.id) {
                    best = Some(topology);
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Topology status from {} failed: {}", node, e),
        }
    }
    best
}

async fn publish(cache: &CacheComponents, topology: CacheTopology) {
    tracing::info!(
        "Cache {}: publishing topology {} to {:?} (rebalancing: {})",
        cache.name,
        topology.id,
        topology.members,
        topology.is_rebalancing()
    );
    let members = topology.members.clone();
    let replies = cache
        .rpc
        .invoke_many(
            &members,
            &cache.name,
            CacheCommand::TopologyUpdate { topology },
            cache.config.remote_timeout(),
        )
        .await;
    for (node, reply) in replies {
        if let Err(e) = reply {
            tracing::warn!("Topology update to {} failed: {}", node, e);
        }
    }
}
