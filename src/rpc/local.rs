//! In-process network.
//!
//! Nodes of a [`LocalNetwork`] share one membership view and deliver commands
//! to each other's handlers on separate tasks, so a timed-out caller never
//! cancels the work already running on the receiver.

use super::protocol::{CacheResponse, RpcEnvelope};
use super::{RequestHandler, Transport};
use crate::error::{CacheError, Result};
use crate::membership::MembershipProvider;
use crate::membership::types::{ClusterView, NodeId};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;

#[derive(Clone)]
pub struct LocalNetwork {
    inner: Arc<NetworkInner>,
}

struct NetworkInner {
    handlers: DashMap<NodeId, Weak<dyn RequestHandler>>,
    /// Nodes that stopped answering but may still be in the view.
    unreachable: DashSet<NodeId>,
    members: Mutex<Vec<NodeId>>,
    view_tx: watch::Sender<ClusterView>,
}

impl Default for LocalNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalNetwork {
    pub fn new() -> Self {
        let (view_tx, _) = watch::channel(ClusterView::default());
        Self {
            inner: Arc::new(NetworkInner {
                handlers: DashMap::new(),
                unreachable: DashSet::new(),
                members: Mutex::new(Vec::new()),
                view_tx,
            }),
        }
    }

    pub fn transport(&self, node: NodeId) -> Arc<LocalTransport> {
        Arc::new(LocalTransport {
            local: node,
            network: self.clone(),
        })
    }

    pub fn membership(&self, node: NodeId) -> Arc<LocalMembership> {
        Arc::new(LocalMembership {
            local: node,
            network: self.clone(),
        })
    }

    pub fn view(&self) -> ClusterView {
        self.inner.view_tx.borrow().clone()
    }

    fn publish(&self, members: Vec<NodeId>) {
        self.inner.view_tx.send_modify(|view| {
            view.view_id += 1;
            view.members = members;
            tracing::info!(
                "Local network view {}: {:?}",
                view.view_id,
                view.members
            );
        });
    }

    fn join(&self, node: NodeId, handler: Weak<dyn RequestHandler>) {
        self.inner.unreachable.remove(&node);
        self.inner.handlers.insert(node.clone(), handler);
        let members = {
            let mut members = self.inner.members.lock();
            if !members.contains(&node) {
                members.push(node);
            }
            members.clone()
        };
        self.publish(members);
    }

    /// Graceful departure.
    pub fn leave(&self, node: &NodeId) {
        self.inner.handlers.remove(node);
        self.remove_from_view(node);
    }

    /// The node stops answering and leaves the view at once.
    pub fn crash(&self, node: &NodeId) {
        self.crash_silently(node);
        self.remove_from_view(node);
    }

    /// The node stops answering; the view keeps it until
    /// [`remove_from_view`](Self::remove_from_view), like a failure detector
    /// that has not noticed yet.
    pub fn crash_silently(&self, node: &NodeId) {
        self.inner.unreachable.insert(node.clone());
        self.inner.handlers.remove(node);
    }

    pub fn remove_from_view(&self, node: &NodeId) {
        let members = {
            let mut members = self.inner.members.lock();
            let before = members.len();
            members.retain(|member| member != node);
            if members.len() == before {
                return;
            }
            members.clone()
        };
        self.publish(members);
    }

    async fn deliver(
        &self,
        target: &NodeId,
        envelope: RpcEnvelope,
        timeout: Duration,
    ) -> Result<CacheResponse> {
        if self.inner.unreachable.contains(target) {
            return Err(CacheError::remote(target, "node is unreachable"));
        }
        let handler = self
            .inner
            .handlers
            .get(target)
            .and_then(|handler| handler.upgrade())
            .ok_or_else(|| CacheError::remote(target, "node is not a member"))?;

        let task = tokio::spawn(async move { handler.handle(envelope).await });
        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(CacheError::remote(target, format!("handler failed: {}", e))),
            Err(_) => Err(CacheError::remote(
                target,
                format!("timed out after {:?}", timeout),
            )),
        }
    }
}

pub struct LocalTransport {
    local: NodeId,
    network: LocalNetwork,
}

#[async_trait]
impl Transport for LocalTransport {
    fn local_node(&self) -> NodeId {
        self.local.clone()
    }

    async fn start(&self, handler: Weak<dyn RequestHandler>) -> Result<()> {
        self.network.join(self.local.clone(), handler);
        Ok(())
    }

    async fn stop(&self) {
        self.network.leave(&self.local);
    }

    async fn send(&self, target: &NodeId, envelope: RpcEnvelope, timeout: Duration) -> Result<CacheResponse> {
        if self.network.inner.unreachable.contains(&self.local) {
            return Err(CacheError::remote(target, "local node is disconnected"));
        }
        self.network.deliver(target, envelope, timeout).await
    }
}

pub struct LocalMembership {
    local: NodeId,
    network: LocalNetwork,
}

impl MembershipProvider for LocalMembership {
    fn local_node(&self) -> NodeId {
        self.local.clone()
    }

    fn subscribe(&self) -> watch::Receiver<ClusterView> {
        self.network.inner.view_tx.subscribe()
    }
}
