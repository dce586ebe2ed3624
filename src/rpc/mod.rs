//! RPC Module
//!
//! Request/response messaging between cache nodes.
//!
//! ## Components
//! - [`Transport`]: delivers an envelope to one node and awaits its reply.
//! - [`RequestHandler`]: inbound side, implemented by the cache manager.
//! - [`RpcManager`]: per-node dispatcher. Commands addressed to the local node
//!   run in-process; everything else goes through the transport.
//! - [`local::LocalNetwork`]: in-process network for embedded clusters and tests.
//! - [`http::HttpTransport`]: JSON over HTTP between processes.

pub mod handlers;
pub mod http;
pub mod local;
pub mod protocol;

use crate::error::{CacheError, Result};
use crate::membership::types::NodeId;
use protocol::{CacheCommand, CacheResponse, RpcEnvelope};

use async_trait::async_trait;
use futures::future::join_all;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, envelope: RpcEnvelope) -> Result<CacheResponse>;
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn local_node(&self) -> NodeId;

    /// Starts accepting requests for `handler` and joins the cluster.
    async fn start(&self, handler: Weak<dyn RequestHandler>) -> Result<()>;

    /// Leaves the cluster.
    async fn stop(&self);

    /// Sends `envelope` to `target`. A failure or timeout surfaces as
    /// [`CacheError::RemoteCommunication`]; the command's effect there is unknown.
    async fn send(&self, target: &NodeId, envelope: RpcEnvelope, timeout: Duration) -> Result<CacheResponse>;
}

pub struct RpcManager {
    local: NodeId,
    transport: Option<Arc<dyn Transport>>,
    handler: OnceLock<Weak<dyn RequestHandler>>,
}

impl RpcManager {
    pub fn new(local: NodeId, transport: Option<Arc<dyn Transport>>) -> Self {
        Self {
            local,
            transport,
            handler: OnceLock::new(),
        }
    }

    pub fn local_node(&self) -> &NodeId {
        &self.local
    }

    pub fn is_clustered(&self) -> bool {
        self.transport.is_some()
    }

    pub(crate) fn set_local_handler(&self, handler: Weak<dyn RequestHandler>) {
        let _ = self.handler.set(handler);
    }

    pub(crate) fn local_handler(&self) -> Result<Arc<dyn RequestHandler>> {
        self.handler
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| CacheError::NotRunning("cache manager".into()))
    }

    pub async fn invoke(
        &self,
        target: &NodeId,
        cache: &str,
        command: CacheCommand,
        timeout: Duration,
    ) -> Result<CacheResponse> {
        let envelope = RpcEnvelope {
            origin: self.local.clone(),
            cache: cache.to_string(),
            command,
        };

        if target == &self.local {
            return self.local_handler()?.handle(envelope).await;
        }

        let transport = self.transport.as_ref().ok_or_else(|| {
            CacheError::remote(target, "no transport configured for a local cache manager")
        })?;
        tracing::debug!("{} -> {}: {}", self.local, target, envelope.command.name());
        transport.send(target, envelope, timeout).await
    }

    /// Sends the same command to every target in parallel.
    pub async fn invoke_many(
        &self,
        targets: &[NodeId],
        cache: &str,
        command: CacheCommand,
        timeout: Duration,
    ) -> Vec<(NodeId, Result<CacheResponse>)> {
        let calls = targets.iter().map(|target| {
            let command = command.clone();
            async move {
                let result = self.invoke(target, cache, command, timeout).await;
                (target.clone(), result)
            }
        });
        join_all(calls).await
    }

    /// Like [`invoke_many`](Self::invoke_many), failing with the first error.
    pub async fn invoke_all(
        &self,
        targets: &[NodeId],
        cache: &str,
        command: CacheCommand,
        timeout: Duration,
    ) -> Result<Vec<(NodeId, CacheResponse)>> {
        self.invoke_many(targets, cache, command, timeout)
            .await
            .into_iter()
            .map(|(node, result)| result.map(|response| (node, response)))
            .collect()
    }
}
