use super::protocol::{CacheResponse, ENDPOINT_RPC, RpcEnvelope, RpcReply};
use super::{RequestHandler, Transport};
use crate::error::{CacheError, Result};
use crate::membership::service::MembershipService;
use crate::membership::types::NodeId;

use async_trait::async_trait;
use std::sync::{Arc, Weak};
use std::time::Duration;

const CONNECT_ATTEMPTS: usize = 3;

/// JSON-over-HTTP transport. Node addresses come from the gossip member list;
/// the inbound side is the [`ENDPOINT_RPC`] route served by the node binary.
pub struct HttpTransport {
    membership: Arc<MembershipService>,
    http_client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(membership: Arc<MembershipService>) -> Self {
        Self {
            membership,
            http_client: reqwest::Client::new(),
        }
    }

    /// Retries only failures to establish a connection; once a request may
    /// have reached the receiver its outcome is surfaced as is.
    async fn post_with_retry(
        &self,
        target: &NodeId,
        url: String,
        payload: &RpcEnvelope,
        timeout: Duration,
    ) -> Result<reqwest::Response> {
        let mut delay_ms = 150u64;

        for attempt in 0..CONNECT_ATTEMPTS {
            let response = self
                .http_client
                .post(url.clone())
                .json(payload)
                .timeout(timeout)
                .send()
                .await;

            match response {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_connect() && attempt + 1 < CONNECT_ATTEMPTS => {
                    tracing::debug!("Connecting to {} failed ({}), retrying", target, e);
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(1200);
                }
                Err(e) => return Err(CacheError::remote(target, e)),
            }
        }

        Err(CacheError::remote(target, "retry attempts exhausted"))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn local_node(&self) -> NodeId {
        self.membership.local_node.id.clone()
    }

    async fn start(&self, _handler: Weak<dyn RequestHandler>) -> Result<()> {
        tracing::info!(
            "HTTP transport ready on {}{}",
            self.membership.local_node.http_addr,
            ENDPOINT_RPC
        );
        Ok(())
    }

    async fn stop(&self) {
        self.membership.stop();
    }

    async fn send(&self, target: &NodeId, envelope: RpcEnvelope, timeout: Duration) -> Result<CacheResponse> {
        let node = self
            .membership
            .get_member(target)
            .ok_or_else(|| CacheError::remote(target, "node not found in membership"))?;
        let url = format!("http://{}{}", node.http_addr, ENDPOINT_RPC);

        let response = self.post_with_retry(target, url, &envelope, timeout).await?;
        if !response.status().is_success() {
            return Err(CacheError::remote(
                target,
                format!("RPC failed with status {}", response.status()),
            ));
        }

        let reply: RpcReply = response
            .json()
            .await
            .map_err(|e| CacheError::remote(target, e))?;
        reply
    }
}
