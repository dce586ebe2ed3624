//! Membership & Discovery Module
//!
//! The cache engine never tracks liveness itself. It consumes an ordered
//! [`ClusterView`](types::ClusterView) from a [`MembershipProvider`] and plans
//! topologies from it.
//!
//! ## Providers
//! - **Gossip** ([`service::MembershipService`]): a SWIM-style UDP protocol. Nodes ping
//!   random peers, exchange member lists and move silent peers through
//!   "Suspect" -> "Dead". Incarnation numbers resolve disputed states.
//! - **In-memory** ([`crate::rpc::local::LocalNetwork`]): views published directly by
//!   an in-process cluster, used by tests.

pub mod service;
pub mod types;

use tokio::sync::watch;
use types::{ClusterView, NodeId};

/// Source of cluster views for one node.
pub trait MembershipProvider: Send + Sync + 'static {
    fn local_node(&self) -> NodeId;

    /// Receiver that always holds the latest view.
    fn subscribe(&self) -> watch::Receiver<ClusterView>;
}
