use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeState {
    Alive,
    Suspect,
    Dead,
}

/// A single member as seen by the gossip protocol.
///
/// The `incarnation` field is a logical clock used to order updates and resolve
/// conflicts, e.g. refuting a false "Suspect" claim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub gossip_addr: SocketAddr,
    pub http_addr: SocketAddr,
    pub state: NodeState,
    pub incarnation: u64,

    #[serde(skip)]
    pub last_seen: Option<Instant>,
}

/// Gossip wire protocol.
///
/// - `Ping/Ack`: liveness checks and member list exchange.
/// - `Join`: sent by a new node to the seed nodes.
/// - `Suspect/Alive`: disseminate health changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GossipMessage {
    Ping {
        from: NodeId,
        incarnation: u64,
    },

    Ack {
        from: NodeId,
        incarnation: u64,
        members: Vec<Node>,
    },

    Join {
        node: Node,
    },

    Suspect {
        node_id: NodeId,
        incarnation: u64,
    },

    Alive {
        node_id: NodeId,
        incarnation: u64,
    },
}

/// The ordered member list the cache engine plans topologies from.
///
/// Every node derives the same order, so `members[0]` is an agreed coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ClusterView {
    pub view_id: u64,
    pub members: Vec<NodeId>,
}

impl ClusterView {
    pub fn new(view_id: u64, members: Vec<NodeId>) -> Self {
        Self { view_id, members }
    }

    pub fn coordinator(&self) -> Option<&NodeId> {
        self.members.first()
    }

    pub fn is_coordinator(&self, node: &NodeId) -> bool {
        self.coordinator() == Some(node)
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.members.contains(node)
    }
}
