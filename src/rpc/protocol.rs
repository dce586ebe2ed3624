//! Cache RPC Protocol
//!
//! Every inter-node message is an [`RpcEnvelope`] naming the origin node and the
//! target cache. The reply is a `Result`, so a remote [`CacheError`] reaches the
//! caller unchanged. Envelopes travel as JSON: values are `serde_json::Value`.

use crate::container::InternalEntry;
use crate::distribution::CacheTopology;
use crate::error::CacheError;
use crate::interceptors::commands::{Modification, Mutation, WriteCommand, WriteResult};
use crate::membership::types::NodeId;
use crate::transaction::GlobalTxId;

use serde::{Deserialize, Serialize};

// --- API Endpoints ---

/// Internal endpoint carrying every inter-node cache command.
pub const ENDPOINT_RPC: &str = "/internal/rpc";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcEnvelope {
    pub origin: NodeId,
    pub cache: String,
    pub command: CacheCommand,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CacheCommand {
    /// Read a key from an owner.
    Get { key: String, topology_id: u64 },
    /// Run a write on the key's primary owner.
    ExecuteWrite {
        command: WriteCommand,
        topology_id: u64,
    },
    /// Apply a validated write on a backup owner.
    Replicate { key: String, mutation: Mutation },
    /// Clear the receiver's local data container.
    Clear,
    /// Eagerly lock keys on their primary for a pessimistic transaction.
    LockKeys {
        tx: GlobalTxId,
        keys: Vec<String>,
        topology_id: u64,
    },
    Prepare {
        tx: GlobalTxId,
        modifications: Vec<Modification>,
        topology_id: u64,
    },
    Commit { tx: GlobalTxId },
    /// Final rollback. Later prepares for the transaction are refused.
    Rollback { tx: GlobalTxId },
    /// Drop prepared state and locks so the transaction can prepare again.
    ReleaseLocks { tx: GlobalTxId },
    TopologyUpdate { topology: CacheTopology },
    /// A member finished fetching the segments it gains in `topology_id`.
    RebalanceConfirm { topology_id: u64, node: NodeId },
    /// Ask a member for its installed topology.
    TopologyStatus,
    /// Pull the entries of segments the requester is gaining.
    StateRequest { segments: Vec<u32>, topology_id: u64 },
    /// Read the entries of segments the receiver owns.
    SegmentEntries { segments: Vec<u32>, topology_id: u64 },
}

impl CacheCommand {
    pub fn name(&self) -> &'static str {
        match self {
            CacheCommand::Get { .. } => "Get",
            CacheCommand::ExecuteWrite { .. } => "ExecuteWrite",
            CacheCommand::Replicate { .. } => "Replicate",
            CacheCommand::Clear => "Clear",
            CacheCommand::LockKeys { .. } => "LockKeys",
            CacheCommand::Prepare { .. } => "Prepare",
            CacheCommand::Commit { .. } => "Commit",
            CacheCommand::Rollback { .. } => "Rollback",
            CacheCommand::ReleaseLocks { .. } => "ReleaseLocks",
            CacheCommand::TopologyUpdate { .. } => "TopologyUpdate",
            CacheCommand::RebalanceConfirm { .. } => "RebalanceConfirm",
            CacheCommand::TopologyStatus => "TopologyStatus",
            CacheCommand::StateRequest { .. } => "StateRequest",
            CacheCommand::SegmentEntries { .. } => "SegmentEntries",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CacheResponse {
    Ack,
    Entry(Option<InternalEntry>),
    Write(WriteResult),
    /// Keys locked for a pessimistic transaction, with their current entries.
    Locked(Vec<(String, Option<InternalEntry>)>),
    Prepared,
    Topology(Option<CacheTopology>),
    Entries(Vec<InternalEntry>),
}

/// Body of an RPC reply.
pub type RpcReply = Result<CacheResponse, CacheError>;
