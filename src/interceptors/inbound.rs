use super::distribution::{
    execute_on_primary, handle_clear, handle_get, handle_replicate, handle_segment_entries,
};
use crate::cache::registry::CacheComponents;
use crate::error::Result;
use crate::membership::types::NodeId;
use crate::rpc::protocol::{CacheCommand, CacheResponse};
use crate::statetransfer::{consumer, coordinator};
use crate::transaction::table;

use std::sync::Arc;

/// Runs a command received from `origin` (possibly this node) against `cache`.
pub(crate) async fn dispatch(
    cache: &Arc<CacheComponents>,
    origin: NodeId,
    command: CacheCommand,
) -> Result<CacheResponse> {
    cache.ensure_running()?;

    match command {
        CacheCommand::Get { key, topology_id } => handle_get(cache, &key, topology_id).await,
        CacheCommand::ExecuteWrite {
            command,
            topology_id,
        } => execute_on_primary(cache, &command, topology_id)
            .await
            .map(CacheResponse::Write),
        CacheCommand::Replicate { key, mutation } => Ok(handle_replicate(cache, &key, mutation)),
        CacheCommand::Clear => Ok(handle_clear(cache).await),
        CacheCommand::LockKeys {
            tx,
            keys,
            topology_id,
        } => table::handle_lock_keys(cache, origin, tx, keys, topology_id).await,
        CacheCommand::Prepare {
            tx,
            modifications,
            topology_id,
        } => table::handle_prepare(cache, origin, tx, modifications, topology_id).await,
        CacheCommand::Commit { tx } => table::handle_commit(cache, tx).await,
        CacheCommand::Rollback { tx } => Ok(table::handle_rollback(cache, tx)),
        CacheCommand::ReleaseLocks { tx } => Ok(table::handle_release_locks(cache, tx)),
        CacheCommand::TopologyUpdate { topology } => {
            consumer::handle_topology_update(cache, origin, topology).await
        }
        CacheCommand::RebalanceConfirm { topology_id, node } => {
            coordinator::handle_rebalance_confirm(cache, topology_id, node).await
        }
        CacheCommand::TopologyStatus => Ok(coordinator::handle_topology_status(cache)),
        CacheCommand::StateRequest {
            segments,
            topology_id,
        } => consumer::handle_state_request(cache, &segments, topology_id).await,
        CacheCommand::SegmentEntries {
            segments,
            topology_id,
        } => handle_segment_entries(cache, &segments, topology_id).await,
    }
}
