use super::DistributionStrategy;
use super::commands::{WriteCommand, WriteResult};
use super::distribution::execute_on_primary;
use crate::cache::registry::CacheComponents;
use crate::container::InternalEntry;
use crate::error::Result;

use async_trait::async_trait;

/// Single-node cache: this node is the primary of every key and has no backups.
pub struct LocalDistribution;

#[async_trait]
impl DistributionStrategy for LocalDistribution {
    async fn read(&self, cache: &CacheComponents, key: &str) -> Result<Option<InternalEntry>> {
        Ok(cache.container.get(key))
    }

    async fn write(&self, cache: &CacheComponents, command: WriteCommand) -> Result<WriteResult> {
        let topology = cache.current_topology().await?;
        execute_on_primary(cache, &command, topology.id).await
    }

    async fn clear(&self, cache: &CacheComponents) -> Result<()> {
        let _exclusive = cache.st_lock.acquire_exclusive().await;
        cache.container.clear();
        Ok(())
    }

    async fn entries(&self, cache: &CacheComponents) -> Result<Vec<InternalEntry>> {
        Ok(cache.container.entries())
    }
}
