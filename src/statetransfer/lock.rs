use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Fences topology installation against primary-side writes.
///
/// Writes that apply under a topology hold the shared side for as long as
/// they apply and replicate; installing a topology takes the exclusive side,
/// so once it is installed no write validated against the old one is still
/// running on this node.
#[derive(Debug, Default)]
pub struct StateTransferLock {
    inner: RwLock<()>,
}

impl StateTransferLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire_shared(&self) -> RwLockReadGuard<'_, ()> {
        self.inner.read().await
    }

    pub async fn acquire_exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.inner.write().await
    }
}
