//! Lock Manager Module
//!
//! Per-key exclusive locks taken on a key's primary owner. Non-transactional
//! writes hold a lock for the duration of one write; transactions hold theirs
//! from prepare (optimistic) or from the first write (pessimistic) until commit
//! or rollback. Backups never lock: they apply writes the primary already
//! serialized.

pub mod manager;

pub use manager::{LockManager, LockOwner, LockToken};
