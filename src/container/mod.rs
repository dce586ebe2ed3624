//! Data Container Module
//!
//! Per-node in-memory entry storage. Entries are grouped by segment, carry the
//! version stamp of the write that produced them and optional expiration
//! metadata (lifespan and max-idle).
//!
//! The container itself takes no locks beyond its maps' shards and, when
//! bounded, its eviction order: callers serialize writes to a key through the
//! primary owner's lock manager, and backups apply writes with
//! [`store::DataContainer::put_if_newer`].

pub mod entry;
pub mod eviction;
pub mod store;

pub use entry::{EntryVersion, InternalEntry, Metadata, VersionGenerator};
pub use store::DataContainer;
