//! State Transfer Module
//!
//! Moves segment data between nodes when membership changes.
//!
//! ## Flow
//! 1. The coordinator sees a new view and publishes a topology whose `pending`
//!    placement is the balanced target. Writes go to old and new owners alike.
//! 2. Each member pulls the segments it gains from their current owners and
//!    confirms.
//! 3. With every confirmation in, the coordinator publishes the target as the
//!    current placement and members drop the segments they lost.
//!
//! Commands stamped with an older topology than the receiver's fail with
//! `OutdatedTopology` and are retried by the caller against the new one.

pub mod consumer;
pub mod coordinator;
pub mod lock;

pub use consumer::StateConsumer;
pub use coordinator::ClusterTopologyManager;
pub use lock::StateTransferLock;
