//! Transaction Module
//!
//! Two-phase commit across the primary owners of the keys a transaction writes.
//!
//! ## States
//! `Active -> Preparing -> Prepared -> Committing -> Committed`, or
//! `RollingBack -> RolledBack` from any non-terminal state.
//!
//! ## Components
//! - [`context::TransactionContext`]: reads, buffered writes and lock owners of
//!   one transaction on its originating node.
//! - [`coordinator::LocalTransaction`]: originator handle driving the protocol.
//! - [`table::TransactionTable`]: per-owner record of transactions holding
//!   locks or prepared modifications there.
//!
//! Optimistic transactions lock at prepare, in segment order, and validate the
//! versions their decisions depended on. Pessimistic transactions lock each key
//! on its primary when they first write it.

pub mod context;
pub mod coordinator;
pub mod table;

pub use context::{GlobalTxId, TransactionContext, TxState};
pub use coordinator::LocalTransaction;
pub use table::TransactionTable;
