//! Multi-version concurrency control.
//!
//! - [`version`] - version-chained value encoding, visibility and pruning
//! - [`transaction`] - the engine-wide transaction status table
//!
//! Snapshot isolation: a reader captures a start timestamp and sees the
//! newest version committed at or below it, plus its own provisional
//! writes. Deletes append AntiValue tombstones; the cleanup manager prunes
//! versions once no live snapshot can see them.

pub mod transaction;
pub mod version;

pub use transaction::{TransactionIndex, TxnRecord, TxnStatus, WriteRef};
pub use version::{
    provisional_handle, Snapshot, VersionEntry, FLAG_ANTIVALUE, FLAG_LONG_RECORD,
};
