//! Tamper-evident audit trail
//!
//! Every committed transaction is mirrored into a per-wallet hash chain:
//! each [`AuditRecord`] embeds the `current_hash` of its predecessor, so
//! editing, inserting or removing a record breaks recomputation from that
//! point on. Wallet balances are additionally captured as [`Snapshot`]s for
//! reconciliation.
//!
//! Appends run off the business path through the [`AuditDispatcher`]; the
//! [`TipCache`] keeps the running end of each chain so an append costs one
//! store write.

mod chain;
mod dispatcher;
mod record;
mod tip_cache;

pub use chain::{verify_records, AuditChainService, BreakKind, ChainBreak, ChainReport};
pub use dispatcher::{AuditDispatcher, AuditTask};
pub use record::{AuditRecord, ChainTip, Snapshot};
pub use tip_cache::{TipCache, TipSlot};

#[cfg(test)]
pub(crate) use chain::tests::FlakyAuditStore;
