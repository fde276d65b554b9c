//! Wallet Ledger
//!
//! Wallet balances with an append-only transaction log, historical balance
//! replay and a tamper-evident audit trail.
//!
//! # Architecture
//!
//! - **Atomic commits**: A balance change and its transaction record land in
//!   one version-checked store write
//! - **Per-wallet serialization**: Writers to the same wallet never interleave
//! - **Hash chains**: Every transaction is mirrored into a per-wallet chain of
//!   SHA-256 linked audit records
//! - **Async auditing**: Chain appends run on background workers and never fail
//!   the business operation
//!
//! # Invariants
//!
//! - Balances never go negative
//! - Transfers conserve money: the debit equals the credit
//! - Replaying a wallet's transactions yields its balance
//! - Audit records are never modified or deleted

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod audit;
pub mod config;
pub mod crypto;
pub mod error;
pub mod history;
pub mod ledger;
pub mod metrics;
pub mod money;
pub mod scheduler;
pub mod storage;
pub mod types;
pub mod wallet;

// Re-exports
pub use audit::{AuditChainService, AuditRecord, ChainReport, Snapshot};
pub use config::Config;
pub use error::{Error, Result};
pub use ledger::{HistoricalBalance, Ledger, TransferReceipt};
pub use metrics::Metrics;
pub use money::Money;
pub use scheduler::{PassReport, ReconciliationScheduler, SchedulerHandle};
pub use storage::{AuditStore, LedgerStore, MemoryStore, RocksStore};
pub use types::{AuditContext, Transaction, TransactionId, TransactionType, WalletId};
pub use wallet::Wallet;
