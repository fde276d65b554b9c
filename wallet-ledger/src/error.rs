//! Error types for the wallet ledger

use crate::money::Money;
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Non-positive or otherwise unusable amount
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Withdrawal or transfer exceeds the available balance
    #[error("Insufficient funds in wallet {wallet_id}: balance {balance}, requested {requested}")]
    InsufficientFunds {
        /// Wallet that was debited
        wallet_id: String,
        /// Balance at the time of the attempt
        balance: Money,
        /// Requested amount
        requested: Money,
    },

    /// Unknown wallet id
    #[error("Wallet not found: {0}")]
    WalletNotFound(String),

    /// Owner already has a wallet
    #[error("Owner already has a wallet: {0}")]
    DuplicateOwner(String),

    /// Malformed request (blank ids, self-transfer, ...)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Atomic write rejected by the store (transient, caller may retry)
    #[error("Commit failure: {0}")]
    CommitFailure(String),

    /// Audit append or snapshot failed (never surfaced to business callers)
    #[error("Audit failure: {0}")]
    AuditFailure(String),

    /// Audit chain verification found a break
    #[error("Integrity violation in wallet {wallet_id}: {detail}")]
    IntegrityViolation {
        /// Wallet whose chain is broken
        wallet_id: String,
        /// Break point description
        detail: String,
    },

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Concurrency error (worker mailbox closed, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Business-rule violations are returned to the caller and never mutate state.
    pub fn is_business_rule(&self) -> bool {
        matches!(
            self,
            Error::InvalidAmount(_)
                | Error::InsufficientFunds { .. }
                | Error::WalletNotFound(_)
                | Error::DuplicateOwner(_)
                | Error::InvalidArgument(_)
        )
    }

    /// Transient errors may succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::CommitFailure(_) | Error::Storage(_) | Error::Io(_))
    }

    /// Short label used for metrics and log fields
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidAmount(_) => "invalid_amount",
            Error::InsufficientFunds { .. } => "insufficient_funds",
            Error::WalletNotFound(_) => "wallet_not_found",
            Error::DuplicateOwner(_) => "duplicate_owner",
            Error::InvalidArgument(_) => "invalid_argument",
            Error::CommitFailure(_) => "commit_failure",
            Error::AuditFailure(_) => "audit_failure",
            Error::IntegrityViolation { .. } => "integrity_violation",
            Error::Storage(_) => "storage",
            Error::Serialization(_) => "serialization",
            Error::Concurrency(_) => "concurrency",
            Error::Config(_) => "config",
            Error::Io(_) => "io",
        }
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}
