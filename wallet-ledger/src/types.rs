//! Core types for the ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Memory safety (no unsafe code)
//! - Exact arithmetic (Decimal-backed [`Money`])

use crate::{money::Money, Error, Result};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Opaque wallet identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WalletId(String);

impl WalletId {
    /// Generate a new random, globally unique id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Address an existing wallet
    pub fn parse(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(Error::InvalidArgument("wallet id cannot be blank".to_string()));
        }
        if id.chars().any(char::is_control) {
            return Err(Error::InvalidArgument(format!(
                "wallet id contains control characters: {:?}",
                id
            )));
        }
        Ok(Self(id))
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for WalletId {
    type Error = Error;

    fn try_from(id: String) -> Result<Self> {
        WalletId::parse(id)
    }
}

impl From<WalletId> for String {
    fn from(id: WalletId) -> Self {
        id.0
    }
}

impl fmt::Display for WalletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction identifier (UUIDv7 for time-ordering)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionId(Uuid);

impl TransactionId {
    /// Generate a new id
    pub fn generate() -> Self {
        Self(crate::crypto::generate_uuid_v7())
    }

    /// Wrap an existing UUID
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of balance-affecting event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TransactionType {
    /// Money added from an external source
    Deposit = 1,
    /// Money removed to an external destination
    Withdrawal = 2,
    /// Money sent to another wallet
    TransferOut = 3,
    /// Money received from another wallet
    TransferIn = 4,
}

impl TransactionType {
    /// Stable upper-case code, also used in hashed payloads
    pub fn code(&self) -> &'static str {
        match self {
            TransactionType::Deposit => "DEPOSIT",
            TransactionType::Withdrawal => "WITHDRAWAL",
            TransactionType::TransferOut => "TRANSFER_OUT",
            TransactionType::TransferIn => "TRANSFER_IN",
        }
    }

    /// Deposits and incoming transfers increase the balance
    pub fn is_credit(&self) -> bool {
        matches!(self, TransactionType::Deposit | TransactionType::TransferIn)
    }

    /// Transfer legs reference a counterparty wallet
    pub fn is_transfer(&self) -> bool {
        matches!(self, TransactionType::TransferOut | TransactionType::TransferIn)
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Who, where and which request caused a balance change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditContext {
    /// Acting user or service
    pub actor: Option<String>,
    /// Caller address
    pub source_ip: Option<String>,
    /// Caller user agent
    pub user_agent: Option<String>,
    /// Correlation id shared by every record of one request
    pub request_id: String,
    /// When the context was captured
    pub timestamp: DateTime<Utc>,
    /// Free-form extra context
    pub additional: BTreeMap<String, String>,
}

impl AuditContext {
    /// Context for one request
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            actor: None,
            source_ip: None,
            user_agent: None,
            request_id: request_id.into(),
            timestamp: Utc::now(),
            additional: BTreeMap::new(),
        }
    }

    /// Context for work initiated by the service itself
    pub fn system(request_id: impl Into<String>) -> Self {
        Self::new(request_id).with_actor("system")
    }

    /// Set the acting user
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Set the caller address
    pub fn with_source_ip(mut self, ip: impl Into<String>) -> Self {
        self.source_ip = Some(ip.into());
        self
    }

    /// Set the caller user agent
    pub fn with_user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = Some(agent.into());
        self
    }

    /// Add one key/value pair of extra context
    pub fn with_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.additional.insert(key.into(), value.into());
        self
    }
}

/// Immutable record of one balance-affecting event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Unique transaction ID
    pub id: TransactionId,

    /// Wallet whose balance changed
    pub wallet_id: WalletId,

    /// Type of event
    pub tx_type: TransactionType,

    /// Amount moved (always positive)
    pub amount: Money,

    /// Counterparty wallet (transfer legs only)
    pub related_wallet_id: Option<WalletId>,

    /// Instant the balance changed
    pub timestamp: DateTime<Utc>,

    /// Request context
    pub context: Option<AuditContext>,
}

impl Transaction {
    fn new(
        wallet_id: WalletId,
        tx_type: TransactionType,
        amount: Money,
        related_wallet_id: Option<WalletId>,
        timestamp: DateTime<Utc>,
        context: Option<AuditContext>,
    ) -> Self {
        Self {
            id: TransactionId::generate(),
            wallet_id,
            tx_type,
            amount,
            related_wallet_id,
            timestamp,
            context,
        }
    }

    /// Deposit into `wallet_id`
    pub fn deposit(
        wallet_id: WalletId,
        amount: Money,
        timestamp: DateTime<Utc>,
        context: Option<AuditContext>,
    ) -> Self {
        Self::new(wallet_id, TransactionType::Deposit, amount, None, timestamp, context)
    }

    /// Withdrawal from `wallet_id`
    pub fn withdrawal(
        wallet_id: WalletId,
        amount: Money,
        timestamp: DateTime<Utc>,
        context: Option<AuditContext>,
    ) -> Self {
        Self::new(wallet_id, TransactionType::Withdrawal, amount, None, timestamp, context)
    }

    /// Outgoing leg of a transfer, recorded on the source wallet
    pub fn transfer_out(
        from: WalletId,
        to: WalletId,
        amount: Money,
        timestamp: DateTime<Utc>,
        context: Option<AuditContext>,
    ) -> Self {
        Self::new(from, TransactionType::TransferOut, amount, Some(to), timestamp, context)
    }

    /// Incoming leg of a transfer, recorded on the destination wallet
    pub fn transfer_in(
        to: WalletId,
        from: WalletId,
        amount: Money,
        timestamp: DateTime<Utc>,
        context: Option<AuditContext>,
    ) -> Self {
        Self::new(to, TransactionType::TransferIn, amount, Some(from), timestamp, context)
    }

    /// Amount with the sign this transaction applies to the balance
    pub fn signed_amount(&self) -> Decimal {
        if self.tx_type.is_credit() {
            self.amount.amount()
        } else {
            -self.amount.amount()
        }
    }

    /// Correlation id, if a context was captured
    pub fn request_id(&self) -> Option<&str> {
        self.context.as_ref().map(|c| c.request_id.as_str())
    }
}

/// Next instant strictly after `previous`, normally "now"
pub fn next_instant(previous: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    if now > previous {
        now
    } else {
        previous + Duration::nanoseconds(1)
    }
}
