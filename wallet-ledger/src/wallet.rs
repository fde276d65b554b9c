//! Wallet aggregate
//!
//! A wallet holds exactly one owner's balance. Mutations happen in memory
//! only; persisting them is the caller's job (see [`crate::Ledger`]).

use crate::{
    money::Money,
    types::{next_instant, WalletId},
    Error, Result,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Aggregate root for one owner's balance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    id: WalletId,
    owner_id: String,
    balance: Money,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    /// Number of committed writes, used as the store's write condition
    version: u64,
}

impl Wallet {
    /// New wallet with a generated id and zero balance
    pub fn open(owner_id: impl Into<String>) -> Result<Self> {
        let owner_id = owner_id.into();
        if owner_id.trim().is_empty() {
            return Err(Error::InvalidArgument("owner id cannot be blank".to_string()));
        }

        let now = Utc::now();
        Ok(Self {
            id: WalletId::generate(),
            owner_id,
            balance: Money::zero(),
            created_at: now,
            updated_at: now,
            version: 0,
        })
    }

    /// Rebuild a wallet from persisted fields
    pub fn restore(
        id: WalletId,
        owner_id: String,
        balance: Money,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
        version: u64,
    ) -> Self {
        Self {
            id,
            owner_id,
            balance,
            created_at,
            updated_at,
            version,
        }
    }

    /// Add a positive amount
    pub fn deposit(&mut self, amount: Money) -> Result<()> {
        if !amount.is_positive() {
            return Err(Error::InvalidAmount(format!(
                "deposit amount must be positive, got {}",
                amount
            )));
        }

        self.balance = self.balance.checked_add(amount)?;
        self.updated_at = next_instant(self.updated_at);
        Ok(())
    }

    /// Remove a positive amount no larger than the balance
    pub fn withdraw(&mut self, amount: Money) -> Result<()> {
        if !amount.is_positive() {
            return Err(Error::InvalidAmount(format!(
                "withdrawal amount must be positive, got {}",
                amount
            )));
        }
        if amount > self.balance {
            return Err(Error::InsufficientFunds {
                wallet_id: self.id.to_string(),
                balance: self.balance,
                requested: amount,
            });
        }

        self.balance = self.balance.checked_sub(amount)?;
        self.updated_at = next_instant(self.updated_at);
        Ok(())
    }

    /// The state a store persists after accepting this wallet in an atomic write
    pub fn committed(&self) -> Wallet {
        let mut next = self.clone();
        next.version += 1;
        next
    }

    /// Wallet id
    pub fn id(&self) -> &WalletId {
        &self.id
    }

    /// Owning user
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Current balance
    pub fn balance(&self) -> Money {
        self.balance
    }

    /// Creation time
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Last balance change (or creation)
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Committed write count
    pub fn version(&self) -> u64 {
        self.version
    }
}
