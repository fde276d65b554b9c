//! Historical balances by replay
//!
//! A wallet's balance at an instant is the signed sum of every transaction
//! strictly before it. No index or cache: this is a reporting path.

use crate::{
    money::Money,
    storage::LedgerStore,
    types::{Transaction, WalletId},
    wallet::Wallet,
    Error, Result,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;

/// Replays transaction history
#[derive(Clone)]
pub struct HistoricalBalanceCalculator {
    store: Arc<dyn LedgerStore>,
}

impl std::fmt::Debug for HistoricalBalanceCalculator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoricalBalanceCalculator").finish()
    }
}

impl HistoricalBalanceCalculator {
    /// Calculator over `store`
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Balance of `wallet_id` just before `as_of`
    pub fn historical_balance(&self, wallet_id: &WalletId, as_of: DateTime<Utc>) -> Result<Money> {
        let wallet = self
            .store
            .get_wallet(wallet_id)?
            .ok_or_else(|| Error::WalletNotFound(wallet_id.to_string()))?;

        self.balance_of(&wallet, as_of)
    }

    /// Balance of an already loaded wallet just before `as_of`
    pub fn balance_of(&self, wallet: &Wallet, as_of: DateTime<Utc>) -> Result<Money> {
        let wallet_id = wallet.id();
        let transactions = self.store.query_transactions(wallet_id, as_of)?;
        let balance = replay(&transactions)?;

        tracing::debug!(
            wallet_id = %wallet_id,
            as_of = %as_of,
            transactions = transactions.len(),
            balance = %balance,
            "Historical balance replayed"
        );

        Ok(balance)
    }
}

/// Fold transactions into a balance, in any order
///
/// A negative result means the history itself is inconsistent.
pub fn replay(transactions: &[Transaction]) -> Result<Money> {
    let total = transactions
        .iter()
        .try_fold(Decimal::ZERO, |acc, tx| acc.checked_add(tx.signed_amount()))
        .ok_or_else(|| Error::InvalidAmount("replayed balance overflowed".to_string()))?;

    if total.is_sign_negative() && !total.is_zero() {
        let wallet_id = transactions
            .first()
            .map(|tx| tx.wallet_id.to_string())
            .unwrap_or_default();
        return Err(Error::IntegrityViolation {
            wallet_id,
            detail: format!("replayed balance is negative: {}", total),
        });
    }

    Money::new(total)
}
