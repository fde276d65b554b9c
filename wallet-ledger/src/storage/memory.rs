//! In-memory store

use super::{check_distinct_wallets, check_wallet_write, AuditStore, LedgerStore, WriteItem};
use crate::{
    audit::{AuditRecord, Snapshot},
    types::{Transaction, WalletId},
    wallet::Wallet,
    Error, Result,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

/// Both ports backed by maps behind one lock
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    wallets: BTreeMap<WalletId, Wallet>,
    owners: HashMap<String, WalletId>,
    transactions: HashMap<WalletId, Vec<Transaction>>,
    audit: HashMap<WalletId, Vec<AuditRecord>>,
    snapshots: HashMap<WalletId, Vec<Snapshot>>,
}

impl MemoryStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl LedgerStore for MemoryStore {
    fn put_wallet(&self, wallet: &Wallet) -> Result<()> {
        let mut inner = self.inner.write();
        inner
            .owners
            .insert(wallet.owner_id().to_string(), wallet.id().clone());
        inner.wallets.insert(wallet.id().clone(), wallet.clone());
        Ok(())
    }

    fn get_wallet(&self, wallet_id: &WalletId) -> Result<Option<Wallet>> {
        Ok(self.inner.read().wallets.get(wallet_id).cloned())
    }

    fn get_wallet_by_owner(&self, owner_id: &str) -> Result<Option<Wallet>> {
        let inner = self.inner.read();
        Ok(inner
            .owners
            .get(owner_id)
            .and_then(|id| inner.wallets.get(id))
            .cloned())
    }

    fn atomic_write(&self, items: &[WriteItem]) -> Result<()> {
        check_distinct_wallets(items)?;

        let mut inner = self.inner.write();

        // Validate everything before touching anything; owners claimed
        // earlier in this write count as taken
        let mut claimed: HashMap<&str, &WalletId> = HashMap::new();
        for item in items {
            if let WriteItem::Wallet(wallet) = item {
                let holder = claimed
                    .get(wallet.owner_id())
                    .copied()
                    .or_else(|| inner.owners.get(wallet.owner_id()));
                check_wallet_write(wallet, inner.wallets.get(wallet.id()), holder)?;
                claimed.insert(wallet.owner_id(), wallet.id());
            }
        }

        for item in items {
            match item {
                WriteItem::Wallet(wallet) => {
                    inner
                        .owners
                        .insert(wallet.owner_id().to_string(), wallet.id().clone());
                    inner.wallets.insert(wallet.id().clone(), wallet.committed());
                }
                WriteItem::Transaction(tx) => {
                    inner
                        .transactions
                        .entry(tx.wallet_id.clone())
                        .or_default()
                        .push(tx.clone());
                }
            }
        }

        Ok(())
    }

    fn query_transactions(
        &self,
        wallet_id: &WalletId,
        before: DateTime<Utc>,
    ) -> Result<Vec<Transaction>> {
        let inner = self.inner.read();
        let mut txs: Vec<Transaction> = inner
            .transactions
            .get(wallet_id)
            .map(|txs| txs.iter().filter(|tx| tx.timestamp < before).cloned().collect())
            .unwrap_or_default();
        txs.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
        Ok(txs)
    }

    fn scan_wallets(&self, limit: usize) -> Result<Vec<Wallet>> {
        Ok(self
            .inner
            .read()
            .wallets
            .values()
            .take(limit)
            .cloned()
            .collect())
    }
}

impl AuditStore for MemoryStore {
    fn append_audit_record(&self, record: &AuditRecord) -> Result<()> {
        let mut inner = self.inner.write();
        let chain = inner.audit.entry(record.wallet_id.clone()).or_default();

        if chain.iter().any(|r| r.sequence == record.sequence) {
            return Err(Error::Storage(format!(
                "audit record {} already exists for wallet {}",
                record.sequence, record.wallet_id
            )));
        }

        chain.push(record.clone());
        chain.sort_by_key(|r| r.sequence);
        Ok(())
    }

    fn append_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        self.inner
            .write()
            .snapshots
            .entry(snapshot.wallet_id.clone())
            .or_default()
            .push(snapshot.clone());
        Ok(())
    }

    fn query_audit_records(&self, wallet_id: &WalletId) -> Result<Vec<AuditRecord>> {
        Ok(self
            .inner
            .read()
            .audit
            .get(wallet_id)
            .cloned()
            .unwrap_or_default())
    }

    fn query_snapshots(&self, wallet_id: &WalletId) -> Result<Vec<Snapshot>> {
        Ok(self
            .inner
            .read()
            .snapshots
            .get(wallet_id)
            .cloned()
            .unwrap_or_default())
    }

    fn latest_audit_record(&self, wallet_id: &WalletId) -> Result<Option<AuditRecord>> {
        Ok(self
            .inner
            .read()
            .audit
            .get(wallet_id)
            .and_then(|chain| chain.last().cloned()))
    }
}
