//! Storage ports and their implementations
//!
//! The ledger consumes two ports:
//!
//! - [`LedgerStore`] - wallets and transactions, with an all-or-nothing
//!   multi-item write
//! - [`AuditStore`] - append-only audit records and snapshots
//!
//! Both are implemented by [`MemoryStore`] (tests, embedding) and
//! [`RocksStore`] (RocksDB column families).
//!
//! # Write conditions
//!
//! Every wallet in an [`LedgerStore::atomic_write`] is conditioned on the
//! version it was read at. The store persists [`Wallet::committed`] on
//! success and rejects the whole write with [`Error::CommitFailure`] when any
//! version moved underneath the caller.

mod memory;
mod rocks;

pub use memory::MemoryStore;
pub use rocks::RocksStore;

use crate::{
    audit::{AuditRecord, Snapshot},
    types::{Transaction, WalletId},
    wallet::Wallet,
    Error, Result,
};
use chrono::{DateTime, Utc};
use std::collections::HashSet;

/// One element of an atomic multi-item write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteItem {
    /// Wallet state, conditioned on its version
    Wallet(Wallet),
    /// New transaction record
    Transaction(Transaction),
}

/// Wallet and transaction persistence
pub trait LedgerStore: Send + Sync {
    /// Unconditional upsert of a wallet exactly as given
    fn put_wallet(&self, wallet: &Wallet) -> Result<()>;

    /// Point lookup
    fn get_wallet(&self, wallet_id: &WalletId) -> Result<Option<Wallet>>;

    /// Lookup through the owner index
    fn get_wallet_by_owner(&self, owner_id: &str) -> Result<Option<Wallet>>;

    /// Commit all items or none
    fn atomic_write(&self, items: &[WriteItem]) -> Result<()>;

    /// Transactions of one wallet with `timestamp < before`, oldest first
    fn query_transactions(
        &self,
        wallet_id: &WalletId,
        before: DateTime<Utc>,
    ) -> Result<Vec<Transaction>>;

    /// Up to `limit` wallets in a stable order
    fn scan_wallets(&self, limit: usize) -> Result<Vec<Wallet>>;
}

/// Append-only audit persistence
pub trait AuditStore: Send + Sync {
    /// Append one record; a record at an occupied sequence is rejected
    fn append_audit_record(&self, record: &AuditRecord) -> Result<()>;

    /// Append one snapshot
    fn append_snapshot(&self, snapshot: &Snapshot) -> Result<()>;

    /// Every record of one wallet, ordered by sequence
    fn query_audit_records(&self, wallet_id: &WalletId) -> Result<Vec<AuditRecord>>;

    /// Every snapshot of one wallet, oldest first
    fn query_snapshots(&self, wallet_id: &WalletId) -> Result<Vec<Snapshot>>;

    /// Newest record of one wallet
    fn latest_audit_record(&self, wallet_id: &WalletId) -> Result<Option<AuditRecord>> {
        Ok(self.query_audit_records(wallet_id)?.pop())
    }
}

/// Check one wallet write against the stored state and the owner index
pub(crate) fn check_wallet_write(
    wallet: &Wallet,
    stored: Option<&Wallet>,
    owner_holder: Option<&WalletId>,
) -> Result<()> {
    match stored {
        Some(stored) if stored.version() != wallet.version() => {
            return Err(Error::CommitFailure(format!(
                "wallet {} changed concurrently: read version {}, stored version {}",
                wallet.id(),
                wallet.version(),
                stored.version()
            )));
        }
        None if wallet.version() != 0 => {
            return Err(Error::CommitFailure(format!(
                "wallet {} is not stored",
                wallet.id()
            )));
        }
        _ => {}
    }

    if let Some(holder) = owner_holder {
        if holder != wallet.id() {
            return Err(Error::DuplicateOwner(wallet.owner_id().to_string()));
        }
    }

    Ok(())
}

/// A write may touch each wallet at most once
pub(crate) fn check_distinct_wallets(items: &[WriteItem]) -> Result<()> {
    let mut seen = HashSet::new();
    for item in items {
        if let WriteItem::Wallet(wallet) = item {
            if !seen.insert(wallet.id()) {
                return Err(Error::CommitFailure(format!(
                    "wallet {} appears twice in one write",
                    wallet.id()
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Shared behavioural checks run against every store

    use super::*;
    use crate::types::{AuditContext, Transaction};
    use chrono::Duration;

    pub fn money(s: &str) -> crate::money::Money {
        s.parse().unwrap()
    }

    pub fn create<S: LedgerStore>(store: &S, owner: &str) -> Wallet {
        let wallet = Wallet::open(owner).unwrap();
        store
            .atomic_write(&[WriteItem::Wallet(wallet.clone())])
            .unwrap();
        store.get_wallet(wallet.id()).unwrap().unwrap()
    }

    pub fn check_create_and_lookup<S: LedgerStore>(store: &S) {
        let wallet = create(store, "u1");
        assert_eq!(wallet.version(), 1);
        assert_eq!(
            store.get_wallet_by_owner("u1").unwrap().unwrap().id(),
            wallet.id()
        );
        assert!(store.get_wallet_by_owner("u2").unwrap().is_none());
        assert!(store
            .get_wallet(&WalletId::parse("missing").unwrap())
            .unwrap()
            .is_none());
    }

    pub fn check_version_conflict<S: LedgerStore>(store: &S) {
        let wallet = create(store, "u1");

        let mut first = wallet.clone();
        first.deposit(money("10")).unwrap();
        store.atomic_write(&[WriteItem::Wallet(first)]).unwrap();

        // Second writer read the same version
        let mut stale = wallet;
        stale.deposit(money("20")).unwrap();
        let tx = Transaction::deposit(stale.id().clone(), money("20"), stale.updated_at(), None);
        let err = store
            .atomic_write(&[WriteItem::Wallet(stale.clone()), WriteItem::Transaction(tx)])
            .unwrap_err();
        assert!(matches!(err, Error::CommitFailure(_)));

        // Nothing of the rejected write is visible
        let stored = store.get_wallet(stale.id()).unwrap().unwrap();
        assert_eq!(stored.balance(), money("10"));
        assert!(store
            .query_transactions(stale.id(), Utc::now() + Duration::days(1))
            .unwrap()
            .is_empty());
    }

    pub fn check_duplicate_owner<S: LedgerStore>(store: &S) {
        create(store, "u1");
        let twin = Wallet::open("u1").unwrap();
        let err = store.atomic_write(&[WriteItem::Wallet(twin)]).unwrap_err();
        assert!(matches!(err, Error::DuplicateOwner(_)));
    }

    pub fn check_duplicate_owner_in_one_write<S: LedgerStore>(store: &S) {
        let first = Wallet::open("shared").unwrap();
        let second = Wallet::open("shared").unwrap();
        let err = store
            .atomic_write(&[
                WriteItem::Wallet(first.clone()),
                WriteItem::Wallet(second.clone()),
            ])
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateOwner(_)));

        // Nothing from the rejected write is visible
        assert!(store.get_wallet(first.id()).unwrap().is_none());
        assert!(store.get_wallet(second.id()).unwrap().is_none());
        assert!(store.get_wallet_by_owner("shared").unwrap().is_none());

        // The owner is still free
        let wallet = create(store, "shared");
        assert_eq!(store.get_wallet_by_owner("shared").unwrap(), Some(wallet));
    }

    pub fn check_transfer_write<S: LedgerStore>(store: &S) {
        let mut a = create(store, "u1");
        let mut b = create(store, "u2");
        a.deposit(money("100")).unwrap();
        store.atomic_write(&[WriteItem::Wallet(a.clone())]).unwrap();
        let mut a = store.get_wallet(a.id()).unwrap().unwrap();

        a.withdraw(money("40")).unwrap();
        b.deposit(money("40")).unwrap();
        let ctx = AuditContext::new("transfer-1");
        let out = Transaction::transfer_out(
            a.id().clone(),
            b.id().clone(),
            money("40"),
            a.updated_at(),
            Some(ctx.clone()),
        );
        let inc = Transaction::transfer_in(
            b.id().clone(),
            a.id().clone(),
            money("40"),
            b.updated_at(),
            Some(ctx),
        );
        store
            .atomic_write(&[
                WriteItem::Wallet(a.clone()),
                WriteItem::Wallet(b.clone()),
                WriteItem::Transaction(out.clone()),
                WriteItem::Transaction(inc.clone()),
            ])
            .unwrap();

        let far = Utc::now() + Duration::days(1);
        assert_eq!(store.get_wallet(a.id()).unwrap().unwrap().balance(), money("60"));
        assert_eq!(store.get_wallet(b.id()).unwrap().unwrap().balance(), money("40"));
        assert_eq!(store.query_transactions(a.id(), far).unwrap(), vec![out]);
        assert_eq!(store.query_transactions(b.id(), far).unwrap(), vec![inc]);
    }

    pub fn check_query_before<S: LedgerStore>(store: &S) {
        let mut wallet = create(store, "u1");
        let mut stamps = Vec::new();
        for amount in ["1", "2", "3"] {
            wallet.deposit(money(amount)).unwrap();
            let tx =
                Transaction::deposit(wallet.id().clone(), money(amount), wallet.updated_at(), None);
            stamps.push(tx.timestamp);
            store
                .atomic_write(&[WriteItem::Wallet(wallet.clone()), WriteItem::Transaction(tx)])
                .unwrap();
            wallet = wallet.committed();
        }

        let before_third = store.query_transactions(wallet.id(), stamps[2]).unwrap();
        assert_eq!(before_third.len(), 2);
        assert!(before_third[0].timestamp < before_third[1].timestamp);

        // Strictly before
        assert!(store.query_transactions(wallet.id(), stamps[0]).unwrap().is_empty());
    }

    pub fn check_scan<S: LedgerStore>(store: &S) {
        for i in 0..5 {
            create(store, &format!("owner-{}", i));
        }
        assert_eq!(store.scan_wallets(3).unwrap().len(), 3);
        assert_eq!(store.scan_wallets(10).unwrap().len(), 5);
        assert_eq!(store.scan_wallets(3).unwrap(), store.scan_wallets(3).unwrap());
    }

    pub fn check_put_wallet<S: LedgerStore>(store: &S) {
        let wallet = Wallet::open("u9").unwrap();
        store.put_wallet(&wallet).unwrap();
        let stored = store.get_wallet(wallet.id()).unwrap().unwrap();
        assert_eq!(stored, wallet);
        assert_eq!(store.get_wallet_by_owner("u9").unwrap().unwrap(), wallet);
    }

    pub fn check_audit_append<S: AuditStore>(store: &S) {
        use crate::audit::AuditRecord;

        let wallet_id = WalletId::generate();
        assert!(store.latest_audit_record(&wallet_id).unwrap().is_none());

        let mut tip = None;
        let mut records = Vec::new();
        for amount in ["1", "2", "3"] {
            let tx = Transaction::deposit(wallet_id.clone(), money(amount), Utc::now(), None);
            let record = AuditRecord::link(&tx, None, tip.as_ref());
            store.append_audit_record(&record).unwrap();
            tip = Some(record.tip());
            records.push(record);
        }

        assert_eq!(store.query_audit_records(&wallet_id).unwrap(), records);
        assert_eq!(
            store.latest_audit_record(&wallet_id).unwrap().as_ref(),
            records.last()
        );

        // Sequence already taken
        assert!(store.append_audit_record(&records[1]).is_err());
        assert_eq!(store.query_audit_records(&wallet_id).unwrap().len(), 3);
    }

    pub fn check_snapshots<S: AuditStore>(store: &S) {
        let wallet = Wallet::open("u1").unwrap();
        let first = Snapshot::capture(&wallet, None);
        let second = Snapshot::capture(&wallet, Some(&AuditContext::system("snap")));
        store.append_snapshot(&first).unwrap();
        store.append_snapshot(&second).unwrap();

        let stored = store.query_snapshots(wallet.id()).unwrap();
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().all(Snapshot::verify_hash));
        assert!(store
            .query_snapshots(&WalletId::generate())
            .unwrap()
            .is_empty());
    }
}
