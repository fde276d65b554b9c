//! Main ledger orchestration layer
//!
//! This module ties together storage, the wallet aggregate, history replay
//! and the audit chain into the API exposed to callers.
//!
//! # Write path
//!
//! 1. Lock the wallet(s) involved (transfers lock both, in id order)
//! 2. Load, mutate in memory, build the transaction record(s)
//! 3. Commit wallets and transactions in one atomic write
//! 4. Hand the transactions to the audit dispatcher and return
//!
//! Any error before step 3 completes leaves the store untouched. Audit
//! problems after step 3 are never reported to the caller.
//!
//! # Example
//!
//! ```no_run
//! use wallet_ledger::{Config, Ledger, Money};
//!
//! #[tokio::main]
//! async fn main() -> wallet_ledger::Result<()> {
//!     let ledger = Ledger::open(&Config::default())?;
//!
//!     let alice = ledger.create_wallet("alice")?;
//!     let bob = ledger.create_wallet("bob")?;
//!     ledger.deposit(alice.id(), "500.00".parse::<Money>()?)?;
//!     ledger.transfer(alice.id(), bob.id(), "150.00".parse::<Money>()?)?;
//!
//!     ledger.shutdown().await
//! }
//! ```

use crate::{
    audit::{AuditChainService, AuditDispatcher, ChainReport},
    config::{AuditConfig, Config},
    crypto::KeyPair,
    history::HistoricalBalanceCalculator,
    metrics::Metrics,
    money::Money,
    storage::{AuditStore, LedgerStore, RocksStore, WriteItem},
    types::{AuditContext, Transaction, WalletId},
    wallet::Wallet,
    Error, Result,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Result of a committed transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReceipt {
    /// Source wallet after the transfer
    pub source: Wallet,
    /// Destination wallet after the transfer
    pub destination: Wallet,
    /// `TRANSFER_OUT` leg recorded on the source
    pub debit: Transaction,
    /// `TRANSFER_IN` leg recorded on the destination
    pub credit: Transaction,
}

/// Balance of a wallet as of a past instant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoricalBalance {
    /// Wallet
    pub wallet_id: WalletId,
    /// Its owner
    pub owner_id: String,
    /// Replayed balance
    pub balance: Money,
    /// Exclusive upper bound of the replay
    pub as_of: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
enum Movement {
    Deposit,
    Withdrawal,
}

impl Movement {
    fn name(self) -> &'static str {
        match self {
            Movement::Deposit => "deposit",
            Movement::Withdrawal => "withdrawal",
        }
    }
}

/// One mutex per wallet in use
///
/// An entry lives only while some caller holds or waits for it, so ids that
/// never resolve to a wallet do not accumulate.
#[derive(Debug, Default)]
struct WalletLocks {
    locks: DashMap<WalletId, Arc<Mutex<()>>>,
}

impl WalletLocks {
    /// Run `f` holding the locks of every wallet in `ids`, taken in id order
    fn with_locked<T>(&self, ids: &[&WalletId], f: impl FnOnce() -> T) -> T {
        let mut ids = ids.to_vec();
        ids.sort();
        ids.dedup();

        let handles: Vec<Arc<Mutex<()>>> = ids
            .iter()
            .map(|id| self.locks.entry((*id).clone()).or_default().clone())
            .collect();

        let result = {
            let _guards: Vec<_> = handles.iter().map(|lock| lock.lock()).collect();
            f()
        };
        drop(handles);

        // Only the table's own reference left: nobody holds or waits
        for id in ids {
            self.locks.remove_if(id, |_, lock| Arc::strong_count(lock) == 1);
        }

        result
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.len()
    }
}

/// Main ledger interface
pub struct Ledger {
    /// Wallet and transaction store
    store: Arc<dyn LedgerStore>,

    /// Audit chain (shared with the workers and the scheduler)
    audit: Arc<AuditChainService>,

    /// Fire-and-forget audit queue
    dispatcher: AuditDispatcher,

    /// Audit worker tasks, awaited on shutdown
    workers: Mutex<Vec<JoinHandle<()>>>,

    /// Replay engine
    history: HistoricalBalanceCalculator,

    /// Per-wallet write serialization
    locks: WalletLocks,

    /// Serializes the owner uniqueness check with wallet creation
    create_lock: Mutex<()>,

    metrics: Metrics,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("audit", &self.audit)
            .field("audit_workers", &self.dispatcher.workers())
            .finish()
    }
}

impl Ledger {
    /// Open a RocksDB-backed ledger
    ///
    /// Spawns the audit workers, so it must be called inside a tokio runtime.
    pub fn open(config: &Config) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(RocksStore::open(config)?);
        let metrics = Metrics::new()
            .map_err(|e| Error::Config(format!("Failed to create metrics: {}", e)))?;

        Self::with_store(store.clone(), store, &config.audit, metrics)
    }

    /// Build a ledger over explicit stores
    ///
    /// Spawns the audit workers, so it must be called inside a tokio runtime.
    pub fn with_store(
        store: Arc<dyn LedgerStore>,
        audit_store: Arc<dyn AuditStore>,
        audit_config: &AuditConfig,
        metrics: Metrics,
    ) -> Result<Self> {
        let mut service = AuditChainService::new(audit_store, metrics.clone())
            .with_snapshots(audit_config.snapshot_enabled);
        if let Some(seed) = &audit_config.signing_seed {
            service = service.with_keypair(KeyPair::from_hex_seed(seed)?);
        }
        let audit = Arc::new(service);

        let (dispatcher, workers) = AuditDispatcher::spawn(
            audit.clone(),
            audit_config.workers,
            audit_config.queue_capacity,
            metrics.clone(),
        );

        Ok(Self {
            history: HistoricalBalanceCalculator::new(store.clone()),
            store,
            audit,
            dispatcher,
            workers: Mutex::new(workers),
            locks: WalletLocks::default(),
            create_lock: Mutex::new(()),
            metrics,
        })
    }

    /// Create a wallet with zero balance for an owner that has none
    pub fn create_wallet(&self, owner_id: &str) -> Result<Wallet> {
        let _timer = self.metrics.start_timer("create_wallet");

        let result = (|| -> Result<Wallet> {
            let _guard = self.create_lock.lock();

            if self.store.get_wallet_by_owner(owner_id)?.is_some() {
                return Err(Error::DuplicateOwner(owner_id.to_string()));
            }

            let wallet = Wallet::open(owner_id)?;
            self.commit(&[WriteItem::Wallet(wallet.clone())])?;
            Ok(wallet.committed())
        })();

        let wallet = self.observe("create_wallet", result)?;
        self.metrics.wallets_created.inc();
        tracing::info!(wallet_id = %wallet.id(), owner_id, "Wallet created");
        Ok(wallet)
    }

    /// Current state of a wallet
    pub fn get_wallet(&self, wallet_id: &WalletId) -> Result<Wallet> {
        self.store
            .get_wallet(wallet_id)?
            .ok_or_else(|| Error::WalletNotFound(wallet_id.to_string()))
    }

    /// Deposit with a generated request context
    pub fn deposit(&self, wallet_id: &WalletId, amount: Money) -> Result<Wallet> {
        let context = AuditContext::new(request_id("deposit", &[wallet_id]));
        self.deposit_with_context(wallet_id, amount, context)
    }

    /// Deposit with a caller-supplied request context
    pub fn deposit_with_context(
        &self,
        wallet_id: &WalletId,
        amount: Money,
        context: AuditContext,
    ) -> Result<Wallet> {
        self.apply(Movement::Deposit, wallet_id, amount, context)
    }

    /// Withdrawal with a generated request context
    pub fn withdraw(&self, wallet_id: &WalletId, amount: Money) -> Result<Wallet> {
        let context = AuditContext::new(request_id("withdrawal", &[wallet_id]));
        self.withdraw_with_context(wallet_id, amount, context)
    }

    /// Withdrawal with a caller-supplied request context
    pub fn withdraw_with_context(
        &self,
        wallet_id: &WalletId,
        amount: Money,
        context: AuditContext,
    ) -> Result<Wallet> {
        self.apply(Movement::Withdrawal, wallet_id, amount, context)
    }

    fn apply(
        &self,
        movement: Movement,
        wallet_id: &WalletId,
        amount: Money,
        context: AuditContext,
    ) -> Result<Wallet> {
        let _timer = self.metrics.start_timer(movement.name());

        let (wallet, tx) = self.locks.with_locked(&[wallet_id], || {
            let result = (|| -> Result<(Wallet, Transaction)> {
                let mut wallet = self.get_wallet(wallet_id)?;

                let tx = match movement {
                    Movement::Deposit => {
                        wallet.deposit(amount)?;
                        Transaction::deposit(
                            wallet.id().clone(),
                            amount,
                            wallet.updated_at(),
                            Some(context),
                        )
                    }
                    Movement::Withdrawal => {
                        wallet.withdraw(amount)?;
                        Transaction::withdrawal(
                            wallet.id().clone(),
                            amount,
                            wallet.updated_at(),
                            Some(context),
                        )
                    }
                };

                self.commit(&[
                    WriteItem::Wallet(wallet.clone()),
                    WriteItem::Transaction(tx.clone()),
                ])?;
                Ok((wallet.committed(), tx))
            })();

            let (wallet, tx) = self.observe(movement.name(), result)?;

            // Still under the wallet lock: audit order follows commit order
            self.dispatcher.submit(tx.clone(), None);
            Ok::<_, Error>((wallet, tx))
        })?;

        match movement {
            Movement::Deposit => self.metrics.deposits.inc(),
            Movement::Withdrawal => self.metrics.withdrawals.inc(),
        }
        tracing::info!(
            wallet_id = %wallet_id,
            transaction_id = %tx.id,
            amount = %amount,
            balance = %wallet.balance(),
            request_id = tx.request_id().unwrap_or_default(),
            "{} committed",
            movement.name()
        );

        Ok(wallet)
    }

    /// Transfer with a generated request context
    pub fn transfer(&self, from: &WalletId, to: &WalletId, amount: Money) -> Result<TransferReceipt> {
        let context = AuditContext::new(request_id("transfer", &[from, to]));
        self.transfer_with_context(from, to, amount, context)
    }

    /// Move `amount` between two wallets as one atomic unit
    ///
    /// Both legs share `context`, hence one request id.
    pub fn transfer_with_context(
        &self,
        from: &WalletId,
        to: &WalletId,
        amount: Money,
        context: AuditContext,
    ) -> Result<TransferReceipt> {
        let _timer = self.metrics.start_timer("transfer");

        if from == to {
            let err = Error::InvalidArgument(format!("cannot transfer wallet {} to itself", from));
            return self.observe("transfer", Err(err));
        }

        // Locks are taken in id order so two opposite transfers cannot deadlock
        let receipt = self.locks.with_locked(&[from, to], || {
            let result = (|| -> Result<TransferReceipt> {
                let mut source = self.get_wallet(from)?;
                let mut destination = self.get_wallet(to)?;

                // Withdraw first so insufficient funds fails before any mutation is kept
                source.withdraw(amount)?;
                destination.deposit(amount)?;

                let debit = Transaction::transfer_out(
                    from.clone(),
                    to.clone(),
                    amount,
                    source.updated_at(),
                    Some(context.clone()),
                );
                let credit = Transaction::transfer_in(
                    to.clone(),
                    from.clone(),
                    amount,
                    destination.updated_at(),
                    Some(context),
                );

                self.commit(&[
                    WriteItem::Wallet(source.clone()),
                    WriteItem::Wallet(destination.clone()),
                    WriteItem::Transaction(debit.clone()),
                    WriteItem::Transaction(credit.clone()),
                ])?;

                Ok(TransferReceipt {
                    source: source.committed(),
                    destination: destination.committed(),
                    debit,
                    credit,
                })
            })();

            let receipt = self.observe("transfer", result)?;

            self.dispatcher.submit(receipt.debit.clone(), None);
            self.dispatcher.submit(receipt.credit.clone(), None);
            Ok::<_, Error>(receipt)
        })?;

        self.metrics.transfers.inc();
        tracing::info!(
            from = %from,
            to = %to,
            amount = %amount,
            request_id = receipt.debit.request_id().unwrap_or_default(),
            "Transfer committed"
        );

        Ok(receipt)
    }

    /// Balance of `wallet_id` replayed from transactions strictly before `as_of`
    pub fn historical_balance(
        &self,
        wallet_id: &WalletId,
        as_of: DateTime<Utc>,
    ) -> Result<HistoricalBalance> {
        let _timer = self.metrics.start_timer("historical_balance");

        let result = self.get_wallet(wallet_id).and_then(|wallet| {
            let balance = self.history.balance_of(&wallet, as_of)?;
            Ok(HistoricalBalance {
                wallet_id: wallet_id.clone(),
                owner_id: wallet.owner_id().to_string(),
                balance,
                as_of,
            })
        });

        self.observe("historical_balance", result)
    }

    /// True when the wallet's audit chain is intact
    pub fn verify_chain_integrity(&self, wallet_id: &WalletId) -> bool {
        self.audit.verify_chain_integrity(wallet_id)
    }

    /// Full verification report, including the break point
    pub fn verify_chain(&self, wallet_id: &WalletId) -> ChainReport {
        self.audit.verify_chain(wallet_id)
    }

    /// Wait until every audit task submitted so far is processed
    pub async fn flush_audit(&self) -> Result<()> {
        self.dispatcher.flush().await
    }

    /// Drain the audit queues and stop the workers
    pub async fn shutdown(&self) -> Result<()> {
        self.dispatcher.flush().await?;
        self.dispatcher.shutdown().await?;

        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            worker
                .await
                .map_err(|e| Error::Concurrency(format!("Audit worker failed: {}", e)))?;
        }

        tracing::info!("Ledger shut down");
        Ok(())
    }

    /// Wallet store
    pub fn store(&self) -> Arc<dyn LedgerStore> {
        self.store.clone()
    }

    /// Audit chain service
    pub fn audit(&self) -> Arc<AuditChainService> {
        self.audit.clone()
    }

    /// Operational counters
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    fn commit(&self, items: &[WriteItem]) -> Result<()> {
        self.store.atomic_write(items).map_err(|e| match e {
            Error::CommitFailure(_) | Error::DuplicateOwner(_) => e,
            other => Error::CommitFailure(other.to_string()),
        })
    }

    /// Log and count a failed operation
    fn observe<T>(&self, operation: &str, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.metrics.record_error(e);
            if e.is_business_rule() {
                tracing::warn!(operation, error_kind = e.kind(), error = %e, "Operation rejected");
            } else {
                tracing::error!(operation, error_kind = e.kind(), error = %e, "Operation failed");
            }
        }
        result
    }
}

/// `<operation>-<wallet ids>-<epoch millis>`
fn request_id(operation: &str, wallets: &[&WalletId]) -> String {
    let mut id = operation.to_string();
    for wallet_id in wallets {
        id.push('-');
        id.push_str(wallet_id.as_str());
    }
    id.push('-');
    id.push_str(&Utc::now().timestamp_millis().to_string());
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::FlakyAuditStore;
    use crate::storage::MemoryStore;
    use crate::types::TransactionType;
    use chrono::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn money(s: &str) -> Money {
        s.parse().unwrap()
    }

    fn memory_ledger() -> (Ledger, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let ledger = Ledger::with_store(
            store.clone(),
            store.clone(),
            &AuditConfig::default(),
            Metrics::new().unwrap(),
        )
        .unwrap();
        (ledger, store)
    }

    /// Ledger store whose atomic writes can be switched off; counts wallet reads
    #[derive(Default)]
    struct RejectingStore {
        inner: MemoryStore,
        reject: Mutex<bool>,
        wallet_reads: AtomicUsize,
    }

    impl LedgerStore for RejectingStore {
        fn put_wallet(&self, wallet: &Wallet) -> Result<()> {
            self.inner.put_wallet(wallet)
        }

        fn get_wallet(&self, wallet_id: &WalletId) -> Result<Option<Wallet>> {
            self.wallet_reads.fetch_add(1, Ordering::SeqCst);
            self.inner.get_wallet(wallet_id)
        }

        fn get_wallet_by_owner(&self, owner_id: &str) -> Result<Option<Wallet>> {
            self.inner.get_wallet_by_owner(owner_id)
        }

        fn atomic_write(&self, items: &[WriteItem]) -> Result<()> {
            if *self.reject.lock() {
                return Err(Error::Storage("transaction cancelled".into()));
            }
            self.inner.atomic_write(items)
        }

        fn query_transactions(
            &self,
            wallet_id: &WalletId,
            before: DateTime<Utc>,
        ) -> Result<Vec<Transaction>> {
            self.inner.query_transactions(wallet_id, before)
        }

        fn scan_wallets(&self, limit: usize) -> Result<Vec<Wallet>> {
            self.inner.scan_wallets(limit)
        }
    }

    #[tokio::test]
    async fn test_create_wallet() {
        let (ledger, _) = memory_ledger();
        let wallet = ledger.create_wallet("u1").unwrap();
        assert_eq!(wallet.balance(), Money::zero());
        assert_eq!(ledger.get_wallet(wallet.id()).unwrap(), wallet);
        assert_eq!(ledger.metrics().wallets_created.get(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_owner_rejected() {
        let (ledger, _) = memory_ledger();
        ledger.create_wallet("u1").unwrap();
        assert!(matches!(ledger.create_wallet("u1"), Err(Error::DuplicateOwner(_))));
        assert!(matches!(ledger.create_wallet(" "), Err(Error::InvalidArgument(_))));
        assert_eq!(
            ledger
                .metrics()
                .business_errors
                .with_label_values(&["duplicate_owner"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn test_unknown_wallet() {
        let (ledger, _) = memory_ledger();
        let ghost = WalletId::generate();
        assert!(matches!(ledger.get_wallet(&ghost), Err(Error::WalletNotFound(_))));
        assert!(matches!(ledger.deposit(&ghost, money("1")), Err(Error::WalletNotFound(_))));
        assert!(matches!(
            ledger.historical_balance(&ghost, Utc::now()),
            Err(Error::WalletNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_deposit_and_withdraw() {
        let (ledger, store) = memory_ledger();
        let wallet = ledger.create_wallet("u1").unwrap();

        let after = ledger.deposit(wallet.id(), money("500")).unwrap();
        assert_eq!(after.balance(), money("500"));
        let after = ledger.withdraw(wallet.id(), money("120.25")).unwrap();
        assert_eq!(after.balance(), money("379.75"));
        assert_eq!(ledger.get_wallet(wallet.id()).unwrap(), after);

        let txs = store
            .query_transactions(wallet.id(), Utc::now() + Duration::seconds(1))
            .unwrap();
        assert_eq!(txs.len(), 2);
        assert_eq!(txs[0].tx_type, TransactionType::Deposit);
        assert!(txs[0]
            .request_id()
            .unwrap()
            .starts_with(&format!("deposit-{}-", wallet.id())));
        assert_eq!(txs[1].tx_type, TransactionType::Withdrawal);
        assert!(txs[1].request_id().unwrap().starts_with("withdrawal-"));
    }

    #[tokio::test]
    async fn test_invalid_amount_and_insufficient_funds() {
        let (ledger, store) = memory_ledger();
        let wallet = ledger.create_wallet("u1").unwrap();
        ledger.deposit(wallet.id(), money("350")).unwrap();

        assert!(matches!(
            ledger.deposit(wallet.id(), Money::zero()),
            Err(Error::InvalidAmount(_))
        ));
        assert!(matches!(
            ledger.withdraw(wallet.id(), money("1000")),
            Err(Error::InsufficientFunds { .. })
        ));

        assert_eq!(ledger.get_wallet(wallet.id()).unwrap().balance(), money("350"));
        let txs = store
            .query_transactions(wallet.id(), Utc::now() + Duration::seconds(1))
            .unwrap();
        assert_eq!(txs.len(), 1);
    }

    #[tokio::test]
    async fn test_transfer() {
        let (ledger, _) = memory_ledger();
        let a = ledger.create_wallet("u1").unwrap();
        let b = ledger.create_wallet("u2").unwrap();
        ledger.deposit(a.id(), money("500")).unwrap();
        ledger.deposit(b.id(), money("300")).unwrap();

        let receipt = ledger.transfer(a.id(), b.id(), money("150")).unwrap();
        assert_eq!(receipt.source.balance(), money("350"));
        assert_eq!(receipt.destination.balance(), money("450"));
        assert_eq!(receipt.debit.tx_type, TransactionType::TransferOut);
        assert_eq!(receipt.debit.related_wallet_id.as_ref(), Some(b.id()));
        assert_eq!(receipt.credit.tx_type, TransactionType::TransferIn);
        assert_eq!(receipt.credit.related_wallet_id.as_ref(), Some(a.id()));
        assert_eq!(receipt.debit.request_id(), receipt.credit.request_id());
        assert!(receipt
            .debit
            .request_id()
            .unwrap()
            .starts_with(&format!("transfer-{}-{}-", a.id(), b.id())));
        assert_eq!(ledger.metrics().transfers.get(), 1);
    }

    #[tokio::test]
    async fn test_transfer_rejections_leave_balances() {
        let (ledger, _) = memory_ledger();
        let a = ledger.create_wallet("u1").unwrap();
        let b = ledger.create_wallet("u2").unwrap();
        ledger.deposit(a.id(), money("100")).unwrap();

        assert!(matches!(
            ledger.transfer(a.id(), a.id(), money("1")),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            ledger.transfer(a.id(), b.id(), money("100.01")),
            Err(Error::InsufficientFunds { .. })
        ));
        assert!(matches!(
            ledger.transfer(a.id(), &WalletId::generate(), money("1")),
            Err(Error::WalletNotFound(_))
        ));
        assert!(matches!(
            ledger.transfer(a.id(), b.id(), Money::zero()),
            Err(Error::InvalidAmount(_))
        ));

        assert_eq!(ledger.get_wallet(a.id()).unwrap().balance(), money("100"));
        assert_eq!(ledger.get_wallet(b.id()).unwrap().balance(), Money::zero());
    }

    #[tokio::test]
    async fn test_commit_failure_has_no_effect() {
        let store = Arc::new(RejectingStore::default());
        let audit_store = Arc::new(MemoryStore::new());
        let ledger = Ledger::with_store(
            store.clone(),
            audit_store.clone(),
            &AuditConfig::default(),
            Metrics::new().unwrap(),
        )
        .unwrap();

        let a = ledger.create_wallet("u1").unwrap();
        let b = ledger.create_wallet("u2").unwrap();
        ledger.deposit(a.id(), money("200")).unwrap();

        *store.reject.lock() = true;
        assert!(matches!(
            ledger.transfer(a.id(), b.id(), money("50")),
            Err(Error::CommitFailure(_))
        ));
        assert!(matches!(
            ledger.deposit(b.id(), money("5")),
            Err(Error::CommitFailure(_))
        ));
        *store.reject.lock() = false;

        assert_eq!(ledger.get_wallet(a.id()).unwrap().balance(), money("200"));
        assert_eq!(ledger.get_wallet(b.id()).unwrap().balance(), Money::zero());
        assert_eq!(ledger.metrics().commit_failures.get(), 2);

        ledger.flush_audit().await.unwrap();
        assert_eq!(audit_store.query_audit_records(a.id()).unwrap().len(), 1);
        assert!(audit_store.query_audit_records(b.id()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_audit_failure_does_not_fail_business_call() {
        let store = Arc::new(MemoryStore::new());
        let audit_store = Arc::new(FlakyAuditStore::default());
        let ledger = Ledger::with_store(
            store,
            audit_store.clone(),
            &AuditConfig::default(),
            Metrics::new().unwrap(),
        )
        .unwrap();

        let wallet = ledger.create_wallet("u1").unwrap();
        *audit_store.fail_appends.lock() = true;

        let after = ledger.deposit(wallet.id(), money("10")).unwrap();
        assert_eq!(after.balance(), money("10"));

        ledger.flush_audit().await.unwrap();
        assert_eq!(
            ledger
                .metrics()
                .audit_errors
                .with_label_values(&["audit_transaction"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn test_every_commit_is_audited_in_order() {
        let (ledger, store) = memory_ledger();
        let a = ledger.create_wallet("u1").unwrap();
        let b = ledger.create_wallet("u2").unwrap();

        ledger.deposit(a.id(), money("100")).unwrap();
        ledger.transfer(a.id(), b.id(), money("30")).unwrap();
        ledger.withdraw(a.id(), money("10")).unwrap();
        ledger.transfer(b.id(), a.id(), money("5")).unwrap();
        ledger.flush_audit().await.unwrap();

        let far = Utc::now() + Duration::seconds(1);
        for wallet_id in [a.id(), b.id()] {
            let committed: Vec<_> = store
                .query_transactions(wallet_id, far)
                .unwrap()
                .into_iter()
                .map(|tx| tx.id)
                .collect();
            let audited: Vec<_> = store
                .query_audit_records(wallet_id)
                .unwrap()
                .into_iter()
                .map(|r| r.transaction_id)
                .collect();
            assert_eq!(committed, audited);
            assert!(ledger.verify_chain_integrity(wallet_id));
            assert!(ledger.verify_chain(wallet_id).is_valid());
        }
    }

    #[tokio::test]
    async fn test_signed_ledger() {
        let store = Arc::new(MemoryStore::new());
        let config = AuditConfig {
            signing_seed: Some("11".repeat(32)),
            ..AuditConfig::default()
        };
        let ledger =
            Ledger::with_store(store.clone(), store.clone(), &config, Metrics::new().unwrap())
                .unwrap();
        assert!(ledger.audit().public_key().is_some());

        let wallet = ledger.create_wallet("u1").unwrap();
        ledger.deposit(wallet.id(), money("1")).unwrap();
        ledger.flush_audit().await.unwrap();

        let records = store.query_audit_records(wallet.id()).unwrap();
        assert!(records[0].signature.is_some());
        assert!(ledger.verify_chain_integrity(wallet.id()));
    }

    #[tokio::test]
    async fn test_bad_signing_seed() {
        let store = Arc::new(MemoryStore::new());
        let config = AuditConfig {
            signing_seed: Some("nothex".into()),
            ..AuditConfig::default()
        };
        assert!(matches!(
            Ledger::with_store(store.clone(), store, &config, Metrics::new().unwrap()),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_transfers_conserve_money() {
        let (ledger, _) = memory_ledger();
        let ledger = Arc::new(ledger);
        let a = ledger.create_wallet("u1").unwrap();
        let b = ledger.create_wallet("u2").unwrap();
        ledger.deposit(a.id(), money("1000")).unwrap();
        ledger.deposit(b.id(), money("1000")).unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let ledger = ledger.clone();
            let (from, to) = if i % 2 == 0 {
                (a.id().clone(), b.id().clone())
            } else {
                (b.id().clone(), a.id().clone())
            };
            handles.push(tokio::task::spawn_blocking(move || {
                for _ in 0..25 {
                    ledger.transfer(&from, &to, money("3")).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let total = ledger
            .get_wallet(a.id())
            .unwrap()
            .balance()
            .checked_add(ledger.get_wallet(b.id()).unwrap().balance())
            .unwrap();
        assert_eq!(total, money("2000"));
        assert_eq!(ledger.locks.len(), 0);

        ledger.flush_audit().await.unwrap();
        assert!(ledger.verify_chain_integrity(a.id()));
        assert!(ledger.verify_chain_integrity(b.id()));
        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_historical_balance() {
        let (ledger, _) = memory_ledger();
        let wallet = ledger.create_wallet("u1").unwrap();
        let t0 = ledger.deposit(wallet.id(), money("300")).unwrap().updated_at();
        ledger.withdraw(wallet.id(), money("100")).unwrap();

        let before = ledger.historical_balance(wallet.id(), t0).unwrap();
        assert_eq!(before.balance, Money::zero());
        assert_eq!(before.owner_id, "u1");

        let now = ledger
            .historical_balance(wallet.id(), Utc::now() + Duration::seconds(1))
            .unwrap();
        assert_eq!(now.balance, money("200"));
    }

    #[tokio::test]
    async fn test_historical_balance_reads_wallet_once() {
        let store = Arc::new(RejectingStore::default());
        let ledger = Ledger::with_store(
            store.clone(),
            Arc::new(MemoryStore::new()),
            &AuditConfig::default(),
            Metrics::new().unwrap(),
        )
        .unwrap();
        let wallet = ledger.create_wallet("u1").unwrap();
        ledger.deposit(wallet.id(), money("40")).unwrap();

        store.wallet_reads.store(0, Ordering::SeqCst);
        let view = ledger
            .historical_balance(wallet.id(), Utc::now() + Duration::seconds(1))
            .unwrap();
        assert_eq!(view.balance, money("40"));
        assert_eq!(store.wallet_reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_lock_table_does_not_grow_on_unknown_ids() {
        let (ledger, _) = memory_ledger();
        let wallet = ledger.create_wallet("u1").unwrap();
        ledger.deposit(wallet.id(), money("10")).unwrap();
        assert_eq!(ledger.locks.len(), 0);

        for _ in 0..1000 {
            let ghost = WalletId::generate();
            assert!(matches!(
                ledger.deposit(&ghost, money("1")),
                Err(Error::WalletNotFound(_))
            ));
            assert!(matches!(
                ledger.transfer(wallet.id(), &ghost, money("1")),
                Err(Error::WalletNotFound(_))
            ));
        }
        assert_eq!(ledger.locks.len(), 0);

        // The real wallet still locks and commits normally
        let after = ledger.withdraw(wallet.id(), money("4")).unwrap();
        assert_eq!(after.balance(), money("6"));
        assert_eq!(ledger.locks.len(), 0);
    }

    #[test]
    fn test_wallet_locks_serialize_and_release() {
        let locks = Arc::new(WalletLocks::default());
        let id = WalletId::generate();
        let counter = Arc::new(Mutex::new(0u32));

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let locks = locks.clone();
                let id = id.clone();
                let counter = counter.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        locks.with_locked(&[&id, &id], || {
                            let seen = *counter.lock();
                            std::thread::yield_now();
                            *counter.lock() = seen + 1;
                        });
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(*counter.lock(), 800);
        assert_eq!(locks.len(), 0);
    }
}
