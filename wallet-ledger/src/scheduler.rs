//! Periodic reconciliation
//!
//! Two independent jobs over a batch of wallets:
//!
//! - **Snapshot pass** - capture every wallet's balance
//! - **Integrity pass** - verify every wallet's audit chain
//!
//! Each wallet is handled on its own; one failure is logged and the pass
//! moves on. Both jobs are no-ops while reconciliation is disabled.

use crate::{
    audit::AuditChainService,
    config::ReconciliationConfig,
    metrics::Metrics,
    storage::LedgerStore,
    types::{AuditContext, WalletId},
    wallet::Wallet,
    Error, Result,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Which job a loop runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    /// Wallet snapshots
    Snapshot,
    /// Chain verification
    Integrity,
}

impl Pass {
    fn name(self) -> &'static str {
        match self {
            Pass::Snapshot => "snapshot",
            Pass::Integrity => "integrity",
        }
    }
}

/// Outcome of one pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Correlates the log lines and snapshot contexts of one pass
    pub batch_id: String,
    /// Wallets handled successfully
    pub processed: usize,
    /// Wallets that failed
    pub failed: usize,
    /// Wallets not handled because the job is switched off
    pub skipped: usize,
    /// Wallets needing attention
    pub flagged: Vec<WalletId>,
    /// The wallet batch itself could not be read
    pub scan_failed: bool,
}

/// Timing of the two loops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    /// Period of the snapshot loop; also its first delay
    pub snapshot_every: Duration,
    /// Period of the integrity loop
    pub integrity_every: Duration,
    /// Extra delay of the first integrity pass
    pub integrity_offset: Duration,
}

impl From<&ReconciliationConfig> for Schedule {
    fn from(config: &ReconciliationConfig) -> Self {
        Self {
            snapshot_every: config.snapshot_interval(),
            integrity_every: config.integrity_interval(),
            integrity_offset: config.initial_delay(),
        }
    }
}

/// Drives snapshot and integrity passes
pub struct ReconciliationScheduler {
    store: Arc<dyn LedgerStore>,
    audit: Arc<AuditChainService>,
    config: ReconciliationConfig,
    metrics: Metrics,
}

impl std::fmt::Debug for ReconciliationScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconciliationScheduler")
            .field("config", &self.config)
            .finish()
    }
}

impl ReconciliationScheduler {
    /// Create new scheduler
    pub fn new(
        store: Arc<dyn LedgerStore>,
        audit: Arc<AuditChainService>,
        config: ReconciliationConfig,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            audit,
            config,
            metrics,
        }
    }

    /// Run one pass of either kind
    pub fn run(&self, pass: Pass) -> PassReport {
        match pass {
            Pass::Snapshot => self.run_snapshot_pass(),
            Pass::Integrity => self.run_integrity_pass(),
        }
    }

    fn load_batch(&self, pass: Pass, report: &mut PassReport) -> Option<Vec<Wallet>> {
        if !self.config.enabled {
            debug!(pass = pass.name(), "Reconciliation disabled, skipping pass");
            return None;
        }

        match self.store.scan_wallets(self.config.batch_size) {
            Ok(wallets) => Some(wallets),
            Err(e) => {
                report.scan_failed = true;
                self.metrics.record_audit_error(pass.name());
                error!(
                    pass = pass.name(),
                    batch_id = %report.batch_id,
                    audit_error = %e,
                    "Could not load wallet batch"
                );
                None
            }
        }
    }

    /// Snapshot up to `batch_size` wallets
    pub fn run_snapshot_pass(&self) -> PassReport {
        let mut report = PassReport {
            batch_id: Uuid::new_v4().to_string(),
            ..PassReport::default()
        };
        let Some(wallets) = self.load_batch(Pass::Snapshot, &mut report) else {
            return report;
        };

        if !self.audit.snapshots_enabled() {
            report.skipped = wallets.len();
            info!(
                batch_id = %report.batch_id,
                wallets = wallets.len(),
                "Snapshots disabled, snapshot pass skipped"
            );
            return report;
        }

        info!(batch_id = %report.batch_id, wallets = wallets.len(), "Snapshot pass started");

        for wallet in &wallets {
            let context = AuditContext::system(format!("periodic-snapshot-{}", Uuid::new_v4()))
                .with_entry("batch_id", report.batch_id.clone())
                .with_entry("reason", "periodic-reconciliation");

            match self.audit.try_create_wallet_snapshot(wallet, Some(&context)) {
                Ok(Some(_)) => report.processed += 1,
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    report.flagged.push(wallet.id().clone());
                    self.metrics.record_audit_error("periodic_snapshot");
                    error!(
                        batch_id = %report.batch_id,
                        wallet_id = %wallet.id(),
                        audit_error = %e,
                        "Snapshot failed for wallet"
                    );
                }
            }
        }

        info!(
            batch_id = %report.batch_id,
            processed = report.processed,
            failed = report.failed,
            "Snapshot pass finished"
        );
        report
    }

    /// Verify the chains of up to `batch_size` wallets
    pub fn run_integrity_pass(&self) -> PassReport {
        let mut report = PassReport {
            batch_id: Uuid::new_v4().to_string(),
            ..PassReport::default()
        };
        let Some(wallets) = self.load_batch(Pass::Integrity, &mut report) else {
            return report;
        };

        info!(batch_id = %report.batch_id, wallets = wallets.len(), "Integrity pass started");

        for wallet in &wallets {
            if self.audit.verify_chain_integrity(wallet.id()) {
                report.processed += 1;
            } else {
                report.failed += 1;
                report.flagged.push(wallet.id().clone());
                error!(
                    batch_id = %report.batch_id,
                    wallet_id = %wallet.id(),
                    "Integrity alert: audit chain failed verification"
                );
            }
        }

        if report.flagged.is_empty() {
            info!(
                batch_id = %report.batch_id,
                verified = report.processed,
                "Integrity pass finished"
            );
        } else {
            warn!(
                batch_id = %report.batch_id,
                verified = report.processed,
                flagged = report.flagged.len(),
                "Integrity pass finished with alerts"
            );
        }
        report
    }

    /// Start both loops with the configured cadence
    pub fn spawn(self: Arc<Self>) -> SchedulerHandle {
        let schedule = Schedule::from(&self.config);
        self.spawn_with_schedule(schedule)
    }

    /// Start both loops with an explicit cadence
    pub fn spawn_with_schedule(self: Arc<Self>, schedule: Schedule) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(
            enabled = self.config.enabled,
            batch_size = self.config.batch_size,
            snapshot_every = ?schedule.snapshot_every,
            integrity_every = ?schedule.integrity_every,
            "Starting reconciliation scheduler"
        );

        let snapshot = tokio::spawn(self.clone().run_loop(
            Pass::Snapshot,
            schedule.snapshot_every,
            schedule.snapshot_every,
            shutdown_rx.clone(),
        ));
        let integrity = tokio::spawn(self.run_loop(
            Pass::Integrity,
            schedule.snapshot_every + schedule.integrity_offset,
            schedule.integrity_every,
            shutdown_rx,
        ));

        SchedulerHandle {
            shutdown: shutdown_tx,
            tasks: vec![snapshot, integrity],
        }
    }

    async fn run_loop(
        self: Arc<Self>,
        pass: Pass,
        first_delay: Duration,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = interval_at(Instant::now() + first_delay, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    // Passes do blocking store I/O
                    let this = self.clone();
                    match tokio::task::spawn_blocking(move || this.run(pass)).await {
                        Ok(report) => debug!(
                            pass = pass.name(),
                            processed = report.processed,
                            failed = report.failed,
                            "Scheduled pass done"
                        ),
                        Err(e) => error!(pass = pass.name(), error = %e, "Scheduled pass aborted"),
                    }
                }

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        debug!(pass = pass.name(), "Reconciliation loop stopped");
    }
}

/// Handle to the running loops
#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Stop both loops, letting a pass in progress finish
    pub async fn shutdown(self) -> Result<()> {
        // Receivers may already be gone
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            task.await
                .map_err(|e| Error::Concurrency(format!("Scheduler loop failed: {}", e)))?;
        }
        info!("Reconciliation scheduler stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditRecord, FlakyAuditStore};
    use crate::storage::{AuditStore, LedgerStore, MemoryStore, WriteItem};
    use crate::types::Transaction;
    use chrono::Utc;

    struct Fixture {
        store: Arc<MemoryStore>,
        audit_store: Arc<FlakyAuditStore>,
        metrics: Metrics,
        wallets: Vec<Wallet>,
    }

    fn fixture(wallets: usize) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let mut created = Vec::new();
        for i in 0..wallets {
            let wallet = Wallet::open(format!("owner-{}", i)).unwrap();
            store
                .atomic_write(&[WriteItem::Wallet(wallet.clone())])
                .unwrap();
            created.push(wallet.committed());
        }
        Fixture {
            store,
            audit_store: Arc::new(FlakyAuditStore::default()),
            metrics: Metrics::new().unwrap(),
            wallets: created,
        }
    }

    fn scheduler(fx: &Fixture, config: ReconciliationConfig, snapshots: bool) -> ReconciliationScheduler {
        let audit = AuditChainService::new(fx.audit_store.clone(), fx.metrics.clone())
            .with_snapshots(snapshots);
        ReconciliationScheduler::new(fx.store.clone(), Arc::new(audit), config, fx.metrics.clone())
    }

    #[test]
    fn test_snapshot_pass() {
        let fx = fixture(3);
        let scheduler = scheduler(&fx, ReconciliationConfig::default(), true);

        let report = scheduler.run_snapshot_pass();
        assert_eq!(report.processed, 3);
        assert_eq!(report.failed, 0);

        for wallet in &fx.wallets {
            let snapshots = fx.audit_store.query_snapshots(wallet.id()).unwrap();
            assert_eq!(snapshots.len(), 1);
            let ctx = snapshots[0].context.as_ref().unwrap();
            assert_eq!(ctx.actor.as_deref(), Some("system"));
            assert!(ctx.request_id.starts_with("periodic-snapshot-"));
            assert_eq!(ctx.additional["reason"], "periodic-reconciliation");
            assert_eq!(ctx.additional["batch_id"], report.batch_id);
        }
    }

    #[test]
    fn test_batch_size_limits_pass() {
        let fx = fixture(5);
        let config = ReconciliationConfig {
            batch_size: 2,
            ..ReconciliationConfig::default()
        };
        let report = scheduler(&fx, config, true).run_snapshot_pass();
        assert_eq!(report.processed, 2);
    }

    #[test]
    fn test_disabled_passes_do_nothing() {
        let fx = fixture(2);
        let config = ReconciliationConfig {
            enabled: false,
            ..ReconciliationConfig::default()
        };
        let scheduler = scheduler(&fx, config, true);

        assert_eq!(scheduler.run_snapshot_pass().processed, 0);
        assert_eq!(scheduler.run_integrity_pass().processed, 0);
        assert!(fx
            .audit_store
            .query_snapshots(fx.wallets[0].id())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_snapshots_disabled_skips() {
        let fx = fixture(2);
        let report = scheduler(&fx, ReconciliationConfig::default(), false).run_snapshot_pass();
        assert_eq!(report.skipped, 2);
        assert_eq!(report.processed, 0);
    }

    #[test]
    fn test_snapshot_failures_are_isolated() {
        let fx = fixture(3);
        *fx.audit_store.fail_appends.lock() = true;
        let report = scheduler(&fx, ReconciliationConfig::default(), true).run_snapshot_pass();

        assert_eq!(report.failed, 3);
        assert_eq!(report.flagged.len(), 3);
        assert_eq!(
            fx.metrics
                .audit_errors
                .with_label_values(&["periodic_snapshot"])
                .get(),
            3
        );
    }

    #[test]
    fn test_integrity_pass_flags_only_broken_wallet() {
        let fx = fixture(3);
        let scheduler = scheduler(&fx, ReconciliationConfig::default(), true);

        // Honest chains for every wallet
        for wallet in &fx.wallets {
            let tx = Transaction::deposit(wallet.id().clone(), "5".parse().unwrap(), Utc::now(), None);
            scheduler.audit.audit_transaction(&tx, None).unwrap();
        }

        // Forged second record on one wallet: valid hash, wrong predecessor
        let victim = fx.wallets[1].id();
        let tx = Transaction::deposit(victim.clone(), "999".parse().unwrap(), Utc::now(), None);
        let forged_tip = crate::audit::ChainTip {
            sequence: 0,
            hash: "ab".repeat(32),
        };
        fx.audit_store
            .append_audit_record(&AuditRecord::link(&tx, None, Some(&forged_tip)))
            .unwrap();

        let report = scheduler.run_integrity_pass();
        assert_eq!(report.processed, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.flagged, vec![victim.clone()]);
        assert_eq!(fx.metrics.integrity_alerts.get(), 1);
    }

    #[test]
    fn test_integrity_pass_read_failure_flags_every_wallet() {
        let fx = fixture(2);
        *fx.audit_store.fail_reads.lock() = true;
        let report = scheduler(&fx, ReconciliationConfig::default(), true).run_integrity_pass();
        assert_eq!(report.failed, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_spawned_loops_run_and_stop() {
        let fx = fixture(2);
        let scheduler = Arc::new(scheduler(&fx, ReconciliationConfig::default(), true));

        let handle = scheduler.spawn_with_schedule(Schedule {
            snapshot_every: Duration::from_millis(20),
            integrity_every: Duration::from_millis(20),
            integrity_offset: Duration::from_millis(5),
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.shutdown().await.unwrap();

        let taken = fx.audit_store.query_snapshots(fx.wallets[0].id()).unwrap().len();
        assert!(taken >= 1);

        // Nothing runs after shutdown
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(
            fx.audit_store.query_snapshots(fx.wallets[0].id()).unwrap().len(),
            taken
        );
    }

    #[test]
    fn test_schedule_from_config() {
        let schedule = Schedule::from(&ReconciliationConfig::default());
        assert_eq!(schedule.snapshot_every, Duration::from_secs(86_400));
        assert_eq!(schedule.integrity_offset, Duration::from_secs(3_600));
    }
}
