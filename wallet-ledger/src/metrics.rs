//! Operational counters
//!
//! Counters live in a [`Registry`] owned by [`Metrics`], never the global
//! default registry, so several ledgers (and tests) can coexist in one
//! process. Exporting the registry is left to the embedding service.
//!
//! # Metrics
//!
//! - `wallet_wallets_created_total` - Wallets created
//! - `wallet_deposits_total` / `wallet_withdrawals_total` / `wallet_transfers_total`
//! - `wallet_business_errors_total{kind}` - Rule violations returned to callers
//! - `wallet_commit_failures_total` - Atomic writes rejected by the store
//! - `wallet_audit_records_total` - Audit records appended
//! - `wallet_snapshots_total` - Snapshots persisted
//! - `wallet_audit_errors_total{operation}` - Swallowed audit failures
//! - `wallet_audit_rejected_total` - Audit tasks refused on a full queue
//! - `wallet_integrity_alerts_total` - Broken or unverifiable chains
//! - `wallet_operation_duration_seconds{operation}` - Business operation latency

use prometheus::{Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry};
use std::sync::Arc;
use std::time::Instant;

/// Metrics collector
#[derive(Clone, Debug)]
pub struct Metrics {
    /// Wallets created
    pub wallets_created: IntCounter,

    /// Committed deposits
    pub deposits: IntCounter,

    /// Committed withdrawals
    pub withdrawals: IntCounter,

    /// Committed transfers
    pub transfers: IntCounter,

    /// Business-rule violations by kind
    pub business_errors: IntCounterVec,

    /// Store-rejected atomic writes
    pub commit_failures: IntCounter,

    /// Audit records appended
    pub audit_records: IntCounter,

    /// Snapshots persisted
    pub snapshots: IntCounter,

    /// Swallowed audit failures by operation
    pub audit_errors: IntCounterVec,

    /// Audit tasks refused because a worker queue was full or closed
    pub audit_rejected: IntCounter,

    /// Integrity alerts raised by verification
    pub integrity_alerts: IntCounter,

    /// Business operation latency
    pub operation_duration: HistogramVec,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let counter = |name: &str, help: &str| -> prometheus::Result<IntCounter> {
            let counter = IntCounter::new(name, help)?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };

        let wallets_created = counter("wallet_wallets_created_total", "Wallets created")?;
        let deposits = counter("wallet_deposits_total", "Committed deposits")?;
        let withdrawals = counter("wallet_withdrawals_total", "Committed withdrawals")?;
        let transfers = counter("wallet_transfers_total", "Committed transfers")?;
        let commit_failures = counter(
            "wallet_commit_failures_total",
            "Atomic writes rejected by the store",
        )?;
        let audit_records = counter("wallet_audit_records_total", "Audit records appended")?;
        let snapshots = counter("wallet_snapshots_total", "Wallet snapshots persisted")?;
        let audit_rejected = counter(
            "wallet_audit_rejected_total",
            "Audit tasks refused on a full or closed queue",
        )?;
        let integrity_alerts = counter(
            "wallet_integrity_alerts_total",
            "Audit chains found broken or unverifiable",
        )?;

        let business_errors = IntCounterVec::new(
            Opts::new(
                "wallet_business_errors_total",
                "Business-rule violations returned to callers",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(business_errors.clone()))?;

        let audit_errors = IntCounterVec::new(
            Opts::new("wallet_audit_errors_total", "Swallowed audit failures"),
            &["operation"],
        )?;
        registry.register(Box::new(audit_errors.clone()))?;

        let operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "wallet_operation_duration_seconds",
                "Business operation latency",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 1.0]),
            &["operation"],
        )?;
        registry.register(Box::new(operation_duration.clone()))?;

        Ok(Self {
            wallets_created,
            deposits,
            withdrawals,
            transfers,
            business_errors,
            commit_failures,
            audit_records,
            snapshots,
            audit_errors,
            audit_rejected,
            integrity_alerts,
            operation_duration,
            registry,
        })
    }

    /// Count a failed business call by error kind
    pub fn record_error(&self, error: &crate::Error) {
        match error {
            crate::Error::CommitFailure(_) => self.commit_failures.inc(),
            e if e.is_business_rule() => {
                self.business_errors.with_label_values(&[e.kind()]).inc()
            }
            _ => {}
        }
    }

    /// Count a swallowed audit failure
    pub fn record_audit_error(&self, operation: &str) {
        self.audit_errors.with_label_values(&[operation]).inc();
    }

    /// Start timing one business operation
    pub fn start_timer(&self, operation: &str) -> OperationTimer {
        OperationTimer {
            histogram: self.operation_duration.with_label_values(&[operation]),
            started: Instant::now(),
        }
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Observes elapsed time into its histogram when dropped
#[derive(Debug)]
pub struct OperationTimer {
    histogram: Histogram,
    started: Instant,
}

impl Drop for OperationTimer {
    fn drop(&mut self) {
        self.histogram.observe(self.started.elapsed().as_secs_f64());
    }
}
