//! Audit chain service: append, snapshot, verify

use super::{
    record::{AuditRecord, Snapshot},
    tip_cache::TipCache,
};
use crate::{
    crypto::KeyPair,
    metrics::Metrics,
    storage::AuditStore,
    types::{AuditContext, Transaction, TransactionId, WalletId},
    wallet::Wallet,
    Error, Result,
};
use std::fmt;
use std::sync::Arc;

/// What went wrong at a break point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakKind {
    /// `previous_hash` is not the predecessor's `current_hash`
    PreviousHashMismatch,
    /// `current_hash` does not recompute from the fields
    HashMismatch,
    /// Record is not where its sequence says it is
    SequenceMismatch,
    /// Signature missing or not valid for the configured key
    SignatureInvalid,
}

impl fmt::Display for BreakKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BreakKind::PreviousHashMismatch => "previous hash mismatch",
            BreakKind::HashMismatch => "hash mismatch",
            BreakKind::SequenceMismatch => "sequence mismatch",
            BreakKind::SignatureInvalid => "invalid signature",
        })
    }
}

/// First point where a chain fails verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainBreak {
    /// Position in the fetched chain
    pub index: usize,
    /// Sequence stored on the record
    pub sequence: u64,
    /// Mirrored transaction
    pub transaction_id: TransactionId,
    /// Failed check
    pub kind: BreakKind,
}

impl fmt::Display for ChainBreak {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "record {} (sequence {}, transaction {}): {}",
            self.index, self.sequence, self.transaction_id, self.kind
        )
    }
}

/// Outcome of verifying one wallet's chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainReport {
    /// Every link checks out (an empty chain is valid)
    Valid {
        /// Records checked
        records: usize,
    },
    /// Verification stopped at the first bad record
    Broken(ChainBreak),
    /// The chain could not be read
    Unavailable(String),
}

impl ChainReport {
    /// Only `Valid` counts as intact
    pub fn is_valid(&self) -> bool {
        matches!(self, ChainReport::Valid { .. })
    }

    /// Break point, if any
    pub fn break_point(&self) -> Option<&ChainBreak> {
        match self {
            ChainReport::Broken(b) => Some(b),
            _ => None,
        }
    }

    /// Turn a failed report into an error for `wallet_id`
    pub fn into_result(self, wallet_id: &WalletId) -> Result<usize> {
        match self {
            ChainReport::Valid { records } => Ok(records),
            ChainReport::Broken(b) => Err(Error::IntegrityViolation {
                wallet_id: wallet_id.to_string(),
                detail: b.to_string(),
            }),
            ChainReport::Unavailable(reason) => Err(Error::AuditFailure(format!(
                "chain of wallet {} unavailable: {}",
                wallet_id, reason
            ))),
        }
    }
}

/// Walk a chain in sequence order and report the first broken link
///
/// With `public_key` set, every record must also carry a valid signature.
pub fn verify_records(records: &[AuditRecord], public_key: Option<&[u8; 32]>) -> ChainReport {
    let mut previous: Option<&AuditRecord> = None;

    for (index, record) in records.iter().enumerate() {
        let broken = |kind| {
            ChainReport::Broken(ChainBreak {
                index,
                sequence: record.sequence,
                transaction_id: record.transaction_id,
                kind,
            })
        };

        let expected_previous = previous.map(|p| p.current_hash.as_str());
        if record.previous_hash.as_deref() != expected_previous {
            return broken(BreakKind::PreviousHashMismatch);
        }
        if !record.verify_hash() {
            return broken(BreakKind::HashMismatch);
        }
        if record.sequence != index as u64 {
            return broken(BreakKind::SequenceMismatch);
        }
        if let Some(key) = public_key {
            if !record.verify_signature(key) {
                return broken(BreakKind::SignatureInvalid);
            }
        }

        previous = Some(record);
    }

    ChainReport::Valid {
        records: records.len(),
    }
}

/// Appends hash-linked records and snapshots, verifies chains
///
/// The `try_*` methods return errors; the plain methods swallow them into a
/// log line and an `audit_errors` count, which is what the business path and
/// the dispatcher use.
pub struct AuditChainService {
    store: Arc<dyn AuditStore>,
    tips: TipCache,
    keypair: Option<KeyPair>,
    snapshot_enabled: bool,
    metrics: Metrics,
}

impl fmt::Debug for AuditChainService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditChainService")
            .field("cached_tips", &self.tips.len())
            .field("signing", &self.keypair.is_some())
            .field("snapshot_enabled", &self.snapshot_enabled)
            .finish()
    }
}

impl AuditChainService {
    /// Unsigned service with snapshots enabled
    pub fn new(store: Arc<dyn AuditStore>, metrics: Metrics) -> Self {
        Self {
            store,
            tips: TipCache::new(),
            keypair: None,
            snapshot_enabled: true,
            metrics,
        }
    }

    /// Sign every appended record and require signatures on verification
    pub fn with_keypair(mut self, keypair: KeyPair) -> Self {
        self.keypair = Some(keypair);
        self
    }

    /// Administrative snapshot switch
    pub fn with_snapshots(mut self, enabled: bool) -> Self {
        self.snapshot_enabled = enabled;
        self
    }

    /// Whether snapshots are taken
    pub fn snapshots_enabled(&self) -> bool {
        self.snapshot_enabled
    }

    /// Verification key, when signing is on
    pub fn public_key(&self) -> Option<[u8; 32]> {
        self.keypair.as_ref().map(KeyPair::public_key)
    }

    /// Append the record for `transaction`, extending its wallet's chain
    pub fn try_audit_transaction(
        &self,
        transaction: &Transaction,
        context: Option<&AuditContext>,
    ) -> Result<AuditRecord> {
        let wallet_id = &transaction.wallet_id;

        let record = self.tips.with_slot(wallet_id, |slot| {
            let tip = slot
                .tip(self.store.as_ref(), wallet_id)
                .map_err(|e| Error::AuditFailure(format!("chain tip unavailable: {}", e)))?;

            let mut record = AuditRecord::link(transaction, context, tip.as_ref());
            if let Some(keypair) = &self.keypair {
                record.sign(keypair);
            }

            match self.store.append_audit_record(&record) {
                Ok(()) => {
                    slot.advance(record.tip());
                    Ok(record)
                }
                Err(e) => {
                    // The store may hold more than we think
                    slot.invalidate();
                    Err(Error::AuditFailure(format!("append rejected: {}", e)))
                }
            }
        })?;

        self.metrics.audit_records.inc();
        tracing::debug!(
            wallet_id = %wallet_id,
            transaction_id = %transaction.id,
            sequence = record.sequence,
            "Audit record appended"
        );

        Ok(record)
    }

    /// [`Self::try_audit_transaction`], with failures logged and counted
    pub fn audit_transaction(
        &self,
        transaction: &Transaction,
        context: Option<&AuditContext>,
    ) -> Option<AuditRecord> {
        match self.try_audit_transaction(transaction, context) {
            Ok(record) => Some(record),
            Err(e) => {
                self.metrics.record_audit_error("audit_transaction");
                tracing::error!(
                    audit_error = %e,
                    wallet_id = %transaction.wallet_id,
                    transaction_id = %transaction.id,
                    tx_type = %transaction.tx_type,
                    "Failed to audit transaction"
                );
                None
            }
        }
    }

    /// Persist a snapshot of `wallet`; `Ok(None)` when snapshots are disabled
    pub fn try_create_wallet_snapshot(
        &self,
        wallet: &Wallet,
        context: Option<&AuditContext>,
    ) -> Result<Option<Snapshot>> {
        if !self.snapshot_enabled {
            tracing::debug!(wallet_id = %wallet.id(), "Snapshots disabled, skipping");
            return Ok(None);
        }

        let snapshot = Snapshot::capture(wallet, context);
        self.store
            .append_snapshot(&snapshot)
            .map_err(|e| Error::AuditFailure(format!("snapshot rejected: {}", e)))?;

        self.metrics.snapshots.inc();
        tracing::info!(
            wallet_id = %wallet.id(),
            snapshot_id = %snapshot.snapshot_id,
            balance = %snapshot.balance,
            "Wallet snapshot created"
        );

        Ok(Some(snapshot))
    }

    /// [`Self::try_create_wallet_snapshot`], with failures logged and counted
    pub fn create_wallet_snapshot(
        &self,
        wallet: &Wallet,
        context: Option<&AuditContext>,
    ) -> Option<Snapshot> {
        match self.try_create_wallet_snapshot(wallet, context) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.metrics.record_audit_error("create_wallet_snapshot");
                tracing::error!(
                    audit_error = %e,
                    wallet_id = %wallet.id(),
                    "Failed to create wallet snapshot"
                );
                None
            }
        }
    }

    /// Full verification report for one wallet
    pub fn verify_chain(&self, wallet_id: &WalletId) -> ChainReport {
        match self.store.query_audit_records(wallet_id) {
            Ok(records) => verify_records(&records, self.public_key().as_ref()),
            Err(e) => ChainReport::Unavailable(e.to_string()),
        }
    }

    /// True when the chain is intact; breaks and read errors are logged and counted
    pub fn verify_chain_integrity(&self, wallet_id: &WalletId) -> bool {
        let report = self.verify_chain(wallet_id);

        match &report {
            ChainReport::Valid { records } => {
                tracing::debug!(wallet_id = %wallet_id, records, "Audit chain verified");
            }
            ChainReport::Broken(at) => {
                self.metrics.integrity_alerts.inc();
                tracing::error!(
                    wallet_id = %wallet_id,
                    index = at.index,
                    sequence = at.sequence,
                    transaction_id = %at.transaction_id,
                    kind = %at.kind,
                    "Audit chain broken"
                );
            }
            ChainReport::Unavailable(reason) => {
                self.metrics.integrity_alerts.inc();
                self.metrics.record_audit_error("verify_chain_integrity");
                tracing::error!(
                    wallet_id = %wallet_id,
                    audit_error = %reason,
                    "Audit chain could not be read"
                );
            }
        }

        report.is_valid()
    }
}
