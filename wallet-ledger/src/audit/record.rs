//! Audit chain entries and wallet snapshots

use crate::{
    crypto::{generate_uuid_v7, verify_signature, FieldHasher, KeyPair},
    money::Money,
    types::{AuditContext, Transaction, TransactionId, TransactionType, WalletId},
    wallet::Wallet,
};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Running end of one wallet's chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainTip {
    /// Sequence of the newest record
    pub sequence: u64,
    /// Its `current_hash`
    pub hash: String,
}

/// Append-only, hash-linked mirror of one transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Unique record id
    pub record_id: Uuid,

    /// Wallet whose chain this record extends
    pub wallet_id: WalletId,

    /// Position in the wallet's chain, starting at 0
    pub sequence: u64,

    /// Mirrored transaction
    pub transaction_id: TransactionId,

    /// Mirrored transaction type
    pub tx_type: TransactionType,

    /// Mirrored amount
    pub amount: Money,

    /// Counterparty (transfer legs only)
    pub related_wallet_id: Option<WalletId>,

    /// When the transaction committed
    pub transaction_timestamp: DateTime<Utc>,

    /// When the record was built
    pub recorded_at: DateTime<Utc>,

    /// Who/where/which request
    pub context: Option<AuditContext>,

    /// `current_hash` of the preceding record; `None` for the first record
    pub previous_hash: Option<String>,

    /// SHA-256 (hex) over every field above
    pub current_hash: String,

    /// Ed25519 signature (hex) over `current_hash`, when signing is enabled
    pub signature: Option<String>,
}

impl AuditRecord {
    /// Build the record that extends a chain ending at `tip`
    ///
    /// An explicit `context` wins over the one captured on the transaction.
    pub fn link(
        transaction: &Transaction,
        context: Option<&AuditContext>,
        tip: Option<&ChainTip>,
    ) -> Self {
        let mut record = Self {
            record_id: generate_uuid_v7(),
            wallet_id: transaction.wallet_id.clone(),
            sequence: tip.map_or(0, |t| t.sequence + 1),
            transaction_id: transaction.id,
            tx_type: transaction.tx_type,
            amount: transaction.amount,
            related_wallet_id: transaction.related_wallet_id.clone(),
            transaction_timestamp: transaction.timestamp,
            recorded_at: Utc::now(),
            context: context.cloned().or_else(|| transaction.context.clone()),
            previous_hash: tip.map(|t| t.hash.clone()),
            current_hash: String::new(),
            signature: None,
        };
        record.current_hash = record.compute_hash();
        record
    }

    /// Attach a signature over `current_hash`
    pub fn sign(&mut self, keypair: &KeyPair) {
        self.signature = Some(keypair.sign_hex(self.current_hash.as_bytes()));
    }

    /// Recompute the hash from the record's fields
    pub fn compute_hash(&self) -> String {
        let mut hasher = FieldHasher::new();
        hasher
            .field(self.record_id.as_bytes())
            .field(self.wallet_id.as_str())
            .field(self.sequence.to_be_bytes())
            .field(self.transaction_id.as_uuid().as_bytes())
            .field(self.tx_type.code())
            .field(self.amount.to_string())
            .optional(self.related_wallet_id.as_ref().map(WalletId::as_str))
            .field(timestamp_field(self.transaction_timestamp))
            .field(timestamp_field(self.recorded_at));
        hash_context(&mut hasher, self.context.as_ref());
        hasher.optional(self.previous_hash.as_deref());
        hasher.finish_hex()
    }

    /// True when `current_hash` matches the fields
    pub fn verify_hash(&self) -> bool {
        self.compute_hash() == self.current_hash
    }

    /// True when the record carries a valid signature by `public_key`
    pub fn verify_signature(&self, public_key: &[u8; 32]) -> bool {
        match &self.signature {
            Some(signature) => {
                verify_signature(self.current_hash.as_bytes(), signature, public_key)
            }
            None => false,
        }
    }

    /// The tip this record establishes
    pub fn tip(&self) -> ChainTip {
        ChainTip {
            sequence: self.sequence,
            hash: self.current_hash.clone(),
        }
    }
}

/// Point-in-time capture of a wallet's balance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// `snapshot-<epoch millis>-<random suffix>`
    pub snapshot_id: String,

    /// Captured wallet
    pub wallet_id: WalletId,

    /// Owner at capture time
    pub owner_id: String,

    /// Balance at capture time
    pub balance: Money,

    /// Wallet version at capture time
    pub wallet_version: u64,

    /// Capture time
    pub timestamp: DateTime<Utc>,

    /// Who/why
    pub context: Option<AuditContext>,

    /// SHA-256 (hex) over every field above
    pub content_hash: String,
}

impl Snapshot {
    /// Capture the wallet as it is now
    pub fn capture(wallet: &Wallet, context: Option<&AuditContext>) -> Self {
        let timestamp = Utc::now();
        let suffix = Uuid::new_v4().simple().to_string();

        let mut snapshot = Self {
            snapshot_id: format!("snapshot-{}-{}", timestamp.timestamp_millis(), &suffix[..8]),
            wallet_id: wallet.id().clone(),
            owner_id: wallet.owner_id().to_string(),
            balance: wallet.balance(),
            wallet_version: wallet.version(),
            timestamp,
            context: context.cloned(),
            content_hash: String::new(),
        };
        snapshot.content_hash = snapshot.compute_hash();
        snapshot
    }

    /// Recompute the content hash
    pub fn compute_hash(&self) -> String {
        let mut hasher = FieldHasher::new();
        hasher
            .field(&self.snapshot_id)
            .field(self.wallet_id.as_str())
            .field(&self.owner_id)
            .field(self.balance.to_string())
            .field(self.wallet_version.to_be_bytes())
            .field(timestamp_field(self.timestamp));
        hash_context(&mut hasher, self.context.as_ref());
        hasher.finish_hex()
    }

    /// True when `content_hash` matches the fields
    pub fn verify_hash(&self) -> bool {
        self.compute_hash() == self.content_hash
    }
}

fn timestamp_field(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn hash_context(hasher: &mut FieldHasher, context: Option<&AuditContext>) {
    let Some(context) = context else {
        hasher.optional(None::<&str>);
        return;
    };

    hasher
        .field("context")
        .optional(context.actor.as_deref())
        .optional(context.source_ip.as_deref())
        .optional(context.user_agent.as_deref())
        .field(&context.request_id)
        .field(timestamp_field(context.timestamp))
        .field((context.additional.len() as u64).to_be_bytes());
    for (key, value) in &context.additional {
        hasher.field(key).field(value);
    }
}
