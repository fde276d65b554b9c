//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `wallets` - Wallet state (key: wallet_id)
//! - `owners` - Owner index (key: owner_id, value: wallet_id)
//! - `transactions` - Transaction log (key: wallet_id || 0x00 || timestamp || tx_id)
//! - `audit` - Audit chain (key: wallet_id || 0x00 || sequence)
//! - `snapshots` - Wallet snapshots (key: wallet_id || 0x00 || timestamp || snapshot_id)
//!
//! Wallet ids never contain control characters, so `wallet_id || 0x00` is an
//! unambiguous prefix. Timestamps are encoded so that byte order equals time
//! order, which lets history queries stop at the first key past the bound.

use super::{check_distinct_wallets, check_wallet_write, AuditStore, LedgerStore, WriteItem};
use crate::{
    audit::{AuditRecord, Snapshot},
    config::Config,
    types::{Transaction, WalletId},
    wallet::Wallet,
    Error, Result,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBCompactionStyle, Direction, IteratorMode,
    Options, WriteBatch, DB,
};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;

/// Column family names
const CF_WALLETS: &str = "wallets";
const CF_OWNERS: &str = "owners";
const CF_TRANSACTIONS: &str = "transactions";
const CF_AUDIT: &str = "audit";
const CF_SNAPSHOTS: &str = "snapshots";

/// Both ports backed by RocksDB
pub struct RocksStore {
    db: Arc<DB>,
    /// Serializes the read-check-write of conditional wallet writes
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for RocksStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksStore")
            .field("path", &self.db.path())
            .finish()
    }
}

impl RocksStore {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        // Create directory if not exists
        std::fs::create_dir_all(path)?;

        // Database options
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        // Tuning from config
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);
        db_opts.set_compaction_style(DBCompactionStyle::Level);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_WALLETS, Self::cf_options_point()),
            ColumnFamilyDescriptor::new(CF_OWNERS, Self::cf_options_point()),
            ColumnFamilyDescriptor::new(CF_TRANSACTIONS, Self::cf_options_log()),
            ColumnFamilyDescriptor::new(CF_AUDIT, Self::cf_options_log()),
            ColumnFamilyDescriptor::new(CF_SNAPSHOTS, Self::cf_options_log()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(path = ?path, "Opened RocksDB wallet store");

        Ok(Self {
            db: Arc::new(db),
            write_lock: Mutex::new(()),
        })
    }

    // Column family options

    fn cf_options_point() -> Options {
        let mut opts = Options::default();
        // Frequently read, use LZ4 for speed
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false); // 10 bits per key
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn cf_options_log() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts.set_bottommost_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    // Helper: get column family handle

    fn cf_handle(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    fn get_value<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf_handle(cf)?;
        match self.db.get_cf(&cf, key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Values of every key under `prefix`, in key order
    fn scan_prefix<T: DeserializeOwned>(&self, cf: &str, prefix: &[u8]) -> Result<Vec<T>> {
        let cf = self.cf_handle(cf)?;
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward));

        let mut values = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            values.push(bincode::deserialize(&value)?);
        }
        Ok(values)
    }

    fn owner_holder(&self, owner_id: &str) -> Result<Option<WalletId>> {
        let cf = self.cf_handle(CF_OWNERS)?;
        match self.db.get_cf(&cf, owner_id.as_bytes())? {
            Some(bytes) => {
                let id = String::from_utf8(bytes)
                    .map_err(|e| Error::Storage(format!("Corrupt owner index: {}", e)))?;
                Ok(Some(WalletId::parse(id)?))
            }
            None => Ok(None),
        }
    }

    fn put_wallet_in(&self, batch: &mut WriteBatch, wallet: &Wallet) -> Result<()> {
        let cf_wallets = self.cf_handle(CF_WALLETS)?;
        let cf_owners = self.cf_handle(CF_OWNERS)?;
        batch.put_cf(&cf_wallets, wallet.id().as_str(), bincode::serialize(wallet)?);
        batch.put_cf(&cf_owners, wallet.owner_id(), wallet.id().as_str());
        Ok(())
    }

    /// Close database (graceful shutdown)
    pub fn close(self) -> Result<()> {
        drop(self.db);
        tracing::info!("RocksDB closed gracefully");
        Ok(())
    }
}

impl LedgerStore for RocksStore {
    fn put_wallet(&self, wallet: &Wallet) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut batch = WriteBatch::default();
        self.put_wallet_in(&mut batch, wallet)?;
        self.db.write(batch)?;
        Ok(())
    }

    fn get_wallet(&self, wallet_id: &WalletId) -> Result<Option<Wallet>> {
        self.get_value(CF_WALLETS, wallet_id.as_str().as_bytes())
    }

    fn get_wallet_by_owner(&self, owner_id: &str) -> Result<Option<Wallet>> {
        match self.owner_holder(owner_id)? {
            Some(wallet_id) => self.get_wallet(&wallet_id),
            None => Ok(None),
        }
    }

    fn atomic_write(&self, items: &[WriteItem]) -> Result<()> {
        check_distinct_wallets(items)?;

        let _guard = self.write_lock.lock();
        let mut batch = WriteBatch::default();
        let cf_transactions = self.cf_handle(CF_TRANSACTIONS)?;

        // Owners claimed earlier in this batch count as taken
        let mut claimed: HashMap<&str, &WalletId> = HashMap::new();

        for item in items {
            match item {
                WriteItem::Wallet(wallet) => {
                    let stored = self.get_wallet(wallet.id())?;
                    let holder = match claimed.get(wallet.owner_id()) {
                        Some(id) => Some((*id).clone()),
                        None => self.owner_holder(wallet.owner_id())?,
                    };
                    check_wallet_write(wallet, stored.as_ref(), holder.as_ref())?;
                    claimed.insert(wallet.owner_id(), wallet.id());

                    self.put_wallet_in(&mut batch, &wallet.committed())?;
                }
                WriteItem::Transaction(tx) => {
                    let key = transaction_key(tx)?;
                    batch.put_cf(&cf_transactions, key, bincode::serialize(tx)?);
                }
            }
        }

        // Atomic commit
        self.db
            .write(batch)
            .map_err(|e| Error::CommitFailure(e.to_string()))?;

        Ok(())
    }

    fn query_transactions(
        &self,
        wallet_id: &WalletId,
        before: DateTime<Utc>,
    ) -> Result<Vec<Transaction>> {
        let cf = self.cf_handle(CF_TRANSACTIONS)?;
        let prefix = wallet_prefix(wallet_id);
        let bound = encode_timestamp(saturating_nanos(before));

        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix.as_slice(), Direction::Forward));

        let mut txs = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            // Keys are time-ordered within the prefix
            if key.len() < prefix.len() + 8 || &key[prefix.len()..prefix.len() + 8] >= &bound[..] {
                break;
            }
            txs.push(bincode::deserialize(&value)?);
        }
        Ok(txs)
    }

    fn scan_wallets(&self, limit: usize) -> Result<Vec<Wallet>> {
        let cf = self.cf_handle(CF_WALLETS)?;
        let mut wallets = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start).take(limit) {
            let (_, value) = item?;
            wallets.push(bincode::deserialize(&value)?);
        }
        Ok(wallets)
    }
}

impl AuditStore for RocksStore {
    fn append_audit_record(&self, record: &AuditRecord) -> Result<()> {
        let cf = self.cf_handle(CF_AUDIT)?;
        let key = audit_key(&record.wallet_id, record.sequence);

        let _guard = self.write_lock.lock();
        if self.db.get_pinned_cf(&cf, &key)?.is_some() {
            return Err(Error::Storage(format!(
                "audit record {} already exists for wallet {}",
                record.sequence, record.wallet_id
            )));
        }
        self.db.put_cf(&cf, &key, bincode::serialize(record)?)?;

        tracing::debug!(
            wallet_id = %record.wallet_id,
            sequence = record.sequence,
            "Audit record appended"
        );

        Ok(())
    }

    fn append_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let cf = self.cf_handle(CF_SNAPSHOTS)?;
        let mut key = wallet_prefix(&snapshot.wallet_id);
        key.extend_from_slice(&encode_timestamp(saturating_nanos(snapshot.timestamp)));
        key.extend_from_slice(snapshot.snapshot_id.as_bytes());
        self.db.put_cf(&cf, key, bincode::serialize(snapshot)?)?;
        Ok(())
    }

    fn query_audit_records(&self, wallet_id: &WalletId) -> Result<Vec<AuditRecord>> {
        self.scan_prefix(CF_AUDIT, &wallet_prefix(wallet_id))
    }

    fn query_snapshots(&self, wallet_id: &WalletId) -> Result<Vec<Snapshot>> {
        self.scan_prefix(CF_SNAPSHOTS, &wallet_prefix(wallet_id))
    }

    fn latest_audit_record(&self, wallet_id: &WalletId) -> Result<Option<AuditRecord>> {
        let cf = self.cf_handle(CF_AUDIT)?;
        let prefix = wallet_prefix(wallet_id);
        let last = audit_key(wallet_id, u64::MAX);

        let mut iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(last.as_slice(), Direction::Reverse));

        match iter.next() {
            Some(item) => {
                let (key, value) = item?;
                if key.starts_with(&prefix) {
                    Ok(Some(bincode::deserialize(&value)?))
                } else {
                    Ok(None)
                }
            }
            None => Ok(None),
        }
    }
}

// Key helpers

fn wallet_prefix(wallet_id: &WalletId) -> Vec<u8> {
    let mut key = wallet_id.as_str().as_bytes().to_vec();
    key.push(0); // Separator
    key
}

fn audit_key(wallet_id: &WalletId, sequence: u64) -> Vec<u8> {
    let mut key = wallet_prefix(wallet_id);
    key.extend_from_slice(&sequence.to_be_bytes());
    key
}

fn transaction_key(tx: &Transaction) -> Result<Vec<u8>> {
    let nanos = tx.timestamp.timestamp_nanos_opt().ok_or_else(|| {
        Error::InvalidArgument(format!("timestamp out of range: {}", tx.timestamp))
    })?;
    let mut key = wallet_prefix(&tx.wallet_id);
    key.extend_from_slice(&encode_timestamp(nanos));
    key.extend_from_slice(tx.id.as_uuid().as_bytes());
    Ok(key)
}

/// Big-endian with the sign bit flipped: byte order equals numeric order
fn encode_timestamp(nanos: i64) -> [u8; 8] {
    ((nanos as u64) ^ (1 << 63)).to_be_bytes()
}

fn saturating_nanos(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_nanos_opt().unwrap_or(if ts.timestamp() > 0 {
        i64::MAX
    } else {
        i64::MIN
    })
}
