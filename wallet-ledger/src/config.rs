//! Configuration for the wallet ledger

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Log output format
    pub log_format: LogFormat,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Audit chain configuration
    pub audit: AuditConfig,

    /// Periodic reconciliation configuration
    pub reconciliation: ReconciliationConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/wallet-ledger"),
            service_name: "wallet-ledger".to_string(),
            log_format: LogFormat::Json,
            rocksdb: RocksDBConfig::default(),
            audit: AuditConfig::default(),
            reconciliation: ReconciliationConfig::default(),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per line
    Json,
    /// Human-readable multi-line output
    Pretty,
}

impl std::str::FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            other => Err(Error::Config(format!("Unknown log format: {}", other))),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 4,
            max_background_jobs: 4,
            enable_statistics: false,
        }
    }
}

/// Audit chain configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Number of audit workers; each wallet is pinned to one
    pub workers: usize,

    /// Mailbox capacity per worker
    pub queue_capacity: usize,

    /// Wallet snapshots on/off
    pub snapshot_enabled: bool,

    /// Hex-encoded 32-byte Ed25519 seed; records are signed when set
    pub signing_seed: Option<String>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 500,
            snapshot_enabled: true,
            signing_seed: None,
        }
    }
}

/// Periodic reconciliation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    /// Master switch for both passes
    pub enabled: bool,

    /// Wallets fetched per pass
    pub batch_size: usize,

    /// Seconds between snapshot passes
    pub snapshot_interval_secs: u64,

    /// Seconds between integrity passes
    pub integrity_interval_secs: u64,

    /// Delay of the first integrity pass relative to the first snapshot pass
    pub initial_delay_secs: u64,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: 100,
            snapshot_interval_secs: 86_400, // daily
            integrity_interval_secs: 86_400,
            initial_delay_secs: 3_600, // integrity runs an hour after snapshots
        }
    }
}

impl ReconciliationConfig {
    /// Snapshot cadence
    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }

    /// Integrity cadence
    pub fn integrity_interval(&self) -> Duration {
        Duration::from_secs(self.integrity_interval_secs)
    }

    /// Offset of the integrity loop
    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("WALLET_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(format) = std::env::var("WALLET_LOG_FORMAT") {
            config.log_format = format.parse()?;
        }

        if let Ok(workers) = std::env::var("WALLET_AUDIT_WORKERS") {
            config.audit.workers = parse_env("WALLET_AUDIT_WORKERS", &workers)?;
        }

        if let Ok(capacity) = std::env::var("WALLET_AUDIT_QUEUE_CAPACITY") {
            config.audit.queue_capacity = parse_env("WALLET_AUDIT_QUEUE_CAPACITY", &capacity)?;
        }

        if let Ok(enabled) = std::env::var("WALLET_AUDIT_SNAPSHOT_ENABLED") {
            config.audit.snapshot_enabled = parse_env("WALLET_AUDIT_SNAPSHOT_ENABLED", &enabled)?;
        }

        if let Ok(seed) = std::env::var("WALLET_AUDIT_SIGNING_SEED") {
            config.audit.signing_seed = Some(seed);
        }

        if let Ok(enabled) = std::env::var("WALLET_RECONCILIATION_ENABLED") {
            config.reconciliation.enabled = parse_env("WALLET_RECONCILIATION_ENABLED", &enabled)?;
        }

        if let Ok(batch) = std::env::var("WALLET_RECONCILIATION_BATCH_SIZE") {
            config.reconciliation.batch_size = parse_env("WALLET_RECONCILIATION_BATCH_SIZE", &batch)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall or disable the audit path
    pub fn validate(&self) -> Result<()> {
        if self.audit.workers == 0 {
            return Err(Error::Config("audit.workers must be at least 1".to_string()));
        }
        if self.audit.queue_capacity == 0 {
            return Err(Error::Config("audit.queue_capacity must be at least 1".to_string()));
        }
        if self.reconciliation.batch_size == 0 {
            return Err(Error::Config(
                "reconciliation.batch_size must be at least 1".to_string(),
            ));
        }
        if self.reconciliation.snapshot_interval_secs == 0
            || self.reconciliation.integrity_interval_secs == 0
        {
            return Err(Error::Config(
                "reconciliation intervals must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::Config(format!("Invalid {}: {}", name, e)))
}
