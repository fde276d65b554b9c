//! Wallet ledger service binary
//!
//! Usage: `wallet-ledger-server [config.toml]`. Without a file, settings come
//! from `WALLET_*` environment variables.

use anyhow::Context;
use std::sync::Arc;
use wallet_ledger::{config::LogFormat, Config, Ledger, ReconciliationScheduler};

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(&path)
            .with_context(|| format!("loading configuration from {}", path))?,
        None => Config::from_env().context("loading configuration from environment")?,
    };

    init_tracing(config.log_format);
    tracing::info!(
        service = %config.service_name,
        data_dir = %config.data_dir.display(),
        "Starting wallet ledger"
    );

    // Open ledger
    let ledger = Ledger::open(&config).context("opening ledger")?;
    tracing::info!("Ledger opened successfully");

    let scheduler = if config.reconciliation.enabled {
        let scheduler = Arc::new(ReconciliationScheduler::new(
            ledger.store(),
            ledger.audit(),
            config.reconciliation.clone(),
            ledger.metrics().clone(),
        ));
        Some(scheduler.spawn())
    } else {
        tracing::info!("Reconciliation disabled");
        None
    };

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("Shutting down wallet ledger");

    if let Some(handle) = scheduler {
        handle.shutdown().await?;
    }
    ledger.shutdown().await?;

    Ok(())
}
