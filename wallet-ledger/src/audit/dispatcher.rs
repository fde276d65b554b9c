//! Fire-and-forget audit workers
//!
//! The business path hands committed transactions to an [`AuditDispatcher`]
//! and returns immediately. Each worker is a tokio task with its own bounded
//! mailbox; a wallet is always routed to the same worker, so its records are
//! appended in the order they were submitted.
//!
//! ```text
//!   Ledger (sync, per-wallet lock held)
//!        │ try_send                 hash(wallet_id) % workers
//!        ▼
//!   ┌──────────┐ ┌──────────┐ ┌──────────┐
//!   │ worker 0 │ │ worker 1 │ │ worker N │   bounded mpsc each
//!   └────┬─────┘ └────┬─────┘ └────┬─────┘
//!        └────────────┴────────────┘
//!                     ▼
//!          AuditChainService::audit_transaction
//! ```
//!
//! A full or closed mailbox rejects the task: it is logged and counted,
//! never retried and never blocks the caller.

use super::chain::AuditChainService;
use crate::{
    metrics::Metrics,
    types::{AuditContext, Transaction, WalletId},
    Error, Result,
};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Message sent to an audit worker
#[derive(Debug)]
pub enum AuditTask {
    /// Append the record for one committed transaction
    Record {
        /// Committed transaction
        transaction: Transaction,
        /// Context overriding the one on the transaction
        context: Option<AuditContext>,
    },

    /// Reply once everything queued before this message is done
    Flush {
        /// Completion signal
        response: oneshot::Sender<()>,
    },

    /// Stop after draining what is already queued
    Shutdown,
}

/// One worker's loop
struct AuditWorker {
    id: usize,
    service: Arc<AuditChainService>,
    mailbox: mpsc::Receiver<AuditTask>,
}

impl AuditWorker {
    async fn run(mut self) {
        tracing::debug!(worker = self.id, "Audit worker started");

        while let Some(task) = self.mailbox.recv().await {
            match task {
                AuditTask::Record {
                    transaction,
                    context,
                } => {
                    // Failures are logged and counted by the service
                    let _ = self
                        .service
                        .audit_transaction(&transaction, context.as_ref());
                }
                AuditTask::Flush { response } => {
                    let _ = response.send(());
                }
                AuditTask::Shutdown => break,
            }
        }

        tracing::debug!(worker = self.id, "Audit worker stopped");
    }
}

/// Handle for submitting audit work
#[derive(Clone, Debug)]
pub struct AuditDispatcher {
    senders: Arc<Vec<mpsc::Sender<AuditTask>>>,
    metrics: Metrics,
}

impl AuditDispatcher {
    /// Spawn `workers` tasks on the current tokio runtime
    pub fn spawn(
        service: Arc<AuditChainService>,
        workers: usize,
        queue_capacity: usize,
        metrics: Metrics,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let workers = workers.max(1);
        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);

        for id in 0..workers {
            // Bounded channel for backpressure
            let (tx, rx) = mpsc::channel(queue_capacity.max(1));
            let worker = AuditWorker {
                id,
                service: service.clone(),
                mailbox: rx,
            };
            handles.push(tokio::spawn(worker.run()));
            senders.push(tx);
        }

        tracing::info!(workers, queue_capacity, "Audit dispatcher started");

        (
            Self {
                senders: Arc::new(senders),
                metrics,
            },
            handles,
        )
    }

    fn shard(&self, wallet_id: &WalletId) -> &mpsc::Sender<AuditTask> {
        let mut hasher = DefaultHasher::new();
        wallet_id.hash(&mut hasher);
        let index = (hasher.finish() % self.senders.len() as u64) as usize;
        &self.senders[index]
    }

    /// Queue one transaction without waiting; `false` if it was rejected
    pub fn submit(&self, transaction: Transaction, context: Option<AuditContext>) -> bool {
        let sender = self.shard(&transaction.wallet_id);
        let wallet_id = transaction.wallet_id.clone();
        let transaction_id = transaction.id;

        match sender.try_send(AuditTask::Record {
            transaction,
            context,
        }) {
            Ok(()) => true,
            Err(e) => {
                let reason = match e {
                    mpsc::error::TrySendError::Full(_) => "queue full",
                    mpsc::error::TrySendError::Closed(_) => "worker stopped",
                };
                self.metrics.audit_rejected.inc();
                self.metrics.record_audit_error("dispatch");
                tracing::error!(
                    audit_error = reason,
                    wallet_id = %wallet_id,
                    transaction_id = %transaction_id,
                    "Audit task rejected"
                );
                false
            }
        }
    }

    /// Wait until every task queued so far has been processed
    pub async fn flush(&self) -> Result<()> {
        for sender in self.senders.iter() {
            let (tx, rx) = oneshot::channel();
            sender
                .send(AuditTask::Flush { response: tx })
                .await
                .map_err(|_| Error::Concurrency("Audit worker mailbox closed".to_string()))?;

            rx.await
                .map_err(|_| Error::Concurrency("Audit worker dropped flush".to_string()))?;
        }
        Ok(())
    }

    /// Ask every worker to stop once its queue is drained
    pub async fn shutdown(&self) -> Result<()> {
        for sender in self.senders.iter() {
            sender
                .send(AuditTask::Shutdown)
                .await
                .map_err(|_| Error::Concurrency("Audit worker mailbox closed".to_string()))?;
        }
        tracing::info!("Audit dispatcher shutting down");
        Ok(())
    }

    /// Number of workers
    pub fn workers(&self) -> usize {
        self.senders.len()
    }
}
