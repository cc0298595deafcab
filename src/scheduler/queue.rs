use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tracing::debug;
use tracing::info;

use super::KvScheduler;
use super::Transaction;
use super::TxnResult;
use crate::utils::async_task::spawn_task;
use crate::Result;
use crate::TxnError;

struct QueuedTxn {
    txn: Transaction,
    result_tx: Option<oneshot::Sender<Result<TxnResult>>>,
}

/// Producer side of the transaction queue consumed by
/// [`KvScheduler::start`]. Cheap to clone.
#[derive(Clone)]
pub struct TxnQueue {
    tx: mpsc::Sender<QueuedTxn>,
}

impl TxnQueue {
    /// Enqueues the transaction and waits for its result.
    pub async fn commit(
        &self,
        txn: Transaction,
    ) -> Result<TxnResult> {
        let (result_tx, result_rx) = oneshot::channel();
        self.enqueue(QueuedTxn {
            txn,
            result_tx: Some(result_tx),
        })?;
        result_rx.await.map_err(|_| TxnError::WaitCanceled)?
    }

    /// Enqueues the transaction without waiting for its result.
    pub fn commit_nonblocking(
        &self,
        txn: Transaction,
    ) -> Result<()> {
        self.enqueue(QueuedTxn { txn, result_tx: None })
    }

    fn enqueue(
        &self,
        queued: QueuedTxn,
    ) -> Result<()> {
        self.tx.try_send(queued).map_err(|e| match e {
            TrySendError::Full(_) => TxnError::QueueFull.into(),
            TrySendError::Closed(_) => TxnError::SchedulerClosed.into(),
        })
    }
}

impl KvScheduler {
    /// Spawns the single transaction consumer and returns the queue feeding
    /// it. The consumer stops on shutdown or once every queue handle is
    /// dropped.
    pub fn start(
        self: &Arc<Self>,
        shutdown_signal: watch::Receiver<()>,
    ) -> TxnQueue {
        let (tx, rx) = mpsc::channel(self.config.txn_queue_size);
        let scheduler = self.clone();
        spawn_task(
            "txn_consumer",
            move || scheduler.consume_transactions(rx, shutdown_signal),
            None,
        );
        TxnQueue { tx }
    }

    async fn consume_transactions(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<QueuedTxn>,
        mut shutdown_signal: watch::Receiver<()>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                biased;
                _ = shutdown_signal.changed() => {
                    info!("Transaction consumer: shutdown signal received.");
                    return Ok(());
                }
                queued = rx.recv() => {
                    let Some(QueuedTxn { txn, result_tx }) = queued else {
                        debug!("Transaction queue closed");
                        return Ok(());
                    };
                    let result = self.commit(txn).await;
                    if let Some(result_tx) = result_tx {
                        let _ = result_tx.send(result);
                    }
                }
            }
        }
    }
}
