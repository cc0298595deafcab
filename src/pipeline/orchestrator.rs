use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::ChangeEvent;
use super::ChangeType;
use super::ResyncEvent;
use super::WatchRegistration;
use super::Watcher;
use crate::utils::async_task::spawn_task;
use crate::FailedKeys;
use crate::KeyWithError;
use crate::KvScheduler;
use crate::KvSchedulerConfig;
use crate::PipelineConfig;
use crate::Result;
use crate::ResyncType;
use crate::RetryPolicy;
use crate::Transaction;
use crate::TxnError;
use crate::TxnOptions;
use crate::Value;

/// Single-key writes against the desired state.
#[async_trait]
pub trait Writer: Send + Sync {
    async fn put(
        &self,
        key: &str,
        value: Value,
    ) -> Result<()>;

    /// Returns whether the key was part of the desired state.
    async fn delete(
        &self,
        key: &str,
    ) -> Result<bool>;
}

/// Consumer of northbound events and owner of the desired-state snapshot.
///
/// Every northbound change, whatever its source, goes through
/// [`Orchestrator::push_data`].
pub struct Orchestrator {
    scheduler: Arc<KvScheduler>,
    store: tokio::sync::Mutex<BTreeMap<String, Value>>,
    config: PipelineConfig,
    retry: RetryPolicy,
    registration: parking_lot::Mutex<Option<Box<dyn WatchRegistration>>>,
}

impl Orchestrator {
    pub fn new(
        scheduler: Arc<KvScheduler>,
        config: &KvSchedulerConfig,
    ) -> Self {
        Self {
            scheduler,
            store: tokio::sync::Mutex::new(BTreeMap::new()),
            config: config.pipeline.clone(),
            retry: config.retry,
            registration: parking_lot::Mutex::new(None),
        }
    }

    pub fn scheduler(&self) -> &Arc<KvScheduler> {
        &self.scheduler
    }

    /// Subscribes `name` to the NB key prefixes of all registered
    /// descriptors and returns the receiving ends of the event channels.
    pub fn watch(
        &self,
        watcher: &dyn Watcher,
        name: &str,
    ) -> Result<(mpsc::Receiver<ChangeEvent>, mpsc::Receiver<ResyncEvent>)> {
        let prefixes = self.scheduler.registry().registered_nb_key_prefixes();
        if prefixes.is_empty() {
            warn!("No NB key prefixes registered");
        } else {
            info!("Starting watch for {} NB prefixes", prefixes.len());
        }
        for prefix in &prefixes {
            debug!("- watching NB prefix: {}", prefix);
        }

        let (change_tx, change_rx) = mpsc::channel(self.config.channel_buffer);
        let (resync_tx, resync_rx) = mpsc::channel(self.config.channel_buffer);
        let registration = watcher.watch(name, change_tx, resync_tx, prefixes)?;
        if let Some(previous) = self.registration.lock().replace(registration) {
            previous.close()?;
        }
        Ok((change_rx, resync_rx))
    }

    /// Watches and spawns the event consumer.
    pub fn start(
        self: &Arc<Self>,
        watcher: &dyn Watcher,
        name: &str,
        shutdown_signal: watch::Receiver<()>,
    ) -> Result<()> {
        let (change_rx, resync_rx) = self.watch(watcher, name)?;
        let orchestrator = self.clone();
        spawn_task(
            "nb_event_consumer",
            move || orchestrator.run(change_rx, resync_rx, shutdown_signal),
            None,
        );
        Ok(())
    }

    /// Closes the watch subscription, if any.
    pub fn close(&self) -> Result<()> {
        match self.registration.lock().take() {
            Some(registration) => registration.close(),
            None => Ok(()),
        }
    }

    /// Event loop: one event at a time, until shutdown or until the watcher
    /// drops its senders.
    pub async fn run(
        self: Arc<Self>,
        mut change_rx: mpsc::Receiver<ChangeEvent>,
        mut resync_rx: mpsc::Receiver<ResyncEvent>,
        mut shutdown_signal: watch::Receiver<()>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                biased;
                _ = shutdown_signal.changed() => {
                    info!("Event consumer: shutdown signal received.");
                    return Ok(());
                }
                event = change_rx.recv() => {
                    let Some(event) = event else {
                        debug!("Change channel closed");
                        return Ok(());
                    };
                    self.handle_change(event).await;
                }
                event = resync_rx.recv() => {
                    let Some(event) = event else {
                        debug!("Resync channel closed");
                        return Ok(());
                    };
                    self.handle_resync(event).await;
                }
            }
        }
    }

    async fn handle_change(
        &self,
        event: ChangeEvent,
    ) {
        let ChangeEvent { changes, done } = event;
        debug!("=> received CHANGE event ({} changes)", changes.len());

        let mut txn = Transaction::new().with_options(TxnOptions::default().with_retry(self.retry));
        for change in changes {
            debug!(" - {:?}: {:?} (rev: {})", change.change_type, change.key, change.revision);
            txn = match (change.change_type, change.value) {
                (ChangeType::Delete, _) => txn.delete(change.key),
                (ChangeType::Put, Some(value)) => txn.put(change.key, value),
                (ChangeType::Put, None) => {
                    error!("Put of {} carries no value", change.key);
                    continue;
                }
            };
        }
        done.done(self.push_and_collect(txn).await);
    }

    async fn handle_resync(
        &self,
        event: ResyncEvent,
    ) {
        let ResyncEvent { values, done } = event;
        debug!("=> received RESYNC event ({} prefixes)", values.len());

        let options = TxnOptions::default()
            .with_resync(ResyncType::FullResync)
            .with_retry(self.retry);
        let mut txn = Transaction::new().with_options(options);
        let mut count = 0;
        for (prefix, iter) in values {
            let before = count;
            for kv in iter {
                debug!(" -- key: {} (rev: {})", kv.key, kv.revision);
                txn = txn.put(kv.key, kv.value);
                count += 1;
            }
            debug!("- {:?} ({} items)", prefix, count - before);
        }
        debug!("Resync with {} items", count);
        done.done(self.push_and_collect(txn).await);
    }

    async fn push_and_collect(
        &self,
        txn: Transaction,
    ) -> Result<()> {
        let errors = self.push_data(txn).await?;
        if errors.is_empty() {
            Ok(())
        } else {
            Err(TxnError::FailedKeys(FailedKeys(errors)).into())
        }
    }

    /// Records the transaction values in the desired-state snapshot and
    /// commits them. A full resync replaces the snapshot.
    ///
    /// Returns the keys that failed; `Err` means nothing was committed.
    pub async fn push_data(
        &self,
        txn: Transaction,
    ) -> Result<Vec<KeyWithError>> {
        let mut store = self.store.lock().await;
        self.push_locked(&mut store, txn).await
    }

    async fn push_locked(
        &self,
        store: &mut BTreeMap<String, Value>,
        txn: Transaction,
    ) -> Result<Vec<KeyWithError>> {
        if txn.options().resync == ResyncType::FullResync {
            store.clear();
        }
        for (key, value) in txn.values() {
            match value {
                Some(value) => {
                    debug!(" - PUT: {:?}", key);
                    store.insert(key.clone(), value.clone());
                }
                None => {
                    debug!(" - DELETE: {:?}", key);
                    store.remove(key);
                }
            }
        }

        match self.scheduler.commit(txn).await {
            Ok(result) => {
                for e in &result.dump_errors {
                    warn!("Dump of {} failed: {}", e.descriptor, e.error);
                }
                if result.errors.is_empty() {
                    info!("Transaction {} successful!", result.seq_num);
                } else {
                    error!(
                        "Transaction {} finished with {} errors: {}",
                        result.seq_num,
                        result.errors.len(),
                        FailedKeys(result.errors.clone())
                    );
                }
                Ok(result.errors)
            }
            Err(e) => {
                error!("Transaction failed: {}", e);
                Err(e)
            }
        }
    }

    /// Snapshot of the desired state.
    pub async fn list_data(&self) -> BTreeMap<String, Value> {
        self.store.lock().await.clone()
    }
}

#[async_trait]
impl Writer for Orchestrator {
    async fn put(
        &self,
        key: &str,
        value: Value,
    ) -> Result<()> {
        let errors = self.push_data(Transaction::new().put(key, value)).await?;
        if errors.is_empty() {
            Ok(())
        } else {
            Err(TxnError::FailedKeys(FailedKeys(errors)).into())
        }
    }

    async fn delete(
        &self,
        key: &str,
    ) -> Result<bool> {
        let mut store = self.store.lock().await;
        let existed = store.contains_key(key);
        let errors = self.push_locked(&mut store, Transaction::new().delete(key)).await?;
        if errors.is_empty() {
            Ok(existed)
        } else {
            Err(TxnError::FailedKeys(FailedKeys(errors)).into())
        }
    }
}
