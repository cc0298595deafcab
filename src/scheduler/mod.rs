//! Dependency-aware transaction scheduler.
//!
//! The [`KvScheduler`] owns the engine state (desired values, applied values
//! with their metadata, pending values) and processes one transaction at a
//! time. A transaction is resolved against the descriptor [`Registry`],
//! ordered by the dependencies its values declare, and applied through the
//! descriptor handlers. Per-key failures never abort the transaction; they
//! are retried under the transaction's retry policy and reported in
//! [`TxnResult::errors`]. The state is not held while waiting for a retry,
//! so other transactions and queries run in between.
//!
//! Resync transactions first refresh the applied view by dumping every
//! descriptor in dump order and then converge the SB towards the desired
//! state with the minimal set of operations.

mod exec;
mod node;
mod order;
mod queue;
mod record;
mod resync;
mod txn;

pub(crate) use exec::*;
pub(crate) use node::Applied;
pub(crate) use node::Node;
pub(crate) use node::SchedulerState;
pub use node::TxnOperation;
pub use node::ValueState;
pub use node::ValueStatus;
pub(crate) use order::*;
pub use queue::*;
pub use record::RecordedTxn;
pub use record::RecordedTxnOp;
pub(crate) use record::TxnHistory;
pub use record::TxnType;
pub use txn::*;

#[cfg(test)]
mod resync_test;

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use std::time::SystemTime;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::sleep;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::metrics::PENDING_VALUES;
use crate::metrics::TXN_COUNTER;
use crate::metrics::TXN_LATENCY;
use crate::DescriptorError;
use crate::KeySelector;
use crate::KeyValuePair;
use crate::KeyWithError;
use crate::KvWithMetadata;
use crate::Metadata;
use crate::Registry;
use crate::RegistryError;
use crate::Result;
use crate::RetryPolicy;
use crate::SchedulerConfig;
use crate::TxnError;
use crate::Value;
use crate::ValueOrigin;

/// Which view of the values `dump_values_*` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum View {
    /// Desired values as requested by NB
    Nb,
    /// Values freshly dumped from the SB
    Sb,
    /// Values the scheduler believes are applied
    Internal,
}

/// Failed dump of one descriptor during resync.
#[derive(Debug, Clone, PartialEq)]
pub struct DumpError {
    pub descriptor: String,
    pub error: DescriptorError,
}

#[derive(Debug, Clone, Default)]
pub struct TxnResult {
    pub seq_num: u64,
    /// Keys that failed; empty on full success
    pub errors: Vec<KeyWithError>,
    /// Descriptors whose dump failed during resync
    pub dump_errors: Vec<DumpError>,
    /// Southbound operations executed (or attempted)
    pub executed: Vec<RecordedTxnOp>,
}

impl TxnResult {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty() && self.dump_errors.is_empty()
    }
}

struct StatusWatcher {
    tx: mpsc::Sender<ValueStatus>,
    selector: Option<KeySelector>,
}

pub struct KvScheduler {
    registry: Arc<Registry>,
    state: tokio::sync::Mutex<SchedulerState>,
    config: SchedulerConfig,
    status_watchers: Mutex<Vec<StatusWatcher>>,
}

impl KvScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let registry = Arc::new(Registry::new(config.key_cache_size));
        Self::with_registry(config, registry)
    }

    pub fn with_registry(
        config: SchedulerConfig,
        registry: Arc<Registry>,
    ) -> Self {
        let history = TxnHistory::new(&config, SystemTime::now());
        Self {
            registry,
            state: tokio::sync::Mutex::new(SchedulerState::new(history)),
            config,
            status_watchers: Mutex::new(Vec::new()),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn register_descriptor(
        &self,
        descriptor: crate::KvDescriptor,
    ) {
        self.registry.register_descriptor(descriptor);
    }

    /// Processes the transaction inline.
    ///
    /// `Ok` with non-empty [`TxnResult::errors`] means the transaction was
    /// applied with partial failures. `Err` means it was not processed.
    pub async fn commit(
        &self,
        txn: Transaction,
    ) -> Result<TxnResult> {
        let (values, options) = txn.into_parts();
        if options.resync == ResyncType::DownstreamResync && !values.is_empty() {
            return Err(TxnError::DownstreamResyncWithChanges.into());
        }

        let mut state = self.state.lock().await;
        if options.resync == ResyncType::NotResync
            && !values.is_empty()
            && values.iter().all(|(key, _)| {
                self.registry.get_descriptor_for_key(key).is_none() && !state.nodes.contains_key(key)
            })
        {
            return Err(TxnError::NoMatchingDescriptor(values.len()).into());
        }

        let start = SystemTime::now();
        let timer = Instant::now();
        let seq_num = state.next_seq_num();

        let mut items: Vec<TxnItem> = values
            .iter()
            .map(|(key, value)| TxnItem::new(key.clone(), value.clone()))
            .collect();
        let mut dump_errors = Vec::new();
        if options.resync != ResyncType::NotResync {
            state.resync_count += 1;
            if options.resync == ResyncType::DownstreamResync {
                items = nb_view(&state);
            }
            let mut excluded = HashSet::new();
            if options.resync != ResyncType::UpstreamResync {
                let refresh = resync::refresh(&self.registry, &mut state, &items).await?;
                dump_errors = refresh.dump_errors;
                excluded = refresh.excluded;
            }
            items = resync::resync_items(&self.registry, &state, items, &excluded);
        }

        let ordered = order_items(&self.registry, &state, items);
        let outcome = {
            let mut executor = TxnExecutor::new(&self.registry, &mut state, seq_num, options.retry);
            executor.execute(ordered).await;
            executor.finish()
        };

        if outcome.errors.is_empty() {
            info!("Transaction {} successful ({} operations)", seq_num, outcome.executed.len());
        } else {
            warn!(
                "Transaction {} finished with {} errors ({} operations)",
                seq_num,
                outcome.errors.len(),
                outcome.executed.len()
            );
        }

        let txn_type = TxnType::NbTransaction;
        self.finalize(
            &mut state,
            RecordedTxn {
                seq_num,
                txn_type,
                resync_type: options.resync,
                description: options.description,
                start,
                stop: SystemTime::now(),
                values,
                executed: outcome.executed.clone(),
            },
            timer,
        );
        drop(state);
        self.notify_status(outcome.statuses);

        let mut executed = outcome.executed;
        let mut errors: BTreeMap<String, KeyWithError> =
            outcome.errors.into_iter().map(|e| (e.key.clone(), e)).collect();
        if let Some(policy) = options.retry {
            self.retry_failed(seq_num, policy, outcome.failed, &mut executed, &mut errors)
                .await;
        }

        Ok(TxnResult {
            seq_num,
            errors: errors.into_values().collect(),
            dump_errors,
            executed,
        })
    }

    /// Re-attempts the retriable failures of transaction `origin_seq` with
    /// backoff. Every attempt is a separate pass recorded in the history; the
    /// state lock is released while waiting for the next one.
    async fn retry_failed(
        &self,
        origin_seq: u64,
        policy: RetryPolicy,
        mut failed: Vec<String>,
        executed: &mut Vec<RecordedTxnOp>,
        errors: &mut BTreeMap<String, KeyWithError>,
    ) {
        let mut attempt = 0;
        while !failed.is_empty() && attempt < policy.max_count {
            attempt += 1;
            let delay = policy.delay(attempt);
            debug!(
                "Retrying {} failed values of transaction {} in {:?} (attempt {}/{})",
                failed.len(),
                origin_seq,
                delay,
                attempt,
                policy.max_count
            );
            sleep(delay).await;

            let mut state = self.state.lock().await;
            // A later update of the key supersedes the failed one.
            let retried: Vec<String> = std::mem::take(&mut failed)
                .into_iter()
                .filter(|key| state.is_updated_by(key, origin_seq))
                .collect();
            if retried.is_empty() {
                debug!("Failed values of transaction {} were updated since", origin_seq);
                break;
            }

            let start = SystemTime::now();
            let timer = Instant::now();
            let seq_num = state.next_seq_num();
            let outcome = {
                let mut executor =
                    TxnExecutor::for_retry(&self.registry, &mut state, seq_num, origin_seq, policy);
                executor.retry(&retried).await;
                if attempt == policy.max_count {
                    executor.give_up();
                }
                executor.finish()
            };

            for key in &retried {
                errors.remove(key);
            }
            errors.extend(outcome.errors.into_iter().map(|e| (e.key.clone(), e)));
            executed.extend(outcome.executed.iter().cloned());
            failed = outcome.failed;

            let values = retried
                .iter()
                .map(|key| (key.clone(), state.nodes.get(key).and_then(|n| n.value.clone())))
                .collect();
            self.finalize(
                &mut state,
                RecordedTxn {
                    seq_num,
                    txn_type: TxnType::RetryFailedOps,
                    resync_type: ResyncType::NotResync,
                    description: Some(format!("retry of transaction {origin_seq}")),
                    start,
                    stop: SystemTime::now(),
                    values,
                    executed: outcome.executed,
                },
                timer,
            );
            drop(state);
            self.notify_status(outcome.statuses);
        }
    }

    /// Full resync: the SB converges to exactly `desired`.
    pub async fn full_resync(
        &self,
        desired: Vec<KeyValuePair>,
        options: TxnOptions,
    ) -> Result<TxnResult> {
        let txn = desired
            .into_iter()
            .fold(Transaction::new(), |txn, kv| txn.put(kv.key, kv.value))
            .with_options(options.with_resync(ResyncType::FullResync));
        self.commit(txn).await
    }

    /// Records a change made in the SB by someone else. No CRUD is called
    /// for the key itself; values waiting for it are applied.
    pub async fn push_sb_notification(
        &self,
        key: &str,
        value: Option<Value>,
        metadata: Option<Metadata>,
    ) -> Result<TxnResult> {
        let mut state = self.state.lock().await;
        let start = SystemTime::now();
        let timer = Instant::now();
        let seq_num = state.next_seq_num();

        let outcome = {
            let mut executor = TxnExecutor::new(&self.registry, &mut state, seq_num, None);
            executor.apply_sb_notification(key, value.clone(), metadata).await;
            executor.finish()
        };
        debug!("SB notification for {} processed in transaction {}", key, seq_num);

        self.finalize(
            &mut state,
            RecordedTxn {
                seq_num,
                txn_type: TxnType::SbNotification,
                resync_type: ResyncType::NotResync,
                description: None,
                start,
                stop: SystemTime::now(),
                values: vec![(key.to_string(), value)],
                executed: outcome.executed.clone(),
            },
            timer,
        );
        drop(state);
        self.notify_status(outcome.statuses);

        Ok(TxnResult {
            seq_num,
            errors: outcome.errors,
            dump_errors: Vec::new(),
            executed: outcome.executed,
        })
    }

    pub async fn get_value_status(
        &self,
        key: &str,
    ) -> ValueStatus {
        self.state.lock().await.status(key)
    }

    /// Metadata of an applied value handled by `descriptor`.
    pub async fn get_metadata(
        &self,
        descriptor: &str,
        key: &str,
    ) -> Option<Metadata> {
        let state = self.state.lock().await;
        let node = state.nodes.get(key)?;
        if node.descriptor_name() != Some(descriptor) {
            return None;
        }
        node.applied.as_ref().and_then(|a| a.metadata.clone())
    }

    pub async fn dump_values_by_descriptor(
        &self,
        descriptor: &str,
        view: View,
    ) -> Result<Vec<KvWithMetadata>> {
        let descriptor = self
            .registry
            .get_descriptor(descriptor)
            .ok_or_else(|| RegistryError::UnknownDescriptor(descriptor.to_string()))?;
        let state = self.state.lock().await;

        let internal = internal_view(&state, &descriptor.name);
        match view {
            View::Internal => Ok(internal),
            View::Nb => {
                let mut values: Vec<KvWithMetadata> = state
                    .nodes
                    .values()
                    .filter(|n| n.descriptor_name() == Some(descriptor.name.as_str()))
                    .filter(|n| !n.is_derived() && n.origin == ValueOrigin::FromNb)
                    .filter_map(|n| {
                        n.value
                            .clone()
                            .map(|v| KvWithMetadata::new(n.key.clone(), v).with_origin(ValueOrigin::FromNb))
                    })
                    .collect();
                values.sort_by(|a, b| a.key.cmp(&b.key));
                Ok(values)
            }
            View::Sb => {
                // The state lock is held so no transaction runs during the dump.
                let dumped = descriptor
                    .handler
                    .dump(&internal)
                    .await
                    .map_err(|error| RegistryError::DumpFailed {
                        descriptor: descriptor.name.clone(),
                        error,
                    })?;
                Ok(dumped)
            }
        }
    }

    pub async fn dump_values_by_key_prefix(
        &self,
        prefix: &str,
        view: View,
    ) -> Result<Vec<KvWithMetadata>> {
        let mut values = Vec::new();
        for descriptor in self.registry.get_all_descriptors()? {
            let dumped = self.dump_values_by_descriptor(&descriptor.name, view).await?;
            values.extend(dumped.into_iter().filter(|kv| kv.key.starts_with(prefix)));
        }
        values.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(values)
    }

    /// Recorded transactions started within `[since, until]`.
    pub async fn transaction_history(
        &self,
        since: Option<SystemTime>,
        until: Option<SystemTime>,
    ) -> Vec<RecordedTxn> {
        self.state.lock().await.history.range(since, until)
    }

    pub async fn recorded_transaction(
        &self,
        seq_num: u64,
    ) -> Option<RecordedTxn> {
        self.state.lock().await.history.get(seq_num)
    }

    /// Subscribes to status changes of base values matching `selector` (all
    /// when `None`). Delivery never blocks; updates to a full channel are
    /// dropped.
    pub fn watch_value_status(
        &self,
        tx: mpsc::Sender<ValueStatus>,
        selector: Option<KeySelector>,
    ) {
        self.status_watchers.lock().push(StatusWatcher { tx, selector });
    }

    /// Waits until the transaction in progress (if any) is finished.
    pub async fn transaction_barrier(&self) {
        drop(self.state.lock().await);
    }

    fn finalize(
        &self,
        state: &mut SchedulerState,
        record: RecordedTxn,
        timer: Instant,
    ) {
        let txn_type = record.txn_type.as_str();
        TXN_COUNTER.with_label_values(&[txn_type]).inc();
        TXN_LATENCY
            .with_label_values(&[txn_type])
            .observe(timer.elapsed().as_secs_f64() * 1000.0);
        PENDING_VALUES.set(state.pending_count() as i64);
        state.history.record(record);
    }

    fn notify_status(
        &self,
        statuses: Vec<ValueStatus>,
    ) {
        if statuses.is_empty() {
            return;
        }
        let mut watchers = self.status_watchers.lock();
        watchers.retain(|w| !w.tx.is_closed());
        for status in statuses {
            for watcher in watchers.iter() {
                if watcher.selector.as_ref().is_some_and(|s| !s(&status.key)) {
                    continue;
                }
                match watcher.tx.try_send(status.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!("Status watcher is too slow, dropping update of {}", status.key);
                    }
                    Err(TrySendError::Closed(_)) => {}
                }
            }
        }
    }
}

/// Current NB desired values, as used by a downstream resync.
fn nb_view(state: &SchedulerState) -> Vec<TxnItem> {
    state
        .sorted_keys(|n| !n.is_derived() && n.origin == ValueOrigin::FromNb && n.value.is_some())
        .into_iter()
        .filter_map(|k| state.nodes.get(&k).map(|n| TxnItem::new(k.clone(), n.value.clone())))
        .collect()
}

fn internal_view(
    state: &SchedulerState,
    descriptor: &str,
) -> Vec<KvWithMetadata> {
    let mut values: Vec<KvWithMetadata> = state
        .nodes
        .values()
        .filter(|n| n.descriptor_name() == Some(descriptor))
        .filter_map(|n| {
            n.applied.as_ref().map(|a| KvWithMetadata {
                key: n.key.clone(),
                value: a.value.clone(),
                metadata: a.metadata.clone(),
                origin: n.origin,
            })
        })
        .collect();
    values.sort_by(|a, b| a.key.cmp(&b.key));
    values
}
