use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use super::ChangeEvent;
use super::ChangeResp;
use super::ChangeType;
use super::DoneChannel;
use super::KeyVal;
use super::KvIterator;
use super::ResyncEvent;
use super::WatchRegistration;
use super::Watcher;
use crate::utils::async_task::send_with_timeout;
use crate::utils::async_task::wait_with_timeout;
use crate::PipelineConfig;
use crate::PipelineError;
use crate::Result;
use crate::Value;

/// Last known revision of every propagated key.
#[derive(Debug, Default)]
pub struct PrevRevisions {
    revisions: HashMap<String, KeyVal>,
}

impl PrevRevisions {
    /// Stores the value under the next revision of the key and returns the
    /// previous value with the new revision.
    pub fn put(
        &mut self,
        key: &str,
        value: Value,
    ) -> (Option<KeyVal>, i64) {
        let revision = self.revisions.get(key).map_or(0, |prev| prev.revision + 1);
        let prev = self.revisions.insert(
            key.to_string(),
            KeyVal {
                key: key.to_string(),
                value,
                revision,
            },
        );
        (prev, revision)
    }

    pub fn put_with_revision(
        &mut self,
        key: &str,
        value: Value,
        revision: i64,
    ) {
        self.revisions.insert(
            key.to_string(),
            KeyVal {
                key: key.to_string(),
                value,
                revision,
            },
        );
    }

    pub fn del(
        &mut self,
        key: &str,
    ) -> Option<KeyVal> {
        self.revisions.remove(key)
    }

    pub fn get(
        &self,
        key: &str,
    ) -> Option<&KeyVal> {
        self.revisions.get(key)
    }

    pub fn cleanup(&mut self) {
        self.revisions.clear();
    }
}

struct Subscription {
    change_tx: mpsc::Sender<ChangeEvent>,
    resync_tx: mpsc::Sender<ResyncEvent>,
    prefixes: Vec<String>,
}

impl Subscription {
    fn watches(
        &self,
        key: &str,
    ) -> bool {
        self.prefixes.iter().any(|p| key.starts_with(p.as_str()))
    }
}

/// In-process [`Watcher`]: keeps the subscriptions and fans propagated data
/// out to them.
pub struct WatchRegistry {
    subscriptions: Arc<DashMap<String, Subscription>>,
    last_rev: Mutex<PrevRevisions>,
    config: PipelineConfig,
}

impl WatchRegistry {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            subscriptions: Arc::new(DashMap::new()),
            last_rev: Mutex::new(PrevRevisions::default()),
            config,
        }
    }

    pub fn subscription_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.subscriptions.iter().map(|s| s.key().clone()).collect();
        names.sort();
        names
    }

    /// Last propagated revision of `key`.
    pub fn last_revision(
        &self,
        key: &str,
    ) -> Option<i64> {
        self.last_rev.lock().get(key).map(|kv| kv.revision)
    }

    /// Sends the changes to every subscriber watching one of the keys
    /// (`None` deletes the key) and waits for all acknowledgements.
    ///
    /// Deletes of keys never propagated before are skipped. If the
    /// subscribers do not acknowledge within the change timeout, this logs
    /// and returns `Ok`.
    pub async fn propagate_changes(
        &self,
        data: &BTreeMap<String, Option<Value>>,
    ) -> Result<()> {
        let changes = self.track_revisions(data);
        let targets: Vec<(String, mpsc::Sender<ChangeEvent>, Vec<ChangeResp>)> = self
            .subscriptions
            .iter()
            .filter_map(|sub| {
                let selected: Vec<ChangeResp> = changes.iter().filter(|c| sub.watches(&c.key)).cloned().collect();
                (!selected.is_empty()).then(|| (sub.key().clone(), sub.change_tx.clone(), selected))
            })
            .collect();

        let mut errors = Vec::new();
        let mut acks = Vec::new();
        for (name, tx, changes) in targets {
            debug!("Propagating {} changes to {}", changes.len(), name);
            let (done, ack) = DoneChannel::new();
            let event = ChangeEvent { changes, done };
            match send_with_timeout(&name, &tx, event, self.config.notify_timeout()).await {
                Ok(()) => acks.push((name, ack)),
                Err(e) => errors.push(e.to_string()),
            }
        }

        let timeout = self.config.change_ack_timeout();
        let results = wait_with_timeout(
            "aggregated change callback",
            timeout,
            join_all(acks.into_iter().map(|(name, ack)| async move { (name, ack.await) })),
        )
        .await;
        for (name, result) in results.unwrap_or_default() {
            match result {
                Ok(Ok(())) => trace!("Subscriber {} acknowledged changes", name),
                Ok(Err(e)) => errors.push(format!("{name}: {e}")),
                Err(_) => debug!("Subscriber {} dropped the change event", name),
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::Aggregated(errors).into())
        }
    }

    /// Replaces the watched state of every subscriber with `data`. Each
    /// subscriber gets its own acknowledgement timeout.
    pub async fn propagate_resync(
        &self,
        data: &BTreeMap<String, Value>,
    ) -> Result<()> {
        {
            let mut last_rev = self.last_rev.lock();
            last_rev.cleanup();
            for (key, value) in data {
                last_rev.put_with_revision(key, value.clone(), 0);
            }
        }

        let targets: Vec<(String, mpsc::Sender<ResyncEvent>, Vec<String>)> = self
            .subscriptions
            .iter()
            .map(|sub| (sub.key().clone(), sub.resync_tx.clone(), sub.prefixes.clone()))
            .collect();

        let mut errors = Vec::new();
        for (name, tx, prefixes) in targets {
            let values: HashMap<String, KvIterator> = prefixes
                .into_iter()
                .map(|prefix| {
                    let kvs: Vec<KeyVal> = data
                        .iter()
                        .filter(|(key, _)| key.starts_with(prefix.as_str()))
                        .map(|(key, value)| KeyVal {
                            key: key.clone(),
                            value: value.clone(),
                            revision: 0,
                        })
                        .collect();
                    (prefix, KvIterator::new(kvs))
                })
                .collect();

            debug!("Propagating resync to {}", name);
            let (done, ack) = DoneChannel::new();
            if let Err(e) = send_with_timeout(&name, &tx, ResyncEvent { values, done }, self.config.notify_timeout()).await
            {
                errors.push(e.to_string());
                continue;
            }
            let what = format!("resync acknowledgement of {name}");
            match wait_with_timeout(&what, self.config.resync_ack_timeout(), ack).await {
                Some(Ok(Ok(()))) | None => {}
                Some(Ok(Err(e))) => errors.push(format!("{name}: {e}")),
                Some(Err(_)) => debug!("Subscriber {} dropped the resync event", name),
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::Aggregated(errors).into())
        }
    }

    fn track_revisions(
        &self,
        data: &BTreeMap<String, Option<Value>>,
    ) -> Vec<ChangeResp> {
        let mut last_rev = self.last_rev.lock();
        let mut changes = Vec::with_capacity(data.len());
        for (key, value) in data {
            match value {
                Some(value) => {
                    let (prev_value, revision) = last_rev.put(key, value.clone());
                    changes.push(ChangeResp {
                        key: key.clone(),
                        change_type: ChangeType::Put,
                        value: Some(value.clone()),
                        revision,
                        prev_value,
                    });
                }
                None => {
                    let Some(prev) = last_rev.del(key) else {
                        trace!("Skipping delete of unknown key {}", key);
                        continue;
                    };
                    changes.push(ChangeResp {
                        key: key.clone(),
                        change_type: ChangeType::Delete,
                        value: None,
                        revision: prev.revision + 1,
                        prev_value: Some(prev),
                    });
                }
            }
        }
        changes
    }
}

impl Watcher for WatchRegistry {
    fn watch(
        &self,
        name: &str,
        change_tx: mpsc::Sender<ChangeEvent>,
        resync_tx: mpsc::Sender<ResyncEvent>,
        prefixes: Vec<String>,
    ) -> Result<Box<dyn WatchRegistration>> {
        match self.subscriptions.entry(name.to_string()) {
            Entry::Occupied(_) => Err(PipelineError::AlreadyWatching(name.to_string()).into()),
            Entry::Vacant(entry) => {
                debug!("{} watching {:?}", name, prefixes);
                entry.insert(Subscription {
                    change_tx,
                    resync_tx,
                    prefixes,
                });
                Ok(Box::new(WatchDataReg {
                    name: name.to_string(),
                    subscriptions: self.subscriptions.clone(),
                }))
            }
        }
    }
}

/// Registration handle returned by [`WatchRegistry::watch`].
pub struct WatchDataReg {
    name: String,
    subscriptions: Arc<DashMap<String, Subscription>>,
}

impl WatchRegistration for WatchDataReg {
    fn close(&self) -> Result<()> {
        if self.subscriptions.remove(&self.name).is_none() {
            warn!("Subscription {} was already closed", self.name);
        }
        Ok(())
    }

    fn register(
        &self,
        resync_name: &str,
        prefix: &str,
    ) -> Result<()> {
        let mut sub = self
            .subscriptions
            .get_mut(resync_name)
            .ok_or_else(|| PipelineError::UnknownSubscription(resync_name.to_string()))?;
        if sub.prefixes.iter().any(|p| p == prefix) {
            return Err(PipelineError::PrefixExists(prefix.to_string()).into());
        }
        sub.prefixes.push(prefix.to_string());
        Ok(())
    }

    fn unregister(
        &self,
        prefix: &str,
    ) -> Result<()> {
        let mut sub = self
            .subscriptions
            .get_mut(&self.name)
            .ok_or_else(|| PipelineError::UnknownSubscription(self.name.clone()))?;
        let before = sub.prefixes.len();
        sub.prefixes.retain(|p| p != prefix);
        if sub.prefixes.len() == before {
            return Err(PipelineError::UnknownPrefix(prefix.to_string()).into());
        }
        Ok(())
    }
}
