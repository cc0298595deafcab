//! Northbound event pipeline.
//!
//! A [`Watcher`] delivers change and resync events for the watched key
//! prefixes over bounded channels. Every event carries a [`DoneChannel`]; the
//! consumer ([`Orchestrator`]) turns the event into a transaction and reports
//! the outcome through it. Producers wait for that acknowledgement only for a
//! bounded time, so a slow or departed subscriber never blocks them.

mod orchestrator;
mod watch_registry;

pub use orchestrator::*;
pub use watch_registry::*;


use std::collections::HashMap;
use std::fmt;

#[cfg(test)]
use mockall::automock;
use tokio::sync::mpsc;
use tokio::sync::oneshot;

use crate::Result;
use crate::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Put,
    Delete,
}

/// Value of a key at a given revision.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyVal {
    pub key: String,
    pub value: Value,
    pub revision: i64,
}

/// One changed key of a [`ChangeEvent`].
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeResp {
    pub key: String,
    pub change_type: ChangeType,
    /// `None` for deletes
    pub value: Option<Value>,
    pub revision: i64,
    pub prev_value: Option<KeyVal>,
}

/// Acknowledgement of one delivered event.
///
/// Dropping it without calling [`DoneChannel::done`] acknowledges nothing;
/// the producer then gives up after its timeout.
pub struct DoneChannel(Option<oneshot::Sender<Result<()>>>);

impl DoneChannel {
    pub fn new() -> (Self, oneshot::Receiver<Result<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self(Some(tx)), rx)
    }

    /// Channel nobody waits on.
    pub fn detached() -> Self {
        Self(None)
    }

    pub fn done(
        mut self,
        result: Result<()>,
    ) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(result);
        }
    }
}

impl fmt::Debug for DoneChannel {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str("DoneChannel")
    }
}

#[derive(Debug)]
pub struct ChangeEvent {
    pub changes: Vec<ChangeResp>,
    pub done: DoneChannel,
}

/// Snapshot of all watched values, one iterator per key prefix.
#[derive(Debug)]
pub struct ResyncEvent {
    pub values: HashMap<String, KvIterator>,
    pub done: DoneChannel,
}

#[derive(Debug)]
pub struct KvIterator {
    items: std::vec::IntoIter<KeyVal>,
}

impl KvIterator {
    pub fn new(items: Vec<KeyVal>) -> Self {
        Self {
            items: items.into_iter(),
        }
    }
}

impl Iterator for KvIterator {
    type Item = KeyVal;

    fn next(&mut self) -> Option<KeyVal> {
        self.items.next()
    }
}

/// Source of northbound configuration events.
#[cfg_attr(test, automock)]
pub trait Watcher: Send + Sync {
    /// Subscribes `name` to changes under `prefixes`.
    fn watch(
        &self,
        name: &str,
        change_tx: mpsc::Sender<ChangeEvent>,
        resync_tx: mpsc::Sender<ResyncEvent>,
        prefixes: Vec<String>,
    ) -> Result<Box<dyn WatchRegistration>>;
}

/// Handle of one subscription created by [`Watcher::watch`].
#[cfg_attr(test, automock)]
pub trait WatchRegistration: Send + Sync {
    /// Stops delivering events to the subscriber.
    fn close(&self) -> Result<()>;

    /// Adds `prefix` to the subscription named `resync_name`.
    fn register(
        &self,
        resync_name: &str,
        prefix: &str,
    ) -> Result<()>;

    fn unregister(
        &self,
        prefix: &str,
    ) -> Result<()>;
}
