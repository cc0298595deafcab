use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;

use crate::RetryPolicy;
use crate::Value;

/// Kind of resynchronization a transaction performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ResyncType {
    /// Incremental change
    #[default]
    NotResync,
    /// Refresh SB state, then replace the whole NB state with the transaction values
    FullResync,
    /// Replace the whole NB state without refreshing SB state
    UpstreamResync,
    /// Refresh SB state and re-apply the current NB state
    DownstreamResync,
}

#[derive(Debug, Clone, Default)]
pub struct TxnOptions {
    pub resync: ResyncType,
    /// Failed keys are retried under this policy before being reported
    pub retry: Option<RetryPolicy>,
    pub description: Option<String>,
}

impl TxnOptions {
    pub fn with_resync(
        mut self,
        resync: ResyncType,
    ) -> Self {
        self.resync = resync;
        self
    }

    pub fn with_retry(
        mut self,
        policy: RetryPolicy,
    ) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn with_retry_default(self) -> Self {
        self.with_retry(RetryPolicy::default())
    }

    pub fn with_description(
        mut self,
        description: impl Into<String>,
    ) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Batch of northbound changes. `None` deletes the key.
///
/// Setting the same key twice keeps the submission position of the first
/// write and the value of the last one.
#[derive(Debug, Clone, Default)]
pub struct Transaction {
    values: Vec<(String, Option<Value>)>,
    positions: HashMap<String, usize>,
    options: TxnOptions,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(
        mut self,
        options: TxnOptions,
    ) -> Self {
        self.options = options;
        self
    }

    pub fn set_value(
        mut self,
        key: impl Into<String>,
        value: Option<Value>,
    ) -> Self {
        let key = key.into();
        match self.positions.get(&key) {
            Some(&pos) => self.values[pos].1 = value,
            None => {
                self.positions.insert(key.clone(), self.values.len());
                self.values.push((key, value));
            }
        }
        self
    }

    pub fn put(
        self,
        key: impl Into<String>,
        value: Value,
    ) -> Self {
        self.set_value(key, Some(value))
    }

    pub fn delete(
        self,
        key: impl Into<String>,
    ) -> Self {
        self.set_value(key, None)
    }

    pub fn values(&self) -> &[(String, Option<Value>)] {
        &self.values
    }

    pub fn options(&self) -> &TxnOptions {
        &self.options
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub(crate) fn into_parts(self) -> (Vec<(String, Option<Value>)>, TxnOptions) {
        (self.values, self.options)
    }
}

/// One key of a transaction being executed.
#[derive(Debug, Clone)]
pub(crate) struct TxnItem {
    pub(crate) key: String,
    pub(crate) value: Option<Value>,
    /// Base key when the item is a derived value
    pub(crate) derived_from: Option<String>,
}

impl TxnItem {
    pub(crate) fn new(
        key: String,
        value: Option<Value>,
    ) -> Self {
        Self {
            key,
            value,
            derived_from: None,
        }
    }

    pub(crate) fn derived(
        key: String,
        value: Value,
        base: &str,
    ) -> Self {
        Self {
            key,
            value: Some(value),
            derived_from: Some(base.to_string()),
        }
    }

    pub(crate) fn is_put(&self) -> bool {
        self.value.is_some()
    }
}
