//! Reconciliation Engine Error Hierarchy
//!
//! Transaction-level failures (`Error`) are kept apart from per-key outcomes
//! (`KvError` inside [`KeyWithError`]), so callers can tell "nothing happened"
//! from "mostly happened, a few keys failed".

use std::fmt;
use std::time::Duration;

use config::ConfigError;

use crate::TxnOperation;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration loading and validation failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Descriptor registry failures
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Transaction-level failures (the transaction was not processed as a whole)
    #[error(transparent)]
    Txn(#[from] TxnError),

    /// Event pipeline delivery failures
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// Unrecoverable failures requiring process termination
    #[error("Fatal error: {0}")]
    Fatal(String),
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Dump dependencies of the listed descriptors form a cycle
    #[error("Cycle in dump dependencies of descriptors: {0:?}")]
    DumpDependencyCycle(Vec<String>),

    #[error("Descriptor {0} is not registered")]
    UnknownDescriptor(String),

    #[error("Dump of descriptor {descriptor} failed: {error}")]
    DumpFailed {
        descriptor: String,
        error: DescriptorError,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum TxnError {
    #[error("Transaction queue is full")]
    QueueFull,

    #[error("Scheduler is closed")]
    SchedulerClosed,

    /// The caller stopped waiting for the transaction result
    #[error("Waiting for transaction result was canceled")]
    WaitCanceled,

    #[error("Downstream resync combined with configuration changes")]
    DownstreamResyncWithChanges,

    /// None of the transaction keys is handled by a registered descriptor
    #[error("No descriptor is registered for any of the {0} transaction keys")]
    NoMatchingDescriptor(usize),

    /// Transaction was processed but some keys failed
    #[error("{0}")]
    FailedKeys(FailedKeys),
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Already watching under the name {0}")]
    AlreadyWatching(String),

    #[error("No subscription named {0}")]
    UnknownSubscription(String),

    #[error("Key prefix {0} is not watched")]
    UnknownPrefix(String),

    #[error("Key prefix {0} is already watched")]
    PrefixExists(String),

    #[error("Subscriber {name} did not acknowledge within {timeout:?}")]
    AckTimeout { name: String, timeout: Duration },

    #[error("Channel of subscriber {0} is closed")]
    ChannelClosed(String),

    /// Errors reported back by several subscribers
    #[error("{}", .0.join("; "))]
    Aggregated(Vec<String>),
}

/// Error returned by a descriptor handler.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DescriptorError {
    #[error("{0}")]
    Failed(String),

    /// The handler does not support the named operation
    #[error("operation {0} is not implemented")]
    Unimplemented(&'static str),

    #[error(transparent)]
    InvalidValue(#[from] InvalidValueError),
}

impl DescriptorError {
    pub fn failed(msg: impl Into<String>) -> Self {
        DescriptorError::Failed(msg.into())
    }
}

/// Rejection of a value by descriptor validation. Never retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidValueError {
    pub message: String,
    /// Names of the offending value fields, if known
    pub fields: Vec<String>,
}

impl InvalidValueError {
    pub fn new(
        message: impl Into<String>,
        fields: &[&str],
    ) -> Self {
        Self {
            message: message.into(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
        }
    }
}

impl fmt::Display for InvalidValueError {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self.fields.len() {
            0 => write!(f, "{}", self.message),
            1 => write!(f, "field {} is invalid: {}", self.fields[0], self.message),
            _ => write!(f, "fields {:?} are invalid: {}", self.fields, self.message),
        }
    }
}

impl std::error::Error for InvalidValueError {}

/// Per-key failure kinds.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum KvError {
    /// No registered descriptor selects the key
    #[error("no descriptor is registered for the key")]
    Unimplemented,

    #[error("invalid value: {0}")]
    Invalid(InvalidValueError),

    #[error(transparent)]
    Descriptor(DescriptorError),

    /// The key is a derived value and cannot be changed by the caller
    #[error("derived value cannot be changed directly")]
    DerivedValue,
}

impl KvError {
    pub fn is_invalid(&self) -> bool {
        matches!(self, KvError::Invalid(_))
    }
}

/// Outcome of one failed key in a transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyWithError {
    pub key: String,
    pub operation: TxnOperation,
    pub error: KvError,
}

impl fmt::Display for KeyWithError {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{} ({}): {}", self.key, self.operation, self.error)
    }
}

/// Key failures of a processed transaction, as one error value.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedKeys(pub Vec<KeyWithError>);

impl fmt::Display for FailedKeys {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "failed key-value pairs: [")?;
        for (i, kv) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{kv}")?;
        }
        write!(f, "]")
    }
}
