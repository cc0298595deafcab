use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;

use super::TxnHistory;
use crate::constants::DERIVED_BASE_DEP_LABEL;
use crate::Dependency;
use crate::DependencyTarget;
use crate::KvDescriptor;
use crate::KvError;
use crate::Metadata;
use crate::RetryPolicy;
use crate::Value;
use crate::ValueOrigin;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TxnOperation {
    #[default]
    Undefined,
    Add,
    Modify,
    Delete,
}

impl fmt::Display for TxnOperation {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let s = match self {
            TxnOperation::Undefined => "UNDEFINED",
            TxnOperation::Add => "ADD",
            TxnOperation::Modify => "MODIFY",
            TxnOperation::Delete => "DELETE",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ValueState {
    /// Unknown to the engine
    #[default]
    NonExistent,
    /// Applied as requested by NB
    Configured,
    /// Created southbound by someone else, not managed by NB
    Obtained,
    /// Waiting for dependencies
    Pending,
    /// Rejected by validation
    Invalid,
    Failed,
    /// Failed, waiting for another attempt
    Retrying,
    /// No descriptor handles the key
    Unimplemented,
    /// Deleted by the last transaction
    Removed,
}

impl fmt::Display for ValueState {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let s = match self {
            ValueState::NonExistent => "non-existent",
            ValueState::Configured => "configured",
            ValueState::Obtained => "obtained",
            ValueState::Pending => "pending",
            ValueState::Invalid => "invalid",
            ValueState::Failed => "failed",
            ValueState::Retrying => "retrying",
            ValueState::Unimplemented => "unimplemented",
            ValueState::Removed => "removed",
        };
        f.write_str(s)
    }
}

/// Externally visible state of one key.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueStatus {
    pub key: String,
    pub state: ValueState,
    pub last_operation: TxnOperation,
    pub error: Option<String>,
    /// Labels of unsatisfied dependencies of a pending value
    pub details: Vec<String>,
}

impl ValueStatus {
    pub(crate) fn non_existent(key: &str) -> Self {
        Self {
            key: key.to_string(),
            state: ValueState::NonExistent,
            last_operation: TxnOperation::Undefined,
            error: None,
            details: Vec::new(),
        }
    }
}

/// Value as realized southbound.
#[derive(Debug, Clone)]
pub(crate) struct Applied {
    pub(crate) value: Value,
    pub(crate) metadata: Option<Metadata>,
}

/// Engine-side record of one key.
#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub(crate) key: String,
    pub(crate) descriptor: Option<Arc<KvDescriptor>>,
    /// Desired value (NB and derived) or the obtained value (SB)
    pub(crate) value: Option<Value>,
    pub(crate) origin: ValueOrigin,
    /// Present iff the value exists southbound; carries the metadata
    pub(crate) applied: Option<Applied>,
    pub(crate) state: ValueState,
    pub(crate) last_op: TxnOperation,
    pub(crate) error: Option<KvError>,
    pub(crate) derived_from: Option<String>,
    pub(crate) derived: Vec<String>,
    pub(crate) dependencies: Vec<Dependency>,
    /// Parking order of pending values
    pub(crate) pending_since: u64,
    pub(crate) retry: Option<RetryPolicy>,
    pub(crate) last_update: u64,
}

impl Node {
    pub(crate) fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            descriptor: None,
            value: None,
            origin: ValueOrigin::Unknown,
            applied: None,
            state: ValueState::NonExistent,
            last_op: TxnOperation::Undefined,
            error: None,
            derived_from: None,
            derived: Vec::new(),
            dependencies: Vec::new(),
            pending_since: 0,
            retry: None,
            last_update: 0,
        }
    }

    pub(crate) fn is_applied(&self) -> bool {
        self.applied.is_some()
    }

    pub(crate) fn is_derived(&self) -> bool {
        self.derived_from.is_some()
    }

    pub(crate) fn descriptor_name(&self) -> Option<&str> {
        self.descriptor.as_ref().map(|d| d.name.as_str())
    }

    /// True if `self` cannot stay applied without `other`.
    pub(crate) fn depends_on(
        &self,
        other: &str,
    ) -> bool {
        self.derived_from.as_deref() == Some(other)
            || self.dependencies.iter().any(|d| d.matches(other))
    }
}

/// State owned by the scheduler and guarded by its transaction lock.
pub(crate) struct SchedulerState {
    pub(crate) nodes: HashMap<String, Node>,
    pub(crate) last_seq_num: Option<u64>,
    pub(crate) resync_count: u64,
    pending_counter: u64,
    pub(crate) history: TxnHistory,
}

impl SchedulerState {
    pub(crate) fn new(history: TxnHistory) -> Self {
        Self {
            nodes: HashMap::new(),
            last_seq_num: None,
            resync_count: 0,
            pending_counter: 0,
            history,
        }
    }

    pub(crate) fn next_seq_num(&mut self) -> u64 {
        let seq = self.last_seq_num.map_or(0, |s| s + 1);
        self.last_seq_num = Some(seq);
        seq
    }

    pub(crate) fn next_pending_order(&mut self) -> u64 {
        self.pending_counter += 1;
        self.pending_counter
    }

    pub(crate) fn is_applied(
        &self,
        key: &str,
    ) -> bool {
        self.nodes.get(key).is_some_and(Node::is_applied)
    }

    /// Whether the last update of `key` came from transaction `seq_num`.
    pub(crate) fn is_updated_by(
        &self,
        key: &str,
        seq_num: u64,
    ) -> bool {
        self.nodes.get(key).is_some_and(|n| n.last_update == seq_num)
    }

    /// Whether `key` is derived, directly or transitively, from `base`.
    pub(crate) fn derives_from(
        &self,
        key: &str,
        base: &str,
    ) -> bool {
        let mut current = self.nodes.get(key).and_then(|n| n.derived_from.as_deref());
        let mut hops = 0;
        while let Some(parent) = current {
            if parent == base {
                return true;
            }
            hops += 1;
            if hops > self.nodes.len() {
                return false;
            }
            current = self.nodes.get(parent).and_then(|n| n.derived_from.as_deref());
        }
        false
    }

    /// Whether every dependency of `key` is met by an applied value outside
    /// `excluding`. A derived value also requires its base.
    pub(crate) fn deps_satisfied(
        &self,
        key: &str,
        excluding: &HashSet<String>,
    ) -> bool {
        let Some(node) = self.nodes.get(key) else {
            return false;
        };
        if let Some(base) = &node.derived_from {
            if excluding.contains(base) || !self.is_applied(base) {
                return false;
            }
        }
        node.dependencies
            .iter()
            .all(|dep| self.dependency_satisfied(key, dep, excluding))
    }

    fn dependency_satisfied(
        &self,
        key: &str,
        dep: &Dependency,
        excluding: &HashSet<String>,
    ) -> bool {
        match &dep.target {
            DependencyTarget::Key(target) => {
                target != key && !excluding.contains(target) && self.is_applied(target)
            }
            DependencyTarget::AnyOf(selector) => self.nodes.values().any(|n| {
                n.key != key && n.is_applied() && !excluding.contains(&n.key) && selector(&n.key)
            }),
        }
    }

    /// Labels of the unmet dependencies of `key`.
    pub(crate) fn missing_dependencies(
        &self,
        key: &str,
    ) -> Vec<String> {
        let Some(node) = self.nodes.get(key) else {
            return Vec::new();
        };
        let none = HashSet::new();
        let mut missing: Vec<String> = node
            .dependencies
            .iter()
            .filter(|dep| !self.dependency_satisfied(key, dep, &none))
            .map(|dep| dep.label.clone())
            .collect();
        if let Some(base) = &node.derived_from {
            if !self.is_applied(base) {
                missing.push(DERIVED_BASE_DEP_LABEL.to_string());
            }
        }
        missing
    }

    pub(crate) fn status(
        &self,
        key: &str,
    ) -> ValueStatus {
        let Some(node) = self.nodes.get(key) else {
            return ValueStatus::non_existent(key);
        };
        let details = if node.state == ValueState::Pending {
            self.missing_dependencies(key)
        } else {
            Vec::new()
        };
        ValueStatus {
            key: key.to_string(),
            state: node.state,
            last_operation: node.last_op,
            error: node.error.as_ref().map(|e| e.to_string()),
            details,
        }
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.nodes.values().filter(|n| n.state == ValueState::Pending).count()
    }

    /// Keys of `nodes` matching `filter`, sorted.
    pub(crate) fn sorted_keys<F>(
        &self,
        filter: F,
    ) -> Vec<String>
    where
        F: Fn(&Node) -> bool,
    {
        let mut keys: Vec<String> = self.nodes.values().filter(|n| filter(n)).map(|n| n.key.clone()).collect();
        keys.sort();
        keys
    }
}
