use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Arc;

use tracing::debug;
use tracing::trace;
use tracing::warn;

use super::Applied;
use super::Node;
use super::RecordedTxnOp;
use super::SchedulerState;
use super::TxnItem;
use super::TxnOperation;
use super::ValueState;
use super::ValueStatus;
use crate::metrics::FAILED_OPERATIONS;
use crate::utils::topological_order;
use crate::DescriptorError;
use crate::KeyWithError;
use crate::KvDescriptor;
use crate::KvError;
use crate::Metadata;
use crate::Registry;
use crate::RetryPolicy;
use crate::Value;
use crate::ValueOrigin;

/// What happens to a value once it is deleted southbound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Removal {
    /// Forget the value
    Remove,
    /// Keep the desired value and wait for dependencies again
    Pend,
}

pub(crate) struct TxnOutcome {
    pub(crate) executed: Vec<RecordedTxnOp>,
    pub(crate) errors: Vec<KeyWithError>,
    /// Final status of every touched base value
    pub(crate) statuses: Vec<ValueStatus>,
    /// Keys waiting for another attempt, in failure order
    pub(crate) failed: Vec<String>,
}

/// Applies one pass of a transaction to the scheduler state.
///
/// Descriptor calls are awaited one at a time. Each submitted item gets one
/// attempt per pass; follow-up work (derived values, pending values whose
/// dependencies appeared) is settled after every item. Retries run as later
/// passes, each holding the state only for its own duration.
pub(crate) struct TxnExecutor<'a> {
    registry: &'a Registry,
    state: &'a mut SchedulerState,
    seq_num: u64,
    /// Transaction whose values this pass applies; stamped as `last_update`
    origin_seq: u64,
    retry: Option<RetryPolicy>,
    in_retry: bool,
    recreating: Option<String>,
    followups: VecDeque<TxnItem>,
    executed: Vec<RecordedTxnOp>,
    errors: BTreeMap<String, KeyWithError>,
    /// Keys failed with a retriable error, in failure order
    failed: Vec<String>,
    touched: BTreeSet<String>,
    removed: BTreeMap<String, ValueStatus>,
}

impl<'a> TxnExecutor<'a> {
    pub(crate) fn new(
        registry: &'a Registry,
        state: &'a mut SchedulerState,
        seq_num: u64,
        retry: Option<RetryPolicy>,
    ) -> Self {
        Self {
            registry,
            state,
            seq_num,
            origin_seq: seq_num,
            retry,
            in_retry: false,
            recreating: None,
            followups: VecDeque::new(),
            executed: Vec::new(),
            errors: BTreeMap::new(),
            failed: Vec::new(),
            touched: BTreeSet::new(),
            removed: BTreeMap::new(),
        }
    }

    /// Retry pass `seq_num` for the failures of transaction `origin_seq`.
    pub(crate) fn for_retry(
        registry: &'a Registry,
        state: &'a mut SchedulerState,
        seq_num: u64,
        origin_seq: u64,
        policy: RetryPolicy,
    ) -> Self {
        let mut executor = Self::new(registry, state, seq_num, Some(policy));
        executor.origin_seq = origin_seq;
        executor.in_retry = true;
        executor
    }

    /// Executes ordered items.
    pub(crate) async fn execute(
        &mut self,
        items: Vec<TxnItem>,
    ) {
        for item in items {
            self.apply_put(item).await;
            self.settle().await;
        }
    }

    pub(crate) fn finish(self) -> TxnOutcome {
        let statuses = self
            .touched
            .iter()
            .map(|key| match self.state.nodes.get(key) {
                Some(_) => self.state.status(key),
                None => self.removed.get(key).cloned().unwrap_or_else(|| ValueStatus::non_existent(key)),
            })
            .collect();
        TxnOutcome {
            executed: self.executed,
            errors: self.errors.into_values().collect(),
            statuses,
            failed: self.failed,
        }
    }

    /// Records a value obtained from (or removed in) the SB without calling
    /// any CRUD on it.
    pub(crate) async fn apply_sb_notification(
        &mut self,
        key: &str,
        value: Option<Value>,
        metadata: Option<Metadata>,
    ) {
        let Some(descriptor) = self.registry.get_descriptor_for_key(key) else {
            debug!("Ignoring SB notification for key {} without descriptor", key);
            return;
        };
        if let Some(node) = self.state.nodes.get(key) {
            if node.origin == ValueOrigin::FromNb || node.is_derived() {
                debug!("Ignoring SB notification for NB-managed key {}", key);
                return;
            }
        }

        match value {
            Some(value) => {
                let node = self.state.nodes.entry(key.to_string()).or_insert_with(|| Node::new(key));
                node.descriptor = Some(descriptor.clone());
                node.origin = ValueOrigin::FromSb;
                node.value = Some(value.clone());
                node.applied = Some(Applied {
                    value,
                    metadata: if descriptor.with_metadata { metadata } else { None },
                });
                node.state = ValueState::Obtained;
                node.error = None;
                node.last_update = self.origin_seq;
                self.touch(key);
            }
            None => self.remove_value(key, Removal::Remove).await,
        }
        self.settle().await;
    }

    async fn apply_put(
        &mut self,
        item: TxnItem,
    ) {
        let TxnItem {
            key,
            value,
            derived_from,
        } = item;
        let Some(value) = value else {
            self.apply_delete(&key).await;
            return;
        };

        if derived_from.is_none() && self.state.nodes.get(&key).is_some_and(Node::is_derived) {
            warn!("Value {} is derived and cannot be set directly", key);
            self.report(&key, TxnOperation::Modify, KvError::DerivedValue);
            return;
        }

        let descriptor = self.registry.get_descriptor_for_key(&key);
        let (operation, is_derived, applied) = {
            let node = self.state.nodes.entry(key.clone()).or_insert_with(|| Node::new(&key));
            node.value = Some(value.clone());
            node.origin = ValueOrigin::FromNb;
            node.descriptor = descriptor.clone();
            node.derived_from = derived_from;
            node.last_update = self.origin_seq;
            node.retry = self.retry;
            node.error = None;
            let operation = if node.is_applied() {
                TxnOperation::Modify
            } else {
                TxnOperation::Add
            };
            (operation, node.is_derived(), node.applied.clone())
        };
        self.touch(&key);

        let Some(descriptor) = descriptor else {
            if is_derived {
                // Property: no handler, exists together with its base.
                if let Some(node) = self.state.nodes.get_mut(&key) {
                    node.dependencies.clear();
                    node.applied = Some(Applied { value, metadata: None });
                    node.state = ValueState::Configured;
                    node.last_op = operation;
                }
                return;
            }
            debug!("No descriptor for key {}", key);
            if let Some(node) = self.state.nodes.get_mut(&key) {
                node.state = ValueState::Unimplemented;
                node.last_op = operation;
                node.error = Some(KvError::Unimplemented);
            }
            self.report(&key, operation, KvError::Unimplemented);
            return;
        };

        if let Err(e) = descriptor.handler.validate(&key, &value) {
            warn!("Value {} is invalid: {}", key, e);
            if let Some(node) = self.state.nodes.get_mut(&key) {
                node.state = ValueState::Invalid;
                node.last_op = operation;
                node.error = Some(KvError::Invalid(e.clone()));
            }
            FAILED_OPERATIONS
                .with_label_values(&[descriptor.name.as_str(), "VALIDATE"])
                .inc();
            self.report(&key, operation, KvError::Invalid(e));
            return;
        }

        let dependencies = descriptor.handler.dependencies(&key, &value);
        if let Some(node) = self.state.nodes.get_mut(&key) {
            node.dependencies = dependencies;
        }
        let satisfied = self.state.deps_satisfied(&key, &HashSet::new());

        let Some(applied) = applied else {
            if satisfied {
                self.do_add(&key, &descriptor).await;
            } else {
                self.park(&key, operation);
            }
            return;
        };

        if !satisfied {
            debug!("Dependencies of applied value {} are no longer satisfied", key);
            self.remove_value(&key, Removal::Pend).await;
            return;
        }

        if descriptor.handler.equivalent(&key, &applied.value, &value) {
            trace!("Value {} is unchanged", key);
            if let Some(node) = self.state.nodes.get_mut(&key) {
                node.state = ValueState::Configured;
            }
            self.errors.remove(&key);
            self.queue_derived(&key, &descriptor, &value);
            return;
        }

        let recreate =
            descriptor
                .handler
                .modify_with_recreate(&key, &applied.value, &value, applied.metadata.clone());
        if recreate {
            self.do_recreate(&key, &descriptor).await;
        } else {
            self.do_modify(&key, &descriptor, applied, value).await;
        }
    }

    /// Northbound delete request.
    async fn apply_delete(
        &mut self,
        key: &str,
    ) {
        let Some(node) = self.state.nodes.get_mut(key) else {
            trace!("Nothing to delete for key {}", key);
            return;
        };
        if node.is_derived() {
            warn!("Value {} is derived and cannot be deleted directly", key);
            self.report(key, TxnOperation::Delete, KvError::DerivedValue);
            return;
        }
        if node.origin == ValueOrigin::FromSb {
            debug!("Ignoring NB delete of obtained value {}", key);
            return;
        }

        node.value = None;
        node.last_op = TxnOperation::Delete;
        node.last_update = self.origin_seq;
        node.retry = self.retry;
        node.error = None;
        self.touch(key);
        self.remove_value(key, Removal::Remove).await;
    }

    async fn do_add(
        &mut self,
        key: &str,
        descriptor: &Arc<KvDescriptor>,
    ) {
        let Some((value, prev_state)) =
            self.state.nodes.get(key).and_then(|n| n.value.clone().map(|v| (v, n.state)))
        else {
            return;
        };

        debug!("Adding value {} (txn {})", key, self.seq_num);
        match descriptor.handler.add(key, &value).await {
            Ok(metadata) => {
                if let Some(node) = self.state.nodes.get_mut(key) {
                    node.applied = Some(Applied {
                        value: value.clone(),
                        metadata: if descriptor.with_metadata { metadata } else { None },
                    });
                    node.state = ValueState::Configured;
                    node.last_op = TxnOperation::Add;
                    node.error = None;
                }
                self.errors.remove(key);
                self.touch(key);
                self.record_op(key, TxnOperation::Add, None, Some(value.clone()), prev_state, None);
                self.queue_derived(key, descriptor, &value);
            }
            Err(err) => {
                self.fail(key, TxnOperation::Add, descriptor, err, prev_state, None, Some(value));
            }
        }
    }

    async fn do_modify(
        &mut self,
        key: &str,
        descriptor: &Arc<KvDescriptor>,
        applied: Applied,
        new_value: Value,
    ) {
        let prev_state = self.state.nodes.get(key).map_or(ValueState::NonExistent, |n| n.state);

        debug!("Modifying value {} (txn {})", key, self.seq_num);
        let result = descriptor
            .handler
            .modify(key, &applied.value, &new_value, applied.metadata.clone())
            .await;
        match result {
            Ok(metadata) => {
                if let Some(node) = self.state.nodes.get_mut(key) {
                    node.applied = Some(Applied {
                        value: new_value.clone(),
                        metadata: if descriptor.with_metadata { metadata } else { None },
                    });
                    node.state = ValueState::Configured;
                    node.last_op = TxnOperation::Modify;
                    node.error = None;
                }
                self.errors.remove(key);
                self.touch(key);
                self.record_op(
                    key,
                    TxnOperation::Modify,
                    Some(applied.value),
                    Some(new_value.clone()),
                    prev_state,
                    None,
                );
                for obsolete in self.queue_derived(key, descriptor, &new_value) {
                    self.remove_value(&obsolete, Removal::Remove).await;
                }
            }
            Err(DescriptorError::Unimplemented(_)) => {
                debug!("Descriptor {} cannot modify {}, re-creating it", descriptor.name, key);
                self.do_recreate(key, descriptor).await;
            }
            Err(err) => {
                self.fail(
                    key,
                    TxnOperation::Modify,
                    descriptor,
                    err,
                    prev_state,
                    Some(applied.value),
                    Some(new_value),
                );
            }
        }
    }

    /// Delete followed by add; dependents are pended and come back once the
    /// value is re-created.
    async fn do_recreate(
        &mut self,
        key: &str,
        descriptor: &Arc<KvDescriptor>,
    ) {
        self.recreating = Some(key.to_string());
        self.remove_value(key, Removal::Pend).await;
        if !self.state.is_applied(key) && self.state.deps_satisfied(key, &HashSet::new()) {
            self.do_add(key, descriptor).await;
        }
        self.recreating = None;
    }

    /// Deletes `root` together with its derived values; applied values that
    /// cannot stay without it are deleted first and pended.
    ///
    /// The plan stops at the first derived value of `root` that fails to be
    /// deleted: `root` stays applied and carries the error.
    async fn remove_value(
        &mut self,
        root: &str,
        how: Removal,
    ) {
        let plan = self.plan_removal(root, how);
        let root_how = plan.iter().find(|(key, _)| key == root).map(|(_, how)| *how);
        for (key, how) in plan {
            if self.do_delete(&key, how).await || key == root || !self.state.derives_from(&key, root) {
                continue;
            }
            if let Some(root_how) = root_how {
                // Refused while the derived value is still applied.
                self.do_delete(root, root_how).await;
            }
            break;
        }
    }

    fn plan_removal(
        &self,
        root: &str,
        how: Removal,
    ) -> Vec<(String, Removal)> {
        let mut plan = vec![(root.to_string(), how)];
        let mut removing: HashSet<String> = HashSet::from([root.to_string()]);
        let candidates = self
            .state
            .sorted_keys(|n| n.is_applied() && n.origin != ValueOrigin::FromSb);

        loop {
            let mut grown = false;
            let mut i = 0;
            while i < plan.len() {
                if let Some(node) = self.state.nodes.get(&plan[i].0) {
                    for derived in &node.derived {
                        if removing.insert(derived.clone()) {
                            plan.push((derived.clone(), Removal::Remove));
                            grown = true;
                        }
                    }
                }
                i += 1;
            }
            for key in &candidates {
                if !removing.contains(key) && !self.state.deps_satisfied(key, &removing) {
                    removing.insert(key.clone());
                    plan.push((key.clone(), Removal::Pend));
                    grown = true;
                }
            }
            if !grown {
                break;
            }
        }

        let mut edges = Vec::new();
        for (i, (key, _)) in plan.iter().enumerate() {
            let Some(node) = self.state.nodes.get(key) else {
                continue;
            };
            for (j, (other, _)) in plan.iter().enumerate() {
                if i != j && node.depends_on(other) {
                    edges.push((i, j));
                }
            }
        }
        let order = topological_order(plan.len(), &edges);
        let mut slots: Vec<Option<(String, Removal)>> = plan.into_iter().map(Some).collect();
        order
            .ordered
            .into_iter()
            .chain(order.cyclic)
            .filter_map(|i| slots[i].take())
            .collect()
    }

    /// Returns false if the value is still applied afterwards.
    async fn do_delete(
        &mut self,
        key: &str,
        how: Removal,
    ) -> bool {
        let Some(node) = self.state.nodes.get(key) else {
            return true;
        };
        let prev_state = node.state;
        let descriptor = node.descriptor.clone();
        let Some(applied) = node.applied.clone() else {
            match how {
                Removal::Remove => self.forget(key),
                Removal::Pend => self.pend(key),
            }
            return true;
        };
        // Obtained values and properties have nothing to delete southbound.
        let call_crud = node.origin != ValueOrigin::FromSb && descriptor.is_some();

        if let Some((derived, err)) = self.undeleted_derived(key) {
            warn!("Keeping value {}, its derived value {} was not deleted", key, derived);
            match &descriptor {
                Some(descriptor) => {
                    self.fail(key, TxnOperation::Delete, descriptor, err, prev_state, Some(applied.value), None)
                }
                None => self.report(key, TxnOperation::Delete, KvError::Descriptor(err)),
            }
            return false;
        }

        if let (true, Some(descriptor)) = (call_crud, &descriptor) {
            debug!("Deleting value {} (txn {})", key, self.seq_num);
            let result = descriptor
                .handler
                .delete(key, &applied.value, applied.metadata.clone())
                .await;
            if let Err(err) = result {
                self.fail(key, TxnOperation::Delete, descriptor, err, prev_state, Some(applied.value), None);
                return false;
            }
        }

        if let Some(node) = self.state.nodes.get_mut(key) {
            node.applied = None;
        }
        match how {
            Removal::Remove => self.forget(key),
            Removal::Pend => self.pend(key),
        }
        if call_crud {
            self.errors.remove(key);
            self.record_op(key, TxnOperation::Delete, Some(applied.value), None, prev_state, None);
        }
        true
    }

    /// First derived value of `key` still applied, with the error that kept
    /// it in place.
    fn undeleted_derived(
        &self,
        key: &str,
    ) -> Option<(String, DescriptorError)> {
        let node = self.state.nodes.get(key)?;
        let derived = node.derived.iter().find(|d| self.state.is_applied(d))?;
        let cause = match self.state.nodes.get(derived).and_then(|n| n.error.as_ref()) {
            Some(err) => format!("derived value {derived} was not deleted: {err}"),
            None => format!("derived value {derived} was not deleted"),
        };
        Some((derived.clone(), DescriptorError::failed(cause)))
    }

    /// Drops the node; the base of a derived value stops referencing it.
    fn forget(
        &mut self,
        key: &str,
    ) {
        let Some(node) = self.state.nodes.remove(key) else {
            return;
        };
        match &node.derived_from {
            Some(base) => {
                if let Some(base) = self.state.nodes.get_mut(base) {
                    base.derived.retain(|d| d != key);
                }
            }
            None => {
                self.touched.insert(key.to_string());
                self.removed.insert(
                    key.to_string(),
                    ValueStatus {
                        key: key.to_string(),
                        state: ValueState::Removed,
                        last_operation: TxnOperation::Delete,
                        error: None,
                        details: Vec::new(),
                    },
                );
            }
        }
    }

    fn pend(
        &mut self,
        key: &str,
    ) {
        let order = self.state.next_pending_order();
        if let Some(node) = self.state.nodes.get_mut(key) {
            node.state = ValueState::Pending;
            node.last_op = TxnOperation::Delete;
            node.pending_since = order;
        }
        self.touch(key);
    }

    fn park(
        &mut self,
        key: &str,
        operation: TxnOperation,
    ) {
        let order = self.state.next_pending_order();
        if let Some(node) = self.state.nodes.get_mut(key) {
            node.state = ValueState::Pending;
            node.last_op = operation;
            node.pending_since = order;
        }
        debug!(
            "Value {} is pending, missing dependencies: {:?}",
            key,
            self.state.missing_dependencies(key)
        );
    }

    /// Queues the derived values of `key` for application and returns the
    /// previously derived keys that are gone.
    fn queue_derived(
        &mut self,
        key: &str,
        descriptor: &Arc<KvDescriptor>,
        value: &Value,
    ) -> Vec<String> {
        let derived = descriptor.handler.derived_values(key, value);
        let keys: Vec<String> = derived.iter().map(|kv| kv.key.clone()).collect();
        let obsolete = match self.state.nodes.get_mut(key) {
            Some(node) => {
                let previous = std::mem::replace(&mut node.derived, keys.clone());
                previous.into_iter().filter(|k| !keys.contains(k)).collect()
            }
            None => Vec::new(),
        };
        for kv in derived {
            self.followups.push_back(TxnItem::derived(kv.key, kv.value, key));
        }
        obsolete
    }

    /// Applies queued derived values and pending values whose dependencies
    /// are now satisfied, until nothing changes.
    async fn settle(&mut self) {
        loop {
            while let Some(item) = self.followups.pop_front() {
                self.apply_put(item).await;
            }
            if !self.apply_ready_pending().await {
                break;
            }
        }
    }

    async fn apply_ready_pending(&mut self) -> bool {
        let none = HashSet::new();
        let mut ready: Vec<(u64, String)> = self
            .state
            .nodes
            .values()
            .filter(|n| n.state == ValueState::Pending && !n.is_applied() && n.value.is_some())
            .filter(|n| n.descriptor.is_some() && self.state.deps_satisfied(&n.key, &none))
            .map(|n| (n.pending_since, n.key.clone()))
            .collect();
        if ready.is_empty() {
            return false;
        }
        ready.sort();

        let mut attempted = false;
        for (_, key) in ready {
            let Some(node) = self.state.nodes.get(&key) else {
                continue;
            };
            if node.state != ValueState::Pending || node.is_applied() || !self.state.deps_satisfied(&key, &none) {
                continue;
            }
            let Some(descriptor) = node.descriptor.clone() else {
                continue;
            };
            debug!("Dependencies of pending value {} are satisfied", key);
            attempted = true;
            self.do_add(&key, &descriptor).await;
            while let Some(item) = self.followups.pop_front() {
                self.apply_put(item).await;
            }
        }
        attempted
    }

    /// Re-attempts `keys` failed by the origin transaction.
    pub(crate) async fn retry(
        &mut self,
        keys: &[String],
    ) {
        for key in keys {
            self.retry_key(key).await;
            self.settle().await;
        }
    }

    /// Marks values still waiting for a retry as failed.
    pub(crate) fn give_up(&mut self) {
        for key in std::mem::take(&mut self.failed) {
            if let Some(node) = self.state.nodes.get_mut(&key) {
                if node.state == ValueState::Retrying {
                    node.state = ValueState::Failed;
                }
            }
            self.touch(&key);
        }
    }

    async fn retry_key(
        &mut self,
        key: &str,
    ) {
        let Some(node) = self.state.nodes.get(key) else {
            return;
        };
        if !matches!(node.state, ValueState::Retrying | ValueState::Failed) {
            return;
        }
        let orphan = node.derived_from.as_ref().is_some_and(|base| {
            !self
                .state
                .nodes
                .get(base)
                .is_some_and(|b| b.derived.iter().any(|d| d == key))
        });

        if orphan || node.value.is_none() {
            self.remove_value(key, Removal::Remove).await;
            return;
        }
        let item = TxnItem {
            key: key.to_string(),
            value: node.value.clone(),
            derived_from: node.derived_from.clone(),
        };
        self.apply_put(item).await;
    }

    #[allow(clippy::too_many_arguments)]
    fn fail(
        &mut self,
        key: &str,
        operation: TxnOperation,
        descriptor: &KvDescriptor,
        err: DescriptorError,
        prev_state: ValueState,
        prev_value: Option<Value>,
        new_value: Option<Value>,
    ) {
        warn!("Failed to {} value {}: {}", operation, key, err);
        let will_retry =
            descriptor.handler.is_retriable(&err) && self.retry.is_some_and(|p| p.max_count > 0);
        if let Some(node) = self.state.nodes.get_mut(key) {
            node.state = if will_retry {
                ValueState::Retrying
            } else {
                ValueState::Failed
            };
            node.last_op = operation;
            node.error = Some(KvError::Descriptor(err.clone()));
        }
        FAILED_OPERATIONS
            .with_label_values(&[descriptor.name.as_str(), &operation.to_string()])
            .inc();

        self.touch(key);
        self.record_op(key, operation, prev_value, new_value, prev_state, Some(err.to_string()));
        self.report(key, operation, KvError::Descriptor(err));
        if will_retry && !self.failed.iter().any(|k| k == key) {
            self.failed.push(key.to_string());
        }
    }

    fn report(
        &mut self,
        key: &str,
        operation: TxnOperation,
        error: KvError,
    ) {
        self.errors.insert(
            key.to_string(),
            KeyWithError {
                key: key.to_string(),
                operation,
                error,
            },
        );
    }

    fn record_op(
        &mut self,
        key: &str,
        operation: TxnOperation,
        prev_value: Option<Value>,
        new_value: Option<Value>,
        prev_state: ValueState,
        error: Option<String>,
    ) {
        let (derived, new_state) = self
            .state
            .nodes
            .get(key)
            .map_or((false, ValueState::Removed), |n| (n.is_derived(), n.state));
        self.executed.push(RecordedTxnOp {
            operation,
            key: key.to_string(),
            derived,
            prev_value,
            new_value,
            prev_state,
            new_state,
            error,
            is_retry: self.in_retry,
            is_recreate: self.recreating.as_deref() == Some(key),
        });
    }

    fn touch(
        &mut self,
        key: &str,
    ) {
        if self.state.nodes.get(key).is_some_and(|n| !n.is_derived()) {
            self.touched.insert(key.to_string());
        }
    }
}
