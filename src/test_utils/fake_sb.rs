//! In-memory southbound system and a configurable descriptor handler on top
//! of it.
//!
//! All handlers built over one [`FakeSouthbound`] share its call log, so the
//! order of CRUD calls across descriptors can be asserted.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::Dependency;
use crate::DescriptorError;
use crate::DescriptorHandler;
use crate::InvalidValueError;
use crate::KeyValuePair;
use crate::KvDescriptor;
use crate::KvWithMetadata;
use crate::Metadata;
use crate::TxnOperation;
use crate::Value;
use crate::ValueOrigin;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SbCall {
    Add(String),
    Modify(String),
    /// Key and the metadata id handed over by the scheduler
    Delete(String, Option<u64>),
    /// Key prefix of the dumped handler
    Dump(String),
}

#[derive(Debug, Clone)]
pub struct SbValue {
    pub value: Value,
    /// Metadata handed out when the value was created
    pub id: u64,
    pub origin: ValueOrigin,
}

#[derive(Default)]
struct SbState {
    values: BTreeMap<String, SbValue>,
    calls: Vec<SbCall>,
    failures: HashMap<(String, TxnOperation), usize>,
    dump_failures: HashSet<String>,
    next_id: u64,
}

#[derive(Default)]
pub struct FakeSouthbound {
    state: Mutex<SbState>,
}

impl FakeSouthbound {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<SbCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn value(
        &self,
        key: &str,
    ) -> Option<Value> {
        self.state.lock().values.get(key).map(|v| v.value.clone())
    }

    pub fn id_of(
        &self,
        key: &str,
    ) -> Option<u64> {
        self.state.lock().values.get(key).map(|v| v.id)
    }

    pub fn keys(&self) -> Vec<String> {
        self.state.lock().values.keys().cloned().collect()
    }

    /// Change made southbound behind the scheduler's back.
    pub fn inject(
        &self,
        key: &str,
        value: Value,
        origin: ValueOrigin,
    ) -> u64 {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.values.insert(key.to_string(), SbValue { value, id, origin });
        id
    }

    pub fn remove(
        &self,
        key: &str,
    ) {
        self.state.lock().values.remove(key);
    }

    /// Makes the next `times` calls of `operation` on `key` fail.
    pub fn fail(
        &self,
        key: &str,
        operation: TxnOperation,
        times: usize,
    ) {
        self.state.lock().failures.insert((key.to_string(), operation), times);
    }

    pub fn fail_dump(
        &self,
        prefix: &str,
    ) {
        self.state.lock().dump_failures.insert(prefix.to_string());
    }

    fn check_failure(
        state: &mut SbState,
        key: &str,
        operation: TxnOperation,
    ) -> Result<(), DescriptorError> {
        if let Some(left) = state.failures.get_mut(&(key.to_string(), operation)) {
            if *left > 0 {
                *left -= 1;
                return Err(DescriptorError::failed(format!("injected {operation} failure")));
            }
        }
        Ok(())
    }
}

type DepsFn = Arc<dyn Fn(&str, &Value) -> Vec<Dependency> + Send + Sync>;
type DerivedFn = Arc<dyn Fn(&str, &Value) -> Vec<KeyValuePair> + Send + Sync>;

/// Handler of all keys under one prefix of a [`FakeSouthbound`].
#[derive(Clone)]
pub struct FakeHandler {
    sb: Arc<FakeSouthbound>,
    prefix: String,
    dependencies: Option<DepsFn>,
    derived: Option<DerivedFn>,
    dumpable: bool,
    modifiable: bool,
    recreate_on: Option<String>,
    reject_field: Option<String>,
    retriable: bool,
}

impl FakeHandler {
    pub fn new(
        sb: &Arc<FakeSouthbound>,
        prefix: &str,
    ) -> Self {
        Self {
            sb: sb.clone(),
            prefix: prefix.to_string(),
            dependencies: None,
            derived: None,
            dumpable: false,
            modifiable: false,
            recreate_on: None,
            reject_field: None,
            retriable: true,
        }
    }

    pub fn with_dependencies(
        mut self,
        f: impl Fn(&str, &Value) -> Vec<Dependency> + Send + Sync + 'static,
    ) -> Self {
        self.dependencies = Some(Arc::new(f));
        self
    }

    pub fn with_derived(
        mut self,
        f: impl Fn(&str, &Value) -> Vec<KeyValuePair> + Send + Sync + 'static,
    ) -> Self {
        self.derived = Some(Arc::new(f));
        self
    }

    pub fn dumpable(mut self) -> Self {
        self.dumpable = true;
        self
    }

    pub fn modifiable(mut self) -> Self {
        self.modifiable = true;
        self
    }

    /// Changes of `field` are applied as delete followed by add.
    pub fn recreate_on(
        mut self,
        field: &str,
    ) -> Self {
        self.recreate_on = Some(field.to_string());
        self
    }

    /// Values carrying `field` fail validation.
    pub fn rejecting(
        mut self,
        field: &str,
    ) -> Self {
        self.reject_field = Some(field.to_string());
        self
    }

    pub fn non_retriable(mut self) -> Self {
        self.retriable = false;
        self
    }

    pub fn descriptor(
        self,
        name: &str,
    ) -> KvDescriptor {
        let prefix = self.prefix.clone();
        KvDescriptor::new(name, KvDescriptor::prefix_selector(prefix.clone()), Arc::new(self))
            .with_nb_key_prefix(prefix)
    }
}

fn metadata_id(metadata: &Option<Metadata>) -> Option<u64> {
    metadata.as_ref().and_then(|m| m.downcast_ref::<u64>().copied())
}

#[async_trait]
impl DescriptorHandler for FakeHandler {
    async fn add(
        &self,
        key: &str,
        value: &Value,
    ) -> Result<Option<Metadata>, DescriptorError> {
        let mut state = self.sb.state.lock();
        state.calls.push(SbCall::Add(key.to_string()));
        FakeSouthbound::check_failure(&mut state, key, TxnOperation::Add)?;
        state.next_id += 1;
        let id = state.next_id;
        state.values.insert(
            key.to_string(),
            SbValue {
                value: value.clone(),
                id,
                origin: ValueOrigin::Unknown,
            },
        );
        Ok(Some(Metadata::new(id)))
    }

    async fn delete(
        &self,
        key: &str,
        _value: &Value,
        metadata: Option<Metadata>,
    ) -> Result<(), DescriptorError> {
        let mut state = self.sb.state.lock();
        state.calls.push(SbCall::Delete(key.to_string(), metadata_id(&metadata)));
        FakeSouthbound::check_failure(&mut state, key, TxnOperation::Delete)?;
        state.values.remove(key);
        Ok(())
    }

    async fn modify(
        &self,
        key: &str,
        _old_value: &Value,
        new_value: &Value,
        metadata: Option<Metadata>,
    ) -> Result<Option<Metadata>, DescriptorError> {
        if !self.modifiable {
            return Err(DescriptorError::Unimplemented("modify"));
        }
        let mut state = self.sb.state.lock();
        state.calls.push(SbCall::Modify(key.to_string()));
        FakeSouthbound::check_failure(&mut state, key, TxnOperation::Modify)?;
        if let Some(v) = state.values.get_mut(key) {
            v.value = new_value.clone();
        }
        Ok(metadata)
    }

    fn modify_with_recreate(
        &self,
        _key: &str,
        old_value: &Value,
        new_value: &Value,
        _metadata: Option<Metadata>,
    ) -> bool {
        self.recreate_on
            .as_ref()
            .is_some_and(|field| old_value.get(field) != new_value.get(field))
    }

    fn validate(
        &self,
        _key: &str,
        value: &Value,
    ) -> Result<(), InvalidValueError> {
        match &self.reject_field {
            Some(field) if value.get(field).is_some() => Err(InvalidValueError::new("not supported", &[field])),
            _ => Ok(()),
        }
    }

    fn is_retriable(
        &self,
        _err: &DescriptorError,
    ) -> bool {
        self.retriable
    }

    fn dependencies(
        &self,
        key: &str,
        value: &Value,
    ) -> Vec<Dependency> {
        self.dependencies.as_ref().map_or_else(Vec::new, |f| f(key, value))
    }

    fn derived_values(
        &self,
        key: &str,
        value: &Value,
    ) -> Vec<KeyValuePair> {
        self.derived.as_ref().map_or_else(Vec::new, |f| f(key, value))
    }

    async fn dump(
        &self,
        _correlate: &[KvWithMetadata],
    ) -> Result<Vec<KvWithMetadata>, DescriptorError> {
        if !self.dumpable {
            return Err(DescriptorError::Unimplemented("dump"));
        }
        let mut state = self.sb.state.lock();
        state.calls.push(SbCall::Dump(self.prefix.clone()));
        if state.dump_failures.contains(&self.prefix) {
            return Err(DescriptorError::failed("injected dump failure"));
        }
        Ok(state
            .values
            .iter()
            .filter(|(key, _)| key.starts_with(&self.prefix))
            .map(|(key, v)| {
                KvWithMetadata::new(key.clone(), v.value.clone())
                    .with_metadata(Metadata::new(v.id))
                    .with_origin(v.origin)
            })
            .collect())
    }
}

/// `bd/*` values depend on every interface listed in `members`.
pub fn bridge_member_dependencies(
    _key: &str,
    value: &Value,
) -> Vec<Dependency> {
    value
        .get("members")
        .and_then(Value::as_array)
        .map(|members| {
            members
                .iter()
                .filter_map(Value::as_str)
                .map(|m| Dependency::on_key(format!("member-{m}"), format!("iface/{m}")))
                .collect()
        })
        .unwrap_or_default()
}

/// Derives one `bd-member/<bridge>/<iface>` binding per member of a bridge.
pub fn bridge_member_bindings(
    key: &str,
    value: &Value,
) -> Vec<KeyValuePair> {
    let bridge = key.trim_start_matches("bd/");
    value
        .get("members")
        .and_then(Value::as_array)
        .map(|members| {
            members
                .iter()
                .filter_map(Value::as_str)
                .map(|m| KeyValuePair::new(format!("bd-member/{bridge}/{m}"), serde_json::json!({ "iface": m })))
                .collect()
        })
        .unwrap_or_default()
}
