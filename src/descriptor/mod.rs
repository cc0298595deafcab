//! Descriptor contract and registry.
//!
//! A descriptor is the handler of one resource type. It selects its keys with
//! a pure predicate ([`KeySelector`]) and implements the CRUD operations of
//! [`DescriptorHandler`] against the southbound system. The engine owns all
//! key/value state; handlers only return [`Metadata`], which the scheduler
//! stores and hands back on `modify` / `delete`.
//!
//! # Minimal handler
//! ```ignore
//! struct InterfaceHandler;
//!
//! #[async_trait]
//! impl DescriptorHandler for InterfaceHandler {
//!     async fn add(&self, key: &str, value: &Value) -> Result<Option<Metadata>, DescriptorError> {
//!         let if_index = dataplane::create_interface(value)?;
//!         Ok(Some(Metadata::new(if_index)))
//!     }
//!     async fn delete(&self, key: &str, value: &Value, metadata: Option<Metadata>) -> Result<(), DescriptorError> {
//!         dataplane::delete_interface(metadata.and_then(|m| m.downcast_ref::<u32>().copied()))
//!     }
//! }
//!
//! registry.register_descriptor(KvDescriptor::new(
//!     "iface",
//!     KvDescriptor::prefix_selector("iface/"),
//!     Arc::new(InterfaceHandler),
//! ));
//! ```

mod key_cache;
mod registry;
pub(crate) use key_cache::*;
pub use registry::*;

#[cfg(test)]
mod key_cache_test;

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::Deserialize;
use serde::Serialize;

use crate::DescriptorError;
use crate::InvalidValueError;

/// Opaque configuration payload
pub type Value = serde_json::Value;

/// Pure key predicate of a descriptor
pub type KeySelector = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Descriptor-private data describing how a value was realized southbound.
#[derive(Clone)]
pub struct Metadata(Arc<dyn Any + Send + Sync>);

impl Metadata {
    pub fn new<T: Any + Send + Sync>(inner: T) -> Self {
        Metadata(Arc::new(inner))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    /// True when both handles refer to the same metadata instance.
    pub fn ptr_eq(
        &self,
        other: &Metadata,
    ) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Metadata {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str("Metadata(..)")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ValueOrigin {
    #[default]
    Unknown,
    /// Requested by the northbound client
    FromNb,
    /// Created in the southbound system by someone else
    FromSb,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeyValuePair {
    pub key: String,
    pub value: Value,
}

impl KeyValuePair {
    pub fn new(
        key: impl Into<String>,
        value: Value,
    ) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

/// A value as dumped from (or correlated with) the southbound system.
#[derive(Debug, Clone)]
pub struct KvWithMetadata {
    pub key: String,
    pub value: Value,
    pub metadata: Option<Metadata>,
    pub origin: ValueOrigin,
}

impl KvWithMetadata {
    pub fn new(
        key: impl Into<String>,
        value: Value,
    ) -> Self {
        Self {
            key: key.into(),
            value,
            metadata: None,
            origin: ValueOrigin::Unknown,
        }
    }

    pub fn with_metadata(
        mut self,
        metadata: Metadata,
    ) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_origin(
        mut self,
        origin: ValueOrigin,
    ) -> Self {
        self.origin = origin;
        self
    }
}

#[derive(Clone)]
pub enum DependencyTarget {
    /// Exactly this key must be applied
    Key(String),
    /// At least one applied key must match the selector
    AnyOf(KeySelector),
}

/// Requirement of one value on another.
#[derive(Clone)]
pub struct Dependency {
    pub label: String,
    pub target: DependencyTarget,
}

impl Dependency {
    pub fn on_key(
        label: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            label: label.into(),
            target: DependencyTarget::Key(key.into()),
        }
    }

    pub fn any_of(
        label: impl Into<String>,
        selector: KeySelector,
    ) -> Self {
        Self {
            label: label.into(),
            target: DependencyTarget::AnyOf(selector),
        }
    }

    /// Whether an applied `key` would satisfy this dependency.
    pub fn matches(
        &self,
        key: &str,
    ) -> bool {
        match &self.target {
            DependencyTarget::Key(k) => k == key,
            DependencyTarget::AnyOf(selector) => selector(key),
        }
    }
}

impl fmt::Debug for Dependency {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match &self.target {
            DependencyTarget::Key(k) => write!(f, "{} -> {}", self.label, k),
            DependencyTarget::AnyOf(_) => write!(f, "{} -> any-of(..)", self.label),
        }
    }
}

/// CRUD handler of one resource type.
///
/// Only `add` and `delete` are mandatory. The scheduler calls the methods of
/// one transaction sequentially and never concurrently with another
/// transaction.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DescriptorHandler: Send + Sync + 'static {
    /// Creates the value southbound. The returned metadata is kept while the
    /// value stays applied.
    async fn add(
        &self,
        key: &str,
        value: &Value,
    ) -> Result<Option<Metadata>, DescriptorError>;

    /// Removes the value southbound. `metadata` is exactly what `add` or
    /// `modify` returned last.
    async fn delete(
        &self,
        key: &str,
        value: &Value,
        metadata: Option<Metadata>,
    ) -> Result<(), DescriptorError>;

    /// Updates the value in place and returns the new metadata.
    async fn modify(
        &self,
        _key: &str,
        _old_value: &Value,
        _new_value: &Value,
        _metadata: Option<Metadata>,
    ) -> Result<Option<Metadata>, DescriptorError> {
        Err(DescriptorError::Unimplemented("modify"))
    }

    /// True if the change has to be applied as delete followed by add.
    fn modify_with_recreate(
        &self,
        _key: &str,
        _old_value: &Value,
        _new_value: &Value,
        _metadata: Option<Metadata>,
    ) -> bool {
        false
    }

    fn validate(
        &self,
        _key: &str,
        _value: &Value,
    ) -> Result<(), InvalidValueError> {
        Ok(())
    }

    /// Equivalent values never trigger a modify.
    fn equivalent(
        &self,
        _key: &str,
        old_value: &Value,
        new_value: &Value,
    ) -> bool {
        old_value == new_value
    }

    fn is_retriable(
        &self,
        _err: &DescriptorError,
    ) -> bool {
        true
    }

    fn dependencies(
        &self,
        _key: &str,
        _value: &Value,
    ) -> Vec<Dependency> {
        Vec::new()
    }

    fn derived_values(
        &self,
        _key: &str,
        _value: &Value,
    ) -> Vec<KeyValuePair> {
        Vec::new()
    }

    /// Reads all values of this descriptor from the southbound system.
    ///
    /// `correlate` holds what the engine believes exists (or is desired),
    /// including metadata; handlers use it to restore metadata and origin.
    async fn dump(
        &self,
        _correlate: &[KvWithMetadata],
    ) -> Result<Vec<KvWithMetadata>, DescriptorError> {
        Err(DescriptorError::Unimplemented("dump"))
    }
}

/// Registered handler of one resource type
#[derive(Clone)]
pub struct KvDescriptor {
    /// Unique descriptor name
    pub name: String,
    pub key_selector: KeySelector,
    /// Key prefix under which northbound configuration of this descriptor is
    /// watched. Descriptors of derived values usually have none.
    pub nb_key_prefix: Option<String>,
    /// Descriptors whose dump must complete before this one is dumped
    pub dump_dependencies: Vec<String>,
    /// Keep metadata returned by the handler
    pub with_metadata: bool,
    pub handler: Arc<dyn DescriptorHandler>,
}

impl KvDescriptor {
    pub fn new(
        name: impl Into<String>,
        key_selector: KeySelector,
        handler: Arc<dyn DescriptorHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            key_selector,
            nb_key_prefix: None,
            dump_dependencies: Vec::new(),
            with_metadata: true,
            handler,
        }
    }

    /// Selector matching every key that starts with `prefix`.
    pub fn prefix_selector(prefix: impl Into<String>) -> KeySelector {
        let prefix = prefix.into();
        Arc::new(move |key: &str| key.starts_with(&prefix))
    }

    pub fn with_nb_key_prefix(
        mut self,
        prefix: impl Into<String>,
    ) -> Self {
        self.nb_key_prefix = Some(prefix.into());
        self
    }

    pub fn with_dump_dependencies(
        mut self,
        names: &[&str],
    ) -> Self {
        self.dump_dependencies = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn without_metadata(mut self) -> Self {
        self.with_metadata = false;
        self
    }

    pub fn selects(
        &self,
        key: &str,
    ) -> bool {
        (self.key_selector)(key)
    }
}

impl fmt::Debug for KvDescriptor {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("KvDescriptor")
            .field("name", &self.name)
            .field("nb_key_prefix", &self.nb_key_prefix)
            .field("dump_dependencies", &self.dump_dependencies)
            .field("with_metadata", &self.with_metadata)
            .finish()
    }
}
