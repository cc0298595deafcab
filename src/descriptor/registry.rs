use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use parking_lot::RwLock;
use tracing::debug;
use tracing::trace;

use super::KeyCache;
use super::KvDescriptor;
use crate::utils::topological_order;
use crate::RegistryError;
use crate::Result;

/// Index over all registered descriptors.
///
/// Key lookups go through a bounded LRU cache; the dump order is computed
/// lazily once per registration epoch. Registering a descriptor invalidates
/// both.
pub struct Registry {
    descriptors: RwLock<Descriptors>,
    dump_order: ArcSwapOption<Vec<Arc<KvDescriptor>>>,
    key_cache: Mutex<KeyCache<Option<Arc<KvDescriptor>>>>,
}

#[derive(Default)]
struct Descriptors {
    /// Registration order
    list: Vec<Arc<KvDescriptor>>,
    by_name: HashMap<String, usize>,
}

impl Registry {
    pub fn new(key_cache_size: usize) -> Self {
        Self {
            descriptors: RwLock::new(Descriptors::default()),
            dump_order: ArcSwapOption::empty(),
            key_cache: Mutex::new(KeyCache::new(key_cache_size)),
        }
    }

    /// Registers a descriptor. A descriptor registered under an existing name
    /// replaces it in place.
    pub fn register_descriptor(
        &self,
        descriptor: KvDescriptor,
    ) {
        let mut descriptors = self.descriptors.write();
        let name = descriptor.name.clone();
        let descriptor = Arc::new(descriptor);
        match descriptors.by_name.get(&name) {
            Some(&pos) => {
                debug!("Replacing descriptor {}", name);
                descriptors.list[pos] = descriptor;
            }
            None => {
                debug!("Registering descriptor {}", name);
                let pos = descriptors.list.len();
                descriptors.list.push(descriptor);
                descriptors.by_name.insert(name, pos);
            }
        }

        self.dump_order.store(None);
        self.key_cache.lock().clear();
    }

    pub fn get_descriptor(
        &self,
        name: &str,
    ) -> Option<Arc<KvDescriptor>> {
        let descriptors = self.descriptors.read();
        descriptors.by_name.get(name).map(|&pos| descriptors.list[pos].clone())
    }

    /// Returns the descriptor whose selector matches `key`; the first
    /// registered one wins if selectors overlap.
    pub fn get_descriptor_for_key(
        &self,
        key: &str,
    ) -> Option<Arc<KvDescriptor>> {
        // Registration takes the write lock, so a cached result never
        // outlives its epoch.
        let descriptors = self.descriptors.read();
        let mut cache = self.key_cache.lock();
        if let Some(cached) = cache.get(key) {
            trace!("key cache hit: {}", key);
            return cached;
        }

        let found = descriptors.list.iter().find(|d| d.selects(key)).cloned();
        cache.insert(key.to_string(), found.clone());
        found
    }

    /// All descriptors in dump order: every descriptor comes after the
    /// descriptors named in its `dump_dependencies`. Ties keep registration
    /// order; dependencies on unregistered names are ignored.
    pub fn get_all_descriptors(&self) -> Result<Vec<Arc<KvDescriptor>>> {
        if let Some(ordered) = self.dump_order.load_full() {
            return Ok(ordered.as_ref().clone());
        }

        let descriptors = self.descriptors.read();
        let mut edges = Vec::new();
        for (pos, descriptor) in descriptors.list.iter().enumerate() {
            for dep in &descriptor.dump_dependencies {
                if let Some(&dep_pos) = descriptors.by_name.get(dep) {
                    edges.push((dep_pos, pos));
                }
            }
        }

        let order = topological_order(descriptors.list.len(), &edges);
        if !order.cyclic.is_empty() {
            let names = order.cyclic.iter().map(|&i| descriptors.list[i].name.clone()).collect();
            return Err(RegistryError::DumpDependencyCycle(names).into());
        }

        let ordered: Vec<Arc<KvDescriptor>> =
            order.ordered.iter().map(|&i| descriptors.list[i].clone()).collect();
        self.dump_order.store(Some(Arc::new(ordered.clone())));
        Ok(ordered)
    }

    /// Fails if the dump dependencies contain a cycle.
    pub fn validate_dump_order(&self) -> Result<()> {
        self.get_all_descriptors().map(|_| ())
    }

    /// Key prefixes under which northbound configuration is expected.
    pub fn registered_nb_key_prefixes(&self) -> Vec<String> {
        self.descriptors
            .read()
            .list
            .iter()
            .filter_map(|d| d.nb_key_prefix.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.descriptors.read().list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub(crate) fn key_cache_len(&self) -> usize {
        self.key_cache.lock().len()
    }

    #[cfg(test)]
    pub(crate) fn key_cache_recency(&self) -> Vec<String> {
        self.key_cache.lock().keys_by_recency()
    }
}
