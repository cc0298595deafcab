//! Builder assembling an [`Engine`] from configuration and descriptors.
//!
//! ```ignore
//! let (shutdown_tx, shutdown_rx) = watch::channel(());
//! let engine = EngineBuilder::new(Some("config/kvsched.toml"), shutdown_rx)?
//!     .descriptor(interface_descriptor)
//!     .descriptor(bridge_domain_descriptor)
//!     .build()?;
//! engine.watch(&watch_registry, "orchestrator")?;
//! ```
//!
//! `build()` spawns the transaction consumer, so it must run inside a tokio
//! runtime.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;
use tracing::info;

use super::Engine;
use crate::KvDescriptor;
use crate::KvScheduler;
use crate::KvSchedulerConfig;
use crate::Orchestrator;
use crate::Registry;
use crate::Result;

pub struct EngineBuilder {
    pub(super) config: KvSchedulerConfig,
    pub(super) descriptors: Vec<KvDescriptor>,
    pub(super) registry: Option<Arc<Registry>>,
    pub(super) shutdown_signal: watch::Receiver<()>,
}

impl EngineBuilder {
    /// Loads the configuration from the default sources, then applies the
    /// file at `config_path` on top of it.
    pub fn new(
        config_path: Option<&str>,
        shutdown_signal: watch::Receiver<()>,
    ) -> Result<Self> {
        let mut config = KvSchedulerConfig::new()?;
        if let Some(p) = config_path {
            info!("with_override_config from: {}", p);
            config = config.with_override_config(p)?;
        }
        Ok(Self::from_config(config, shutdown_signal))
    }

    /// Uses an in-memory configuration as is.
    pub fn from_config(
        config: KvSchedulerConfig,
        shutdown_signal: watch::Receiver<()>,
    ) -> Self {
        Self {
            config,
            descriptors: Vec::new(),
            registry: None,
            shutdown_signal,
        }
    }

    pub fn descriptor(
        mut self,
        descriptor: KvDescriptor,
    ) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    /// Shares an existing registry instead of creating one.
    pub fn registry(
        mut self,
        registry: Arc<Registry>,
    ) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Validates the configuration and the dump order of the descriptors,
    /// then starts the transaction consumer.
    pub fn build(self) -> Result<Engine> {
        let config = self.config.validate()?;
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(Registry::new(config.scheduler.key_cache_size)));
        for descriptor in self.descriptors {
            debug!("Registering descriptor {}", descriptor.name);
            registry.register_descriptor(descriptor);
        }
        registry.validate_dump_order()?;

        let scheduler = Arc::new(KvScheduler::with_registry(config.scheduler.clone(), registry));
        let queue = scheduler.start(self.shutdown_signal.clone());
        let orchestrator = Arc::new(Orchestrator::new(scheduler.clone(), &config));
        info!("Engine built with {} descriptors", scheduler.registry().len());

        Ok(Engine {
            config,
            scheduler,
            queue,
            orchestrator,
            shutdown_signal: self.shutdown_signal,
        })
    }
}
