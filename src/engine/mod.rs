//! Assembled reconciliation engine.

mod builder;

pub use builder::*;

#[cfg(test)]
mod builder_test;

use std::sync::Arc;

use tokio::sync::watch;

use crate::KvScheduler;
use crate::KvSchedulerConfig;
use crate::Orchestrator;
use crate::Result;
use crate::TxnQueue;
use crate::Watcher;

/// Scheduler, transaction queue and northbound orchestrator sharing one
/// registry and one shutdown signal.
pub struct Engine {
    config: KvSchedulerConfig,
    scheduler: Arc<KvScheduler>,
    queue: TxnQueue,
    orchestrator: Arc<Orchestrator>,
    shutdown_signal: watch::Receiver<()>,
}

impl Engine {
    pub fn config(&self) -> &KvSchedulerConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Arc<KvScheduler> {
        &self.scheduler
    }

    /// Queued commit path; transactions are applied one at a time by the
    /// consumer spawned in [`EngineBuilder::build`].
    pub fn queue(&self) -> &TxnQueue {
        &self.queue
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Subscribes the orchestrator to `watcher` and starts consuming its
    /// events until shutdown.
    pub fn watch(
        &self,
        watcher: &dyn Watcher,
        name: &str,
    ) -> Result<()> {
        self.orchestrator.start(watcher, name, self.shutdown_signal.clone())
    }

    /// Closes the northbound subscription.
    pub fn close(&self) -> Result<()> {
        self.orchestrator.close()
    }
}
