//! Key-value reconciliation engine.
//!
//! Resource handlers register as [`KvDescriptor`]s. Callers describe the
//! desired configuration as a set of key-value pairs, and the
//! [`KvScheduler`] converges the southbound system towards it in dependency
//! order, retrying failed keys and parking values whose dependencies are not
//! met yet. Northbound changes reach the scheduler either directly through
//! [`KvScheduler::commit`] / [`TxnQueue`] or through a [`Watcher`] feeding the
//! [`Orchestrator`].

mod config;
mod constants;
mod descriptor;
mod engine;
mod errors;
mod metrics;
mod pipeline;
mod scheduler;
pub(crate) mod utils;

pub use config::*;
pub use descriptor::*;
pub use engine::*;
pub use errors::*;
pub use metrics::*;
pub use pipeline::*;
pub use scheduler::*;

//-----------------------------------------------------------
// Test utils

#[cfg(test)]
pub mod test_utils;
