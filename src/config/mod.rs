//! Configuration management for the reconciliation engine.
//!
//! Sources are merged with increasing priority:
//! 1. Default values (hardcoded)
//! 2. File named by the `CONFIG_PATH` environment variable
//! 3. Environment variables prefixed with `KVSCHED__`
//!

mod pipeline;
mod retry;
mod scheduler;
pub use pipeline::*;
pub use retry::*;
pub use scheduler::*;


//---
use std::env;

use config::Config;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;

use crate::constants::CONFIG_ENV_PREFIX;
use crate::constants::CONFIG_PATH_ENV;
use crate::Result;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct KvSchedulerConfig {
    /// Scheduler and registry parameters
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Event pipeline acknowledgement timeouts
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Default retry policy of transactions fed from the pipeline
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl KvSchedulerConfig {
    /// Loads configuration from hierarchical sources without validation.
    ///
    /// Callers MUST call `validate()` before using the configuration.
    ///
    /// # Examples
    /// ```ignore
    /// std::env::set_var("KVSCHED__SCHEDULER__KEY_CACHE_SIZE", "1000");
    /// let cfg = KvSchedulerConfig::new()?.validate()?;
    /// ```
    pub fn new() -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if let Ok(config_path) = env::var(CONFIG_PATH_ENV) {
            builder = builder.add_source(File::with_name(&config_path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(CONFIG_ENV_PREFIX)
                .separator("__")
                .ignore_empty(true)
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Applies overrides from a file, then the latest environment variables.
    /// Does NOT validate.
    pub fn with_override_config(
        &self,
        path: &str,
    ) -> Result<Self> {
        let config: Self = Config::builder()
            .add_source(Config::try_from(self)?)
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .ignore_empty(true)
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Validates all sections and returns the validated instance.
    pub fn validate(self) -> Result<Self> {
        self.scheduler.validate()?;
        self.pipeline.validate()?;
        self.retry.validate()?;
        Ok(self)
    }
}
