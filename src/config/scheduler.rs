use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SchedulerConfig {
    /// Capacity of the key -> descriptor LRU cache
    #[serde(default = "default_key_cache_size")]
    pub key_cache_size: usize,

    /// Capacity of the queue feeding the transaction consumer
    #[serde(default = "default_txn_queue_size")]
    pub txn_queue_size: usize,

    #[serde(default = "default_record_transaction_history")]
    pub record_transaction_history: bool,

    /// Age after which recorded transactions are trimmed
    #[serde(default = "default_transaction_history_age_limit_min")]
    pub transaction_history_age_limit_min: u64,

    /// Transactions recorded within this period after startup are never trimmed
    #[serde(default = "default_permanently_recorded_init_period_min")]
    pub permanently_recorded_init_period_min: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            key_cache_size: default_key_cache_size(),
            txn_queue_size: default_txn_queue_size(),
            record_transaction_history: default_record_transaction_history(),
            transaction_history_age_limit_min: default_transaction_history_age_limit_min(),
            permanently_recorded_init_period_min: default_permanently_recorded_init_period_min(),
        }
    }
}

impl SchedulerConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.key_cache_size == 0 {
            return Err(Error::Config(ConfigError::Message(
                "key_cache_size must be greater than 0".into(),
            )));
        }

        if self.txn_queue_size == 0 {
            return Err(Error::Config(ConfigError::Message(
                "txn_queue_size must be greater than 0".into(),
            )));
        }

        if self.record_transaction_history
            && self.permanently_recorded_init_period_min > self.transaction_history_age_limit_min
        {
            return Err(Error::Config(ConfigError::Message(format!(
                "permanently_recorded_init_period_min {} should not exceed transaction_history_age_limit_min {}",
                self.permanently_recorded_init_period_min, self.transaction_history_age_limit_min
            ))));
        }

        Ok(())
    }

    pub fn history_age_limit(&self) -> Duration {
        Duration::from_secs(self.transaction_history_age_limit_min * 60)
    }

    pub fn permanent_init_period(&self) -> Duration {
        Duration::from_secs(self.permanently_recorded_init_period_min * 60)
    }
}

fn default_key_cache_size() -> usize {
    500
}
fn default_txn_queue_size() -> usize {
    100
}
fn default_record_transaction_history() -> bool {
    true
}
fn default_transaction_history_age_limit_min() -> u64 {
    24 * 60
}
fn default_permanently_recorded_init_period_min() -> u64 {
    60
}
