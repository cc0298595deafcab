use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Retry policy of failed transaction keys
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry (unit: milliseconds)
    #[serde(default = "default_period_ms")]
    pub period_ms: u64,

    /// Maximum number of retries of one key (0 disables retries)
    #[serde(default = "default_max_count")]
    pub max_count: usize,

    /// Double the delay after each retry
    #[serde(default = "default_exp_backoff")]
    pub exp_backoff: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            period_ms: default_period_ms(),
            max_count: default_max_count(),
            exp_backoff: default_exp_backoff(),
        }
    }
}

impl RetryPolicy {
    pub fn new(
        period: Duration,
        max_count: usize,
        exp_backoff: bool,
    ) -> Self {
        Self {
            period_ms: period.as_millis() as u64,
            max_count,
            exp_backoff,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_count > 0 && self.period_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "retry period_ms must be at least 1ms when retries are enabled".into(),
            )));
        }
        Ok(())
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(
        &self,
        attempt: usize,
    ) -> Duration {
        let base = Duration::from_millis(self.period_ms);
        if !self.exp_backoff || attempt <= 1 {
            return base;
        }
        let shift = (attempt - 1).min(16) as u32;
        base.saturating_mul(1u32 << shift)
    }
}

fn default_period_ms() -> u64 {
    1000
}
fn default_max_count() -> usize {
    3
}
fn default_exp_backoff() -> bool {
    true
}
