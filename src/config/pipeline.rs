use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Acknowledgement timeouts of the event pipeline.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PipelineConfig {
    /// How long `propagate_changes` waits for all subscribers to call `done`
    #[serde(default = "default_change_ack_timeout_ms")]
    pub change_ack_timeout_ms: u64,

    /// How long `propagate_resync` waits for each subscriber to call `done`
    #[serde(default = "default_resync_ack_timeout_ms")]
    pub resync_ack_timeout_ms: u64,

    /// How long a send into a subscriber channel may block
    #[serde(default = "default_notify_timeout_ms")]
    pub notify_timeout_ms: u64,

    /// Capacity of the change and resync channels created by the orchestrator
    #[serde(default = "default_channel_buffer")]
    pub channel_buffer: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            change_ack_timeout_ms: default_change_ack_timeout_ms(),
            resync_ack_timeout_ms: default_resync_ack_timeout_ms(),
            notify_timeout_ms: default_notify_timeout_ms(),
            channel_buffer: default_channel_buffer(),
        }
    }
}

impl PipelineConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.change_ack_timeout_ms == 0
            || self.resync_ack_timeout_ms == 0
            || self.notify_timeout_ms == 0
        {
            return Err(Error::Config(ConfigError::Message(
                "pipeline timeouts must be at least 1ms".into(),
            )));
        }

        if self.channel_buffer == 0 {
            return Err(Error::Config(ConfigError::Message(
                "channel_buffer must be greater than 0".into(),
            )));
        }

        Ok(())
    }

    pub fn change_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.change_ack_timeout_ms)
    }

    pub fn resync_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.resync_ack_timeout_ms)
    }

    pub fn notify_timeout(&self) -> Duration {
        Duration::from_millis(self.notify_timeout_ms)
    }
}

fn default_change_ack_timeout_ms() -> u64 {
    20_000
}
fn default_resync_ack_timeout_ms() -> u64 {
    5_000
}
fn default_notify_timeout_ms() -> u64 {
    2_000
}
fn default_channel_buffer() -> usize {
    100
}
