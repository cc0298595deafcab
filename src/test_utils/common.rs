use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use crate::RetryPolicy;
use crate::SchedulerConfig;
use crate::Value;

static LOGGER_INIT: once_cell::sync::Lazy<()> = once_cell::sync::Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
});

pub fn enable_logger() {
    *LOGGER_INIT;
    println!("setup logger for unit test.");
}

pub fn test_scheduler_config() -> SchedulerConfig {
    SchedulerConfig {
        key_cache_size: 16,
        ..SchedulerConfig::default()
    }
}

/// Retry policy with short, fixed delays.
pub fn fast_retry(max_count: usize) -> RetryPolicy {
    RetryPolicy::new(Duration::from_millis(10), max_count, false)
}

pub fn iface(name: &str) -> Value {
    json!({ "name": name, "mtu": 1500 })
}

pub fn bridge(members: &[&str]) -> Value {
    json!({ "members": members })
}

/// Everything currently buffered in the channel.
pub fn drain<T>(rx: &mut mpsc::Receiver<T>) -> Vec<T> {
    let mut out = Vec::new();
    while let Ok(item) = rx.try_recv() {
        out.push(item);
    }
    out
}
