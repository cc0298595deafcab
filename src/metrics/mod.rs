use std::sync::Once;

use lazy_static::lazy_static;
use prometheus::exponential_buckets;
use prometheus::HistogramOpts;
use prometheus::HistogramVec;
use prometheus::IntCounterVec;
use prometheus::IntGauge;
use prometheus::Opts;
use prometheus::Registry;
use prometheus::TextEncoder;
use tracing::error;


lazy_static! {
    pub static ref TXN_COUNTER: IntCounterVec = IntCounterVec::new(
        Opts::new("kvscheduler_transactions_total", "Processed transactions by type"),
        &["txn_type"]
    )
    .expect("metric can not be created");

    pub static ref FAILED_OPERATIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("kvscheduler_failed_operations_total", "Failed value operations by descriptor"),
        &["descriptor", "operation"]
    )
    .expect("metric can not be created");

    pub static ref PENDING_VALUES: IntGauge =
        IntGauge::new("kvscheduler_pending_values", "Values waiting for dependencies")
            .expect("metric can not be created");

    pub static ref TXN_LATENCY: HistogramVec = HistogramVec::new(
        HistogramOpts::new("kvscheduler_txn_latency_ms", "Transaction processing latency in ms")
            .buckets(exponential_buckets(1.0, 2.0, 16).expect("valid buckets")),
        &["txn_type"]
    )
    .expect("metric can not be created");

    pub static ref REGISTRY: Registry = Registry::new();
}

static REGISTER: Once = Once::new();

fn register_custom_metrics() {
    REGISTER.call_once(|| {
        REGISTRY
            .register(Box::new(TXN_COUNTER.clone()))
            .expect("collector can be registered");
        REGISTRY
            .register(Box::new(FAILED_OPERATIONS.clone()))
            .expect("collector can be registered");
        REGISTRY
            .register(Box::new(PENDING_VALUES.clone()))
            .expect("collector can be registered");
        REGISTRY
            .register(Box::new(TXN_LATENCY.clone()))
            .expect("collector can be registered");
    });
}

/// Text exposition of all engine metrics.
pub fn gather_metrics() -> String {
    register_custom_metrics();
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&REGISTRY.gather()) {
        Ok(text) => text,
        Err(e) => {
            error!("could not encode metrics: {}", e);
            String::new()
        }
    }
}
