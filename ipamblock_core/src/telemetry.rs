//! Minimal run-time metrics sink.
//!
//! No exporter ships with the crate; the host process registers a plain
//! callback that receives name/value pairs for every counter bump and gauge
//! update emitted by the access loop.

use metrics::{Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit};
use once_cell::sync::OnceCell;
use std::sync::Arc;

pub const ALLOCATIONS_TOTAL: &str = "ipam_block_allocations_total";
pub const RELEASES_TOTAL: &str = "ipam_block_releases_total";
pub const CAS_CONFLICTS_TOTAL: &str = "ipam_block_cas_conflicts_total";
pub const CAS_EXHAUSTED_TOTAL: &str = "ipam_block_cas_exhausted_total";
pub const FREE_ORDINALS: &str = "ipam_block_free_ordinals";

/// Signature for external collectors.
pub type StatsCallback = fn(name: &str, value: u64);

static CALLBACK: OnceCell<StatsCallback> = OnceCell::new();

fn forward(key: &Key, value: u64) {
    if let Some(cb) = CALLBACK.get() {
        cb(key.name(), value);
    }
}

/// Forwarding recorder. Uses the callback **if** it was registered.
struct CallbackRecorder;

#[derive(Clone)]
struct Forwarder {
    key: Key,
}

impl Recorder for CallbackRecorder {
    fn describe_counter(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_gauge(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_histogram(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn register_counter(&self, key: &Key, _metadata: &Metadata<'_>) -> Counter {
        Counter::from_arc(Arc::new(Forwarder { key: key.clone() }))
    }
    fn register_gauge(&self, key: &Key, _metadata: &Metadata<'_>) -> Gauge {
        Gauge::from_arc(Arc::new(Forwarder { key: key.clone() }))
    }
    fn register_histogram(&self, key: &Key, _metadata: &Metadata<'_>) -> Histogram {
        Histogram::from_arc(Arc::new(Forwarder { key: key.clone() }))
    }
}

impl metrics::CounterFn for Forwarder {
    fn increment(&self, value: u64) {
        forward(&self.key, value);
    }
    fn absolute(&self, value: u64) {
        forward(&self.key, value);
    }
}

impl metrics::GaugeFn for Forwarder {
    fn set(&self, value: f64) {
        forward(&self.key, value as u64);
    }
    fn increment(&self, value: f64) {
        forward(&self.key, value as u64);
    }
    fn decrement(&self, value: f64) {
        forward(&self.key, value as u64);
    }
}

impl metrics::HistogramFn for Forwarder {
    fn record(&self, value: f64) {
        forward(&self.key, value as u64);
    }
}

/// Register `cb` and install the forwarding recorder as the process-wide
/// `metrics` recorder. Only the first call has any effect; returns whether
/// this call installed the callback.
pub fn install(cb: StatsCallback) -> bool {
    if CALLBACK.set(cb).is_err() {
        return false;
    }
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = metrics::set_global_recorder(CallbackRecorder);
    });
    true
}
