//! Minimal metrics emission helpers.
//!
//! Metrics are emitted as structured tracing events by default. A sink
//! can be installed to capture emissions; logic only ever observes
//! metrics, it never reads them back.

use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetricValue {
    Counter(u64),
    Histogram(u64),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricEvent {
    pub name: &'static str,
    pub value: MetricValue,
}

pub trait MetricSink: Send + Sync {
    fn record(&self, event: MetricEvent);
}

struct TracingSink;

impl MetricSink for TracingSink {
    fn record(&self, event: MetricEvent) {
        match event.value {
            MetricValue::Counter(value) => {
                tracing::info!(target: "metrics", metric = event.name, value);
            }
            MetricValue::Histogram(value) => {
                tracing::info!(target: "metrics", metric = event.name, value);
            }
        }
    }
}

static METRIC_SINK: OnceLock<RwLock<Arc<dyn MetricSink>>> = OnceLock::new();

fn sink() -> Arc<dyn MetricSink> {
    METRIC_SINK
        .get_or_init(|| RwLock::new(Arc::new(TracingSink)))
        .read()
        .expect("metrics sink lock poisoned")
        .clone()
}

pub fn set_sink(sink: Arc<dyn MetricSink>) {
    let lock = METRIC_SINK.get_or_init(|| RwLock::new(Arc::new(TracingSink)));
    *lock.write().expect("metrics sink lock poisoned") = sink;
}

fn emit(name: &'static str, value: MetricValue) {
    sink().record(MetricEvent { name, value });
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Emitted once per committed consumer transaction.
pub fn txn_committed(messages: usize) {
    emit("txn_total", MetricValue::Counter(1));
    emit("txn_messages_total", MetricValue::Counter(messages as u64));
}

pub fn txn_consume_duration(duration: Duration) {
    emit(
        "txn_consume_duration",
        MetricValue::Histogram(duration_ms(duration)),
    );
}

pub fn txn_stalled_duration(duration: Duration) {
    emit(
        "txn_stalled_duration",
        MetricValue::Histogram(duration_ms(duration)),
    );
}

pub fn txn_flush_duration(duration: Duration) {
    emit(
        "txn_flush_duration",
        MetricValue::Histogram(duration_ms(duration)),
    );
}

pub fn txn_sync_duration(duration: Duration) {
    emit(
        "txn_sync_duration",
        MetricValue::Histogram(duration_ms(duration)),
    );
}

pub fn txn_total_duration(duration: Duration) {
    emit(
        "txn_duration",
        MetricValue::Histogram(duration_ms(duration)),
    );
}

/// Emitted per pruned recovery-log fragment.
pub fn fragment_pruned(bytes: i64) {
    emit("fragments_pruned_total", MetricValue::Counter(1));
    emit(
        "fragments_pruned_bytes_total",
        MetricValue::Counter(bytes.max(0) as u64),
    );
}
