//! Minimal metrics emission helpers.
//!
//! These helpers emit structured metrics via tracing by default. A test sink
//! can be installed to capture emissions in unit tests.

use std::sync::{Arc, OnceLock, RwLock};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetricValue {
    Counter(u64),
    Gauge(u64),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricLabel {
    pub key: &'static str,
    pub value: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricEvent {
    pub name: &'static str,
    pub value: MetricValue,
    pub labels: Vec<MetricLabel>,
}

pub trait MetricSink: Send + Sync {
    fn record(&self, event: MetricEvent);
}

struct TracingSink;

impl MetricSink for TracingSink {
    fn record(&self, event: MetricEvent) {
        match event.value {
            MetricValue::Counter(value) => {
                tracing::info!(
                    target: "metrics",
                    metric = event.name,
                    value,
                    labels = ?event.labels
                );
            }
            MetricValue::Gauge(value) => {
                tracing::info!(
                    target: "metrics",
                    metric = event.name,
                    value,
                    labels = ?event.labels
                );
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

pub fn set_sink(new_sink: Arc<dyn MetricSink>) {
    let lock = METRIC_SINK.get_or_init(|| RwLock::new(Arc::new(TracingSink)));
    *lock.write().expect("metrics sink lock poisoned") = new_sink;
}

fn emit(name: &'static str, value: MetricValue, labels: Vec<MetricLabel>) {
    sink().record(MetricEvent { name, value, labels });
}

fn channel_label(channel: &str) -> Vec<MetricLabel> {
    vec![MetricLabel {
        key: "channel",
        value: channel.to_string(),
    }]
}

pub fn frame_sent(channel: &str, bytes: usize) {
    emit("frames_sent", MetricValue::Counter(1), channel_label(channel));
    emit(
        "bytes_sent",
        MetricValue::Counter(bytes as u64),
        channel_label(channel),
    );
}

pub fn frame_received(channel: &str, bytes: usize) {
    emit(
        "frames_received",
        MetricValue::Counter(1),
        channel_label(channel),
    );
    emit(
        "bytes_received",
        MetricValue::Counter(bytes as u64),
        channel_label(channel),
    );
}

pub fn peer_up() {
    emit("peers_up", MetricValue::Counter(1), Vec::new());
}

pub fn peer_down() {
    emit("peers_down", MetricValue::Counter(1), Vec::new());
}

pub fn reconnect_attempt(peer: &str) {
    emit(
        "reconnect_attempts",
        MetricValue::Counter(1),
        vec![MetricLabel {
            key: "peer",
            value: peer.to_string(),
        }],
    );
}

pub fn ack_timed_out() {
    emit("acks_timed_out", MetricValue::Counter(1), Vec::new());
}

pub fn interposition_dropped(peer: &str) {
    emit(
        "interposition_dropped",
        MetricValue::Counter(1),
        vec![MetricLabel {
            key: "peer",
            value: peer.to_string(),
        }],
    );
}

pub fn causal_buffered(label: &str, buffered: usize) {
    emit(
        "causal_buffered",
        MetricValue::Gauge(buffered as u64),
        vec![MetricLabel {
            key: "label",
            value: label.to_string(),
        }],
    );
}
