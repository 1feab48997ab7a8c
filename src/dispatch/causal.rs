//! Causal delivery labels.
//!
//! Each label carries its own vector clock per node and a buffer of
//! not-yet-deliverable messages. A message from sender `s` with dependency
//! clock `dep` is deliverable when `dep[s] == vc[s] + 1` and
//! `dep[n] <= vc[n]` for every other node; delivery bumps `vc[s]` and
//! re-scans the buffer until a fixed point.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::core::NodeName;
use crate::metrics;
use crate::net::proto::CausalMeta;

pub type DeliveryFn = Arc<dyn Fn(Option<&str>, Bytes) + Send + Sync>;

#[derive(Default)]
struct LabelState {
    clock: BTreeMap<NodeName, u64>,
    buffer: Vec<Pending>,
    delivery: Option<DeliveryFn>,
}

struct Pending {
    meta: CausalMeta,
    target: Option<String>,
    payload: Bytes,
}

pub struct CausalLayer {
    local: NodeName,
    labels: Mutex<HashMap<String, LabelState>>,
}

impl CausalLayer {
    pub fn new(local: NodeName, labels: impl IntoIterator<Item = String>) -> Self {
        let mut map = HashMap::new();
        for label in labels {
            map.insert(label, LabelState::default());
        }
        Self {
            local,
            labels: Mutex::new(map),
        }
    }

    /// Register the per-label delivery function invoked for every message
    /// the layer releases.
    pub fn set_delivery_fn(&self, label: &str, delivery: DeliveryFn) {
        let mut labels = self.lock();
        labels.entry(label.to_string()).or_default().delivery = Some(delivery);
    }

    /// Stamp an outgoing message: bump our own clock entry and snapshot the
    /// dependency clock.
    pub fn emit(&self, label: &str) -> CausalMeta {
        let mut labels = self.lock();
        let state = labels.entry(label.to_string()).or_default();
        let counter = state.clock.entry(self.local.clone()).or_insert(0);
        *counter += 1;
        CausalMeta {
            label: label.to_string(),
            sender: self.local.clone(),
            clock: state.clock.clone(),
        }
    }

    /// Hand a received message to the layer. Messages the registered
    /// delivery function consumed are not returned; everything else comes
    /// back in causal order for the caller to deliver.
    pub fn receive(
        &self,
        meta: CausalMeta,
        target: Option<String>,
        payload: Bytes,
    ) -> Vec<(Option<String>, Bytes)> {
        let label = meta.label.clone();
        let mut labels = self.lock();
        let state = labels.entry(label.clone()).or_default();

        let received = state.clock.get(&meta.sender).copied().unwrap_or(0);
        let advertised = meta.clock.get(&meta.sender).copied().unwrap_or(0);
        if advertised <= received {
            tracing::debug!(
                target: "dispatch",
                label = %meta.label,
                sender = %meta.sender,
                "duplicate causal message ignored"
            );
            return Vec::new();
        }

        state.buffer.push(Pending {
            meta,
            target,
            payload,
        });

        let mut released = Vec::new();
        loop {
            let position = state
                .buffer
                .iter()
                .position(|pending| deliverable(&state.clock, &pending.meta, &self.local));
            let Some(position) = position else {
                break;
            };
            let pending = state.buffer.swap_remove(position);
            let delivered = pending
                .meta
                .clock
                .get(&pending.meta.sender)
                .copied()
                .unwrap_or(0);
            state.clock.insert(pending.meta.sender.clone(), delivered);

            match &state.delivery {
                Some(delivery) => delivery(pending.target.as_deref(), pending.payload),
                None => released.push((pending.target, pending.payload)),
            }
        }

        metrics::causal_buffered(&label, state.buffer.len());
        released
    }

    /// Buffered message count for one label.
    pub fn buffered(&self, label: &str) -> usize {
        self.lock()
            .get(label)
            .map(|state| state.buffer.len())
            .unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, LabelState>> {
        self.labels.lock().expect("causal layer lock poisoned")
    }
}

/// Deliverability: exactly the next message from its sender, and no
/// dependency on anything we have not seen.
fn deliverable(clock: &BTreeMap<NodeName, u64>, meta: &CausalMeta, local: &NodeName) -> bool {
    for (node, dep) in &meta.clock {
        if node == local {
            // Dependencies on our own emissions are satisfied by definition.
            continue;
        }
        let seen = clock.get(node).copied().unwrap_or(0);
        if node == &meta.sender {
            if *dep != seen + 1 {
                return false;
            }
        } else if *dep > seen {
            return false;
        }
    }
    true
}
