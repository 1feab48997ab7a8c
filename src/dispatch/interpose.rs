//! Interposition filters and partition injection.
//!
//! Filters are data, not arbitrary control flow: a filter inspects
//! `(tag, peer, payload)` and yields one of four decisions. Partitions are a
//! layer above - an injected partition drops traffic to and from a set of
//! peers before any user filter runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::core::NodeName;
use crate::metrics;

/// Which side of the dispatch path a filter observes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FilterTag {
    ForwardMessage,
    ReceiveMessage,
}

/// What a filter decided about one message.
#[derive(Clone, Debug)]
pub enum FilterDecision {
    /// Deliver the original payload.
    Pass,
    /// Swallow the message.
    Drop,
    /// Deliver this payload instead.
    Substitute(Bytes),
    /// Re-enqueue this payload for later delivery.
    Delay(Bytes),
}

pub type FilterFn = Arc<dyn Fn(FilterTag, &NodeName, &[u8]) -> FilterDecision + Send + Sync>;

/// Opaque handle for one injected partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionRef(u64);

#[derive(Default)]
struct PeerFilters {
    forward: Option<FilterFn>,
    receive: Option<FilterFn>,
}

pub struct InterpositionTable {
    filters: Mutex<HashMap<NodeName, PeerFilters>>,
    partitions: Mutex<BTreeMap<PartitionRef, Vec<NodeName>>>,
    next_partition: AtomicU64,
}

impl InterpositionTable {
    pub fn new() -> Self {
        Self {
            filters: Mutex::new(HashMap::new()),
            partitions: Mutex::new(BTreeMap::new()),
            next_partition: AtomicU64::new(1),
        }
    }

    /// Install the filter for `(peer, tag)`, replacing any previous one.
    pub fn add(&self, peer: NodeName, tag: FilterTag, filter: FilterFn) {
        let mut filters = self.lock_filters();
        let entry = filters.entry(peer).or_default();
        match tag {
            FilterTag::ForwardMessage => entry.forward = Some(filter),
            FilterTag::ReceiveMessage => entry.receive = Some(filter),
        }
    }

    /// Remove both filters for `peer` atomically.
    pub fn remove(&self, peer: &NodeName) {
        self.lock_filters().remove(peer);
    }

    pub fn evaluate(&self, tag: FilterTag, peer: &NodeName, payload: &[u8]) -> FilterDecision {
        if self.is_partitioned(peer) {
            metrics::interposition_dropped(peer.as_str());
            return FilterDecision::Drop;
        }

        let filters = self.lock_filters();
        let filter = filters.get(peer).and_then(|entry| match tag {
            FilterTag::ForwardMessage => entry.forward.clone(),
            FilterTag::ReceiveMessage => entry.receive.clone(),
        });
        drop(filters);

        match filter {
            Some(filter) => {
                let decision = filter(tag, peer, payload);
                if matches!(decision, FilterDecision::Drop) {
                    metrics::interposition_dropped(peer.as_str());
                }
                decision
            }
            None => FilterDecision::Pass,
        }
    }

    /// Cut traffic with `peers` in both directions until resolved.
    pub fn inject_partition(&self, peers: Vec<NodeName>) -> PartitionRef {
        let reference = PartitionRef(self.next_partition.fetch_add(1, Ordering::Relaxed));
        tracing::info!(target: "dispatch", ?reference, count = peers.len(), "partition injected");
        self.lock_partitions().insert(reference, peers);
        reference
    }

    pub fn resolve_partition(&self, reference: PartitionRef) -> bool {
        let resolved = self.lock_partitions().remove(&reference).is_some();
        if resolved {
            tracing::info!(target: "dispatch", ?reference, "partition resolved");
        }
        resolved
    }

    pub fn partitions(&self) -> Vec<(PartitionRef, Vec<NodeName>)> {
        self.lock_partitions()
            .iter()
            .map(|(reference, peers)| (*reference, peers.clone()))
            .collect()
    }

    fn is_partitioned(&self, peer: &NodeName) -> bool {
        self.lock_partitions()
            .values()
            .any(|peers| peers.contains(peer))
    }

    fn lock_filters(&self) -> std::sync::MutexGuard<'_, HashMap<NodeName, PeerFilters>> {
        self.filters.lock().expect("interposition lock poisoned")
    }

    fn lock_partitions(
        &self,
    ) -> std::sync::MutexGuard<'_, BTreeMap<PartitionRef, Vec<NodeName>>> {
        self.partitions.lock().expect("interposition lock poisoned")
    }
}

impl Default for InterpositionTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(raw: &str) -> NodeName {
        NodeName::parse(raw).unwrap()
    }

    #[test]
    fn no_filter_means_pass() {
        let table = InterpositionTable::new();
        assert!(matches!(
            table.evaluate(FilterTag::ForwardMessage, &name("p@h"), b"x"),
            FilterDecision::Pass
        ));
    }

    #[test]
    fn filters_are_per_peer_and_per_tag() {
        let table = InterpositionTable::new();
        table.add(
            name("p@h"),
            FilterTag::ForwardMessage,
            Arc::new(|_, _, _| FilterDecision::Drop),
        );

        assert!(matches!(
            table.evaluate(FilterTag::ForwardMessage, &name("p@h"), b"x"),
            FilterDecision::Drop
        ));
        // The receive side and other peers are untouched.
        assert!(matches!(
            table.evaluate(FilterTag::ReceiveMessage, &name("p@h"), b"x"),
            FilterDecision::Pass
        ));
        assert!(matches!(
            table.evaluate(FilterTag::ForwardMessage, &name("q@h"), b"x"),
            FilterDecision::Pass
        ));
    }

    #[test]
    fn remove_clears_both_tags() {
        let table = InterpositionTable::new();
        table.add(
            name("p@h"),
            FilterTag::ForwardMessage,
            Arc::new(|_, _, _| FilterDecision::Drop),
        );
        table.add(
            name("p@h"),
            FilterTag::ReceiveMessage,
            Arc::new(|_, _, _| FilterDecision::Drop),
        );
        table.remove(&name("p@h"));
        assert!(matches!(
            table.evaluate(FilterTag::ForwardMessage, &name("p@h"), b"x"),
            FilterDecision::Pass
        ));
        assert!(matches!(
            table.evaluate(FilterTag::ReceiveMessage, &name("p@h"), b"x"),
            FilterDecision::Pass
        ));
    }

    #[test]
    fn substitute_and_delay_carry_payloads() {
        let table = InterpositionTable::new();
        table.add(
            name("p@h"),
            FilterTag::ForwardMessage,
            Arc::new(|_, _, payload| {
                if payload == b"swap" {
                    FilterDecision::Substitute(Bytes::from_static(b"swapped"))
                } else {
                    FilterDecision::Delay(Bytes::from_static(b"later"))
                }
            }),
        );

        match table.evaluate(FilterTag::ForwardMessage, &name("p@h"), b"swap") {
            FilterDecision::Substitute(payload) => assert_eq!(&payload[..], b"swapped"),
            other => panic!("expected substitute, got {other:?}"),
        }
        match table.evaluate(FilterTag::ForwardMessage, &name("p@h"), b"x") {
            FilterDecision::Delay(payload) => assert_eq!(&payload[..], b"later"),
            other => panic!("expected delay, got {other:?}"),
        }
    }

    #[test]
    fn partitions_drop_before_filters_and_resolve_cleanly() {
        let table = InterpositionTable::new();
        table.add(
            name("p@h"),
            FilterTag::ForwardMessage,
            Arc::new(|_, _, _| FilterDecision::Pass),
        );

        let reference = table.inject_partition(vec![name("p@h"), name("q@h")]);
        assert_eq!(table.partitions().len(), 1);
        assert!(matches!(
            table.evaluate(FilterTag::ForwardMessage, &name("p@h"), b"x"),
            FilterDecision::Drop
        ));
        assert!(matches!(
            table.evaluate(FilterTag::ReceiveMessage, &name("q@h"), b"x"),
            FilterDecision::Drop
        ));

        assert!(table.resolve_partition(reference));
        assert!(!table.resolve_partition(reference));
        assert!(table.partitions().is_empty());
        assert!(matches!(
            table.evaluate(FilterTag::ForwardMessage, &name("p@h"), b"x"),
            FilterDecision::Pass
        ));
    }
}
