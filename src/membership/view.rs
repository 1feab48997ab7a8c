//! Active/passive partial views and their mutation rules.
//!
//! Invariants enforced here:
//! - active and passive are disjoint; active wins on conflict
//! - self never enters either view
//! - |active| <= active_view_size, |passive| <= passive_view_size, with
//!   uniformly random eviction on overflow

use std::collections::{BTreeMap, BTreeSet};

use rand::seq::IteratorRandom;
use rand::Rng;

use crate::core::{Limits, NodeName, NodeSpec};

/// Why a peer is being dialed; decides what happens on connection-up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PendingKind {
    /// We initiated `join(peer)`: on up, send forward_join(self, ARWL).
    Join,
    /// Protocol admission (forward_join walk or neighbor accept).
    Admit,
    /// Replacement candidate for a suspected peer: on up, send neighbor.
    Replacement,
}

#[derive(Debug)]
pub struct Views {
    local: NodeSpec,
    active: BTreeMap<NodeName, NodeSpec>,
    passive: BTreeMap<NodeName, NodeSpec>,
    pending: BTreeMap<NodeName, (NodeSpec, PendingKind)>,
    suspected: BTreeSet<NodeName>,
    limits: Limits,
}

/// What fell out of a view mutation.
#[derive(Debug, Default)]
pub struct AddOutcome {
    /// Peer evicted from the active view; owes it a disconnect.
    pub evicted_active: Option<NodeSpec>,
    /// Whether the mutation changed anything at all.
    pub changed: bool,
}

impl Views {
    pub fn new(local: NodeSpec, limits: Limits) -> Self {
        Self {
            local,
            active: BTreeMap::new(),
            passive: BTreeMap::new(),
            pending: BTreeMap::new(),
            suspected: BTreeSet::new(),
            limits,
        }
    }

    pub fn local(&self) -> &NodeSpec {
        &self.local
    }

    pub fn is_self(&self, name: &NodeName) -> bool {
        name == &self.local.name
    }

    pub fn active(&self) -> impl Iterator<Item = &NodeSpec> {
        self.active.values()
    }

    pub fn passive(&self) -> impl Iterator<Item = &NodeSpec> {
        self.passive.values()
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn passive_len(&self) -> usize {
        self.passive.len()
    }

    pub fn in_active(&self, name: &NodeName) -> bool {
        self.active.contains_key(name)
    }

    pub fn in_passive(&self, name: &NodeName) -> bool {
        self.passive.contains_key(name)
    }

    pub fn is_suspected(&self, name: &NodeName) -> bool {
        self.suspected.contains(name)
    }

    pub fn suspected_len(&self) -> usize {
        self.suspected.len()
    }

    pub fn active_specs(&self) -> Vec<NodeSpec> {
        self.active.values().cloned().collect()
    }

    pub fn pending_kind(&self, name: &NodeName) -> Option<PendingKind> {
        self.pending.get(name).map(|(_, kind)| *kind)
    }

    pub fn set_pending(&mut self, spec: NodeSpec, kind: PendingKind) {
        if self.is_self(&spec.name) {
            return;
        }
        self.pending.insert(spec.name.clone(), (spec, kind));
    }

    pub fn clear_pending(&mut self, name: &NodeName) -> bool {
        self.pending.remove(name).is_some()
    }

    pub fn clear_suspected(&mut self, name: &NodeName) -> bool {
        self.suspected.remove(name)
    }

    /// Admit a peer into the active view, evicting a uniformly random member
    /// if the view is full. The peer leaves passive/pending/suspected.
    pub fn add_active(&mut self, spec: NodeSpec, rng: &mut impl Rng) -> AddOutcome {
        let mut outcome = AddOutcome::default();
        if self.is_self(&spec.name) || self.active.contains_key(&spec.name) {
            return outcome;
        }

        self.passive.remove(&spec.name);
        self.pending.remove(&spec.name);
        self.suspected.remove(&spec.name);

        if self.active.len() >= self.limits.active_view_size {
            if let Some(victim) = self.active.keys().choose(rng).cloned() {
                let victim_spec = self.active.remove(&victim);
                outcome.evicted_active = victim_spec.clone();
                // The victim stays reachable through the passive view.
                if let Some(victim_spec) = victim_spec {
                    self.insert_passive(victim_spec, rng);
                }
            }
        }

        self.active.insert(spec.name.clone(), spec);
        outcome.changed = true;
        outcome
    }

    /// Merge a peer into the passive view, skipping self and active members.
    pub fn add_passive(&mut self, spec: NodeSpec, rng: &mut impl Rng) -> bool {
        if self.is_self(&spec.name)
            || self.active.contains_key(&spec.name)
            || self.passive.contains_key(&spec.name)
        {
            return false;
        }
        self.insert_passive(spec, rng);
        true
    }

    fn insert_passive(&mut self, spec: NodeSpec, rng: &mut impl Rng) {
        if self.passive.len() >= self.limits.passive_view_size {
            if let Some(victim) = self.passive.keys().choose(rng).cloned() {
                self.passive.remove(&victim);
            }
        }
        self.passive.insert(spec.name.clone(), spec);
    }

    /// Demote an active peer (received disconnect, or graceful eviction).
    pub fn move_active_to_passive(&mut self, name: &NodeName, rng: &mut impl Rng) -> bool {
        match self.active.remove(name) {
            Some(spec) => {
                self.insert_passive(spec, rng);
                true
            }
            None => false,
        }
    }

    /// Mark an active peer suspected: it leaves the active view and is
    /// remembered so a replacement can be negotiated.
    pub fn suspect(&mut self, name: &NodeName) -> Option<NodeSpec> {
        let spec = self.active.remove(name)?;
        self.suspected.insert(name.clone());
        Some(spec)
    }

    /// Forget a peer entirely (leave deltas).
    pub fn remove(&mut self, name: &NodeName) -> bool {
        let in_active = self.active.remove(name).is_some();
        let in_passive = self.passive.remove(name).is_some();
        self.pending.remove(name);
        self.suspected.remove(name);
        in_active || in_passive
    }

    pub fn random_active(
        &self,
        exclude: &[&NodeName],
        rng: &mut impl Rng,
    ) -> Option<NodeSpec> {
        self.active
            .values()
            .filter(|spec| !exclude.contains(&&spec.name))
            .choose(rng)
            .cloned()
    }

    pub fn random_passive(
        &self,
        exclude: &[&NodeName],
        rng: &mut impl Rng,
    ) -> Option<NodeSpec> {
        self.passive
            .values()
            .filter(|spec| !exclude.contains(&&spec.name))
            .choose(rng)
            .cloned()
    }

    pub fn sample_active(&self, count: usize, rng: &mut impl Rng) -> Vec<NodeSpec> {
        self.active.values().cloned().choose_multiple(rng, count)
    }

    pub fn sample_passive(&self, count: usize, rng: &mut impl Rng) -> Vec<NodeSpec> {
        self.passive.values().cloned().choose_multiple(rng, count)
    }

    /// Replace both views from a persisted snapshot.
    pub fn restore(&mut self, active: Vec<NodeSpec>, passive: Vec<NodeSpec>, rng: &mut impl Rng) {
        for spec in passive {
            self.add_passive(spec, rng);
        }
        // Restored active peers are not connected yet; they re-enter through
        // the pending path so connection state and view state stay aligned.
        for spec in active {
            if !self.is_self(&spec.name) {
                self.set_pending(spec.clone(), PendingKind::Admit);
                self.add_passive(spec, rng);
            }
        }
    }

    pub fn snapshot(&self) -> (Vec<NodeSpec>, Vec<NodeSpec>) {
        (
            self.active.values().cloned().collect(),
            self.passive.values().cloned().collect(),
        )
    }
}
