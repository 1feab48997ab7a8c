//! HyParView protocol state machine.
//!
//! The handler owns the views and turns protocol messages and connection
//! events into a list of actions for the manager task to interpret. Keeping
//! it free of sockets and clocks makes every protocol rule unit-testable.

use rand::Rng;

use crate::core::{Limits, NodeName, NodeSpec};
use crate::net::proto::{
    Disconnect, ForwardJoin, Message, Neighbor, NeighborAccepted, NeighborRejected, Shuffle,
    ShuffleReply,
};

use super::view::{PendingKind, Views};

/// Effects the manager runtime applies after a handler step.
#[derive(Debug)]
pub enum Action {
    /// Send over the existing membership connection to a known peer.
    Send(NodeName, Message),
    /// Send to a peer we may not be connected to yet; carries the spec so
    /// the runtime can dial first.
    SendSpec(NodeSpec, Message),
    /// Keep this peer's connection matrix dialed.
    Dial(NodeSpec),
    /// Close every socket to this peer and forget it in the registry.
    Drop(NodeName),
    /// Write the (active, passive) snapshot.
    Persist,
    /// Publish the active view to membership subscribers.
    Notify,
    /// Delete persisted state (leave of self).
    DeleteState,
}

pub struct Handler {
    views: Views,
    limits: Limits,
    broadcast: bool,
}

impl Handler {
    pub fn new(local: NodeSpec, limits: Limits, broadcast: bool) -> Self {
        Self {
            views: Views::new(local.clone(), limits.clone()),
            limits,
            broadcast,
        }
    }

    pub fn views(&self) -> &Views {
        &self.views
    }

    pub fn views_mut(&mut self) -> &mut Views {
        &mut self.views
    }

    fn local_name(&self) -> NodeName {
        self.views.local().name.clone()
    }

    fn local_spec(&self) -> NodeSpec {
        self.views.local().clone()
    }

    /// `join(peer)`: dial the contact node; the forward_join is issued once
    /// the hello handshake completes (connection-up with `PendingKind::Join`).
    pub fn handle_join(&mut self, target: NodeSpec) -> Vec<Action> {
        if self.views.is_self(&target.name) {
            return Vec::new();
        }
        self.views.set_pending(target.clone(), PendingKind::Join);
        vec![Action::Dial(target)]
    }

    /// `leave(peer)`: forget the peer locally and broadcast the delta.
    pub fn handle_leave(&mut self, peer: &NodeName) -> Vec<Action> {
        let mut actions = Vec::new();
        let removed = self.views.remove(peer);
        if removed {
            actions.push(Action::Drop(peer.clone()));
            if self.broadcast {
                let delta = Message::Disconnect(Disconnect {
                    peer: peer.clone(),
                    sender: self.local_name(),
                });
                for member in self.views.active_specs() {
                    actions.push(Action::Send(member.name.clone(), delta.clone()));
                }
            }
            actions.push(Action::Persist);
            actions.push(Action::Notify);
        }
        actions
    }

    /// `leave(self)`: notify everyone, drop everything, delete state.
    pub fn handle_leave_self(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        let delta = Message::Disconnect(Disconnect {
            peer: self.local_name(),
            sender: self.local_name(),
        });
        for member in self.views.active_specs() {
            if self.broadcast {
                actions.push(Action::Send(member.name.clone(), delta.clone()));
            }
            actions.push(Action::Drop(member.name.clone()));
        }
        actions.push(Action::DeleteState);
        actions
    }

    /// Connection-up for a peer.
    pub fn handle_peer_up(&mut self, spec: NodeSpec, rng: &mut impl Rng) -> Vec<Action> {
        if self.views.is_self(&spec.name) {
            return Vec::new();
        }

        let kind = self.views.pending_kind(&spec.name);
        self.views.clear_pending(&spec.name);

        if kind == Some(PendingKind::Replacement) {
            // Ask the candidate to adopt us; admission happens on
            // neighbor_accepted.
            let high_priority = self.views.active_len() == 0;
            let neighbor = Message::Neighbor(Neighbor {
                peer: self.local_spec(),
                high_priority,
                sender: self.local_name(),
            });
            return vec![Action::Send(spec.name.clone(), neighbor)];
        }

        let mut actions = Vec::new();
        if kind == Some(PendingKind::Join) {
            // We initiated join(spec): walk our own spec through the overlay.
            // The contact admits us through its own forward_join acceptance.
            actions.push(Action::Send(
                spec.name.clone(),
                Message::ForwardJoin(ForwardJoin {
                    peer: self.local_spec(),
                    ttl: self.limits.active_rwl,
                    sender: self.local_name(),
                }),
            ));
        } else {
            // Admission from a forward_join walk: the link must become
            // symmetric, so ask the peer to adopt us as well.
            let high_priority = self.views.active_len() == 0;
            actions.push(Action::Send(
                spec.name.clone(),
                Message::Neighbor(Neighbor {
                    peer: self.local_spec(),
                    high_priority,
                    sender: self.local_name(),
                }),
            ));
        }

        actions.extend(self.admit_active(spec, rng));
        actions
    }

    /// Connection-down for a peer.
    pub fn handle_peer_down(&mut self, name: &NodeName, rng: &mut impl Rng) -> Vec<Action> {
        let mut actions = Vec::new();

        if self.views.clear_pending(name) {
            // A dial attempt failed; nothing was admitted yet.
            return actions;
        }

        if self.views.in_passive(name) {
            self.views.remove(name);
            actions.push(Action::Persist);
            return actions;
        }

        if self.views.in_active(name) {
            self.views.suspect(name);
            actions.push(Action::Drop(name.clone()));
            tracing::info!(target: "membership", peer = %name, "active peer suspected");

            // Replacement: dial a random passive candidate; the neighbor
            // request is cast for the candidate, not the dead peer.
            if let Some(candidate) = self.views.random_passive(&[name], rng) {
                self.views
                    .set_pending(candidate.clone(), PendingKind::Replacement);
                actions.push(Action::Dial(candidate));
            }

            actions.push(Action::Persist);
            actions.push(Action::Notify);
        }

        actions
    }

    /// Periodic maintenance: shuffle with a random active member, and fill
    /// spare active capacity with a neighbor request to a passive candidate.
    pub fn handle_shuffle_tick(&mut self, rng: &mut impl Rng) -> Vec<Action> {
        let mut actions = Vec::new();

        if let Some(target) = self.views.random_active(&[], rng) {
            let mut exchange = vec![self.local_spec()];
            exchange.extend(
                self.views
                    .sample_active(self.limits.shuffle_active_count, rng),
            );
            exchange.extend(
                self.views
                    .sample_passive(self.limits.shuffle_passive_count, rng),
            );

            actions.push(Action::Send(
                target.name.clone(),
                Message::Shuffle(Shuffle {
                    exchange,
                    ttl: self.limits.active_rwl,
                    sender: self.local_spec(),
                }),
            ));
        }

        if self.views.active_len() < self.limits.active_view_size {
            if let Some(candidate) = self.views.random_passive(&[], rng) {
                if self.views.pending_kind(&candidate.name).is_none() {
                    self.views
                        .set_pending(candidate.clone(), PendingKind::Replacement);
                    actions.push(Action::Dial(candidate));
                }
            }
        }

        actions
    }

    pub fn handle_protocol(
        &mut self,
        from: NodeName,
        message: Message,
        rng: &mut impl Rng,
    ) -> Vec<Action> {
        match message {
            Message::ForwardJoin(msg) => self.on_forward_join(from, msg, rng),
            Message::Neighbor(msg) => self.on_neighbor(msg, rng),
            Message::NeighborAccepted(msg) => self.on_neighbor_accepted(msg, rng),
            Message::NeighborRejected(msg) => self.on_neighbor_rejected(msg, rng),
            Message::Shuffle(msg) => self.on_shuffle(from, msg, rng),
            Message::ShuffleReply(msg) => self.on_shuffle_reply(msg, rng),
            Message::Disconnect(msg) => self.on_disconnect(msg, rng),
            other => {
                tracing::warn!(
                    target: "membership",
                    from = %from,
                    "non-protocol message reached the manager: {other:?}"
                );
                Vec::new()
            }
        }
    }

    fn on_forward_join(
        &mut self,
        from: NodeName,
        msg: ForwardJoin,
        rng: &mut impl Rng,
    ) -> Vec<Action> {
        let new_peer = msg.peer;
        if self.views.is_self(&new_peer.name) {
            // Our own walk came back around.
            return Vec::new();
        }
        if self.views.in_active(&new_peer.name) {
            return Vec::new();
        }

        if msg.ttl == 0 || self.views.active_len() <= 1 {
            return self.start_admission(new_peer);
        }

        let mut actions = Vec::new();
        if msg.ttl == self.limits.passive_rwl && self.views.add_passive(new_peer.clone(), rng) {
            actions.push(Action::Persist);
        }

        match self.views.random_active(&[&from, &new_peer.name], rng) {
            Some(next) => {
                actions.push(Action::Send(
                    next.name.clone(),
                    Message::ForwardJoin(ForwardJoin {
                        peer: new_peer,
                        ttl: msg.ttl - 1,
                        sender: self.local_name(),
                    }),
                ));
                actions
            }
            None => {
                actions.extend(self.start_admission(new_peer));
                actions
            }
        }
    }

    fn on_neighbor(&mut self, msg: Neighbor, rng: &mut impl Rng) -> Vec<Action> {
        let acceptable =
            msg.high_priority || self.views.active_len() < self.limits.active_view_size;

        if !acceptable {
            tracing::debug!(
                target: "membership",
                peer = %msg.peer.name,
                "rejecting neighbor request, active view full"
            );
            return vec![Action::SendSpec(
                msg.peer,
                Message::NeighborRejected(NeighborRejected {
                    sender: self.local_name(),
                }),
            )];
        }

        let mut actions = vec![
            Action::SendSpec(
                msg.peer.clone(),
                Message::NeighborAccepted(NeighborAccepted {
                    sender: self.local_spec(),
                }),
            ),
            Action::Dial(msg.peer.clone()),
        ];
        actions.extend(self.admit_active(msg.peer, rng));
        actions
    }

    fn on_neighbor_accepted(&mut self, msg: NeighborAccepted, rng: &mut impl Rng) -> Vec<Action> {
        self.views.clear_pending(&msg.sender.name);
        let mut actions = vec![Action::Dial(msg.sender.clone())];
        actions.extend(self.admit_active(msg.sender, rng));
        actions
    }

    fn on_neighbor_rejected(&mut self, msg: NeighborRejected, rng: &mut impl Rng) -> Vec<Action> {
        self.views.clear_pending(&msg.sender);

        let mut actions = Vec::new();
        if !self.views.in_active(&msg.sender) {
            // Stop holding sockets to the candidate; the close also retires
            // it from the passive view via the connection-down rules.
            actions.push(Action::Drop(msg.sender.clone()));
        }

        // Try the next passive candidate while a replacement is still owed.
        if self.views.suspected_len() == 0 {
            return actions;
        }
        if let Some(candidate) = self.views.random_passive(&[&msg.sender], rng) {
            self.views
                .set_pending(candidate.clone(), PendingKind::Replacement);
            actions.push(Action::Dial(candidate));
        }
        actions
    }

    fn on_shuffle(&mut self, from: NodeName, msg: Shuffle, rng: &mut impl Rng) -> Vec<Action> {
        if msg.ttl > 0 && self.views.active_len() > 1 {
            if let Some(next) = self
                .views
                .random_active(&[&from, &msg.sender.name], rng)
            {
                return vec![Action::Send(
                    next.name.clone(),
                    Message::Shuffle(Shuffle {
                        exchange: msg.exchange,
                        ttl: msg.ttl - 1,
                        sender: msg.sender,
                    }),
                )];
            }
        }

        let response = self.views.sample_passive(msg.exchange.len(), rng);
        let mut actions = vec![Action::SendSpec(
            msg.sender.clone(),
            Message::ShuffleReply(ShuffleReply {
                exchange: response,
                sender: self.local_name(),
            }),
        )];
        if self.merge_into_passive(msg.exchange, rng) {
            actions.push(Action::Persist);
        }
        actions
    }

    fn on_shuffle_reply(&mut self, msg: ShuffleReply, rng: &mut impl Rng) -> Vec<Action> {
        if self.merge_into_passive(msg.exchange, rng) {
            vec![Action::Persist]
        } else {
            Vec::new()
        }
    }

    fn on_disconnect(&mut self, msg: Disconnect, rng: &mut impl Rng) -> Vec<Action> {
        if self.views.is_self(&msg.peer) {
            // The sender evicted us from its active view.
            let mut actions = Vec::new();
            if self.views.move_active_to_passive(&msg.sender, rng) {
                actions.push(Action::Drop(msg.sender.clone()));
                actions.push(Action::Persist);
                actions.push(Action::Notify);
            }
            return actions;
        }

        // Leave delta for a third party.
        if self.views.remove(&msg.peer) {
            vec![
                Action::Drop(msg.peer.clone()),
                Action::Persist,
                Action::Notify,
            ]
        } else {
            Vec::new()
        }
    }

    /// Begin admitting a peer we are not yet connected to.
    fn start_admission(&mut self, spec: NodeSpec) -> Vec<Action> {
        if self.views.pending_kind(&spec.name).is_some() {
            return Vec::new();
        }
        self.views.set_pending(spec.clone(), PendingKind::Admit);
        vec![Action::Dial(spec)]
    }

    /// Insert into the active view, evicting (with a disconnect cast) when
    /// full, and broadcast the newcomer to the rest of the active view.
    fn admit_active(&mut self, spec: NodeSpec, rng: &mut impl Rng) -> Vec<Action> {
        let newcomer = spec.name.clone();
        let outcome = self.views.add_active(spec.clone(), rng);
        if !outcome.changed {
            return Vec::new();
        }

        let mut actions = Vec::new();
        if let Some(victim) = outcome.evicted_active {
            actions.push(Action::Send(
                victim.name.clone(),
                Message::Disconnect(Disconnect {
                    peer: victim.name.clone(),
                    sender: self.local_name(),
                }),
            ));
            actions.push(Action::Drop(victim.name.clone()));
        }

        for member in self.views.active_specs() {
            if member.name != newcomer {
                actions.push(Action::Send(
                    member.name.clone(),
                    Message::ForwardJoin(ForwardJoin {
                        peer: spec.clone(),
                        ttl: self.limits.active_rwl,
                        sender: self.local_name(),
                    }),
                ));
            }
        }

        actions.push(Action::Dial(spec));
        actions.push(Action::Persist);
        actions.push(Action::Notify);
        actions
    }

    fn merge_into_passive(&mut self, exchange: Vec<NodeSpec>, rng: &mut impl Rng) -> bool {
        let mut changed = false;
        for spec in exchange {
            changed |= self.views.add_passive(spec, rng);
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use crate::core::{ChannelId, ListenAddr};

    fn spec(name: &str) -> NodeSpec {
        NodeSpec {
            name: NodeName::parse(name).unwrap(),
            listen_addrs: vec![ListenAddr::parse("127.0.0.1:1").unwrap()],
            channels: vec![ChannelId::default_channel(), ChannelId::membership()],
        }
    }

    fn name(raw: &str) -> NodeName {
        NodeName::parse(raw).unwrap()
    }

    fn handler() -> (Handler, StdRng) {
        (
            Handler::new(spec("self@h"), Limits::default(), true),
            StdRng::seed_from_u64(11),
        )
    }

    fn fill_active(handler: &mut Handler, rng: &mut StdRng, count: usize) {
        for i in 0..count {
            handler.views_mut().add_active(spec(&format!("a{i}@h")), rng);
        }
    }

    fn sends_to<'a>(actions: &'a [Action], target: &NodeName) -> Vec<&'a Message> {
        actions
            .iter()
            .filter_map(|action| match action {
                Action::Send(to, msg) if to == target => Some(msg),
                Action::SendSpec(to, msg) if &to.name == target => Some(msg),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn join_dials_then_walks_self_on_up() {
        let (mut handler, mut rng) = handler();
        let actions = handler.handle_join(spec("contact@h"));
        assert!(matches!(actions[0], Action::Dial(_)));

        let actions = handler.handle_peer_up(spec("contact@h"), &mut rng);
        let sent = sends_to(&actions, &name("contact@h"));
        let forward_join = sent
            .iter()
            .find_map(|msg| match msg {
                Message::ForwardJoin(fj) => Some(fj),
                _ => None,
            })
            .expect("forward_join to contact");
        assert_eq!(forward_join.ttl, Limits::default().active_rwl);
        assert_eq!(forward_join.peer.name.as_str(), "self@h");
        assert!(handler.views().in_active(&name("contact@h")));
    }

    #[test]
    fn admission_requests_symmetric_link() {
        let (mut handler, mut rng) = handler();
        handler.handle_protocol(
            name("x@h"),
            Message::ForwardJoin(ForwardJoin {
                peer: spec("new@h"),
                ttl: 0,
                sender: name("x@h"),
            }),
            &mut rng,
        );

        let actions = handler.handle_peer_up(spec("new@h"), &mut rng);
        let sent = sends_to(&actions, &name("new@h"));
        let neighbor = sent
            .iter()
            .find_map(|msg| match msg {
                Message::Neighbor(n) => Some(n),
                _ => None,
            })
            .expect("neighbor request for symmetric link");
        // Active view was empty at connection-up, so priority is high.
        assert!(neighbor.high_priority);
        assert!(handler.views().in_active(&name("new@h")));
    }

    #[test]
    fn forward_join_ttl_zero_admits() {
        let (mut handler, mut rng) = handler();
        fill_active(&mut handler, &mut rng, 3);

        let actions = handler.handle_protocol(
            name("a0@h"),
            Message::ForwardJoin(ForwardJoin {
                peer: spec("new@h"),
                ttl: 0,
                sender: name("a0@h"),
            }),
            &mut rng,
        );

        assert!(actions.iter().any(|a| matches!(a, Action::Dial(s) if s.name.as_str() == "new@h")));
        assert_eq!(
            handler.views().pending_kind(&name("new@h")),
            Some(crate::membership::view::PendingKind::Admit)
        );
    }

    #[test]
    fn forward_join_walks_with_decremented_ttl() {
        let (mut handler, mut rng) = handler();
        fill_active(&mut handler, &mut rng, 4);

        let actions = handler.handle_protocol(
            name("a0@h"),
            Message::ForwardJoin(ForwardJoin {
                peer: spec("new@h"),
                ttl: 5,
                sender: name("a0@h"),
            }),
            &mut rng,
        );

        let forwarded = actions
            .iter()
            .find_map(|action| match action {
                Action::Send(to, Message::ForwardJoin(fj)) => Some((to, fj)),
                _ => None,
            })
            .expect("forwarded walk");
        assert_eq!(forwarded.1.ttl, 4);
        assert_ne!(forwarded.0, &name("a0@h"));
        assert_ne!(forwarded.0, &name("new@h"));
        // Not at PRWL, so the peer is not yet in passive.
        assert!(!handler.views().in_passive(&name("new@h")));
    }

    #[test]
    fn forward_join_at_prwl_adds_to_passive() {
        let (mut handler, mut rng) = handler();
        fill_active(&mut handler, &mut rng, 4);

        let ttl = Limits::default().passive_rwl;
        handler.handle_protocol(
            name("a0@h"),
            Message::ForwardJoin(ForwardJoin {
                peer: spec("new@h"),
                ttl,
                sender: name("a0@h"),
            }),
            &mut rng,
        );
        assert!(handler.views().in_passive(&name("new@h")));
    }

    #[test]
    fn neighbor_low_priority_rejected_when_full() {
        let (mut handler, mut rng) = handler();
        fill_active(&mut handler, &mut rng, Limits::default().active_view_size);

        let actions = handler.handle_protocol(
            name("x@h"),
            Message::Neighbor(Neighbor {
                peer: spec("x@h"),
                high_priority: false,
                sender: name("x@h"),
            }),
            &mut rng,
        );

        let sent = sends_to(&actions, &name("x@h"));
        assert!(matches!(sent[0], Message::NeighborRejected(_)));
        assert!(!handler.views().in_active(&name("x@h")));
    }

    #[test]
    fn neighbor_high_priority_always_accepted() {
        let (mut handler, mut rng) = handler();
        fill_active(&mut handler, &mut rng, Limits::default().active_view_size);

        let actions = handler.handle_protocol(
            name("x@h"),
            Message::Neighbor(Neighbor {
                peer: spec("x@h"),
                high_priority: true,
                sender: name("x@h"),
            }),
            &mut rng,
        );

        let sent = sends_to(&actions, &name("x@h"));
        assert!(sent
            .iter()
            .any(|msg| matches!(msg, Message::NeighborAccepted(_))));
        assert!(handler.views().in_active(&name("x@h")));
        // Capacity respected via eviction.
        assert_eq!(
            handler.views().active_len(),
            Limits::default().active_view_size
        );
    }

    #[test]
    fn neighbor_accepted_when_active_empty_must_accept() {
        let (mut handler, mut rng) = handler();
        let actions = handler.handle_protocol(
            name("x@h"),
            Message::Neighbor(Neighbor {
                peer: spec("x@h"),
                high_priority: false,
                sender: name("x@h"),
            }),
            &mut rng,
        );
        let sent = sends_to(&actions, &name("x@h"));
        assert!(sent
            .iter()
            .any(|msg| matches!(msg, Message::NeighborAccepted(_))));
    }

    #[test]
    fn eviction_casts_disconnect_to_victim() {
        let (mut handler, mut rng) = handler();
        fill_active(&mut handler, &mut rng, Limits::default().active_view_size);

        let actions = handler.handle_peer_up(spec("new@h"), &mut rng);

        let disconnect = actions
            .iter()
            .find_map(|action| match action {
                Action::Send(to, Message::Disconnect(d)) => Some((to, d)),
                _ => None,
            })
            .expect("disconnect to evicted member");
        assert_eq!(&disconnect.1.peer, disconnect.0);
        assert_eq!(disconnect.1.sender, name("self@h"));
        assert_eq!(
            handler.views().active_len(),
            Limits::default().active_view_size
        );
    }

    #[test]
    fn shuffle_with_single_active_replies_and_merges() {
        let (mut handler, mut rng) = handler();
        fill_active(&mut handler, &mut rng, 1);

        let actions = handler.handle_protocol(
            name("a0@h"),
            Message::Shuffle(Shuffle {
                exchange: vec![spec("s@h"), spec("p1@h"), spec("p2@h")],
                ttl: 3,
                sender: spec("s@h"),
            }),
            &mut rng,
        );

        let replies = sends_to(&actions, &name("s@h"));
        assert!(matches!(replies[0], Message::ShuffleReply(_)));
        assert!(handler.views().in_passive(&name("p1@h")));
        assert!(handler.views().in_passive(&name("p2@h")));
        assert!(handler.views().in_passive(&name("s@h")));
    }

    #[test]
    fn shuffle_merge_skips_self_and_active() {
        let (mut handler, mut rng) = handler();
        fill_active(&mut handler, &mut rng, 1);

        handler.handle_protocol(
            name("a0@h"),
            Message::Shuffle(Shuffle {
                exchange: vec![spec("self@h"), spec("a0@h"), spec("fresh@h")],
                ttl: 0,
                sender: spec("s@h"),
            }),
            &mut rng,
        );

        assert!(!handler.views().in_passive(&name("self@h")));
        assert!(!handler.views().in_passive(&name("a0@h")));
        assert!(handler.views().in_active(&name("a0@h")));
        assert!(handler.views().in_passive(&name("fresh@h")));
    }

    #[test]
    fn shuffle_forwards_while_ttl_remains() {
        let (mut handler, mut rng) = handler();
        fill_active(&mut handler, &mut rng, 4);

        let actions = handler.handle_protocol(
            name("a0@h"),
            Message::Shuffle(Shuffle {
                exchange: vec![spec("s@h")],
                ttl: 2,
                sender: spec("s@h"),
            }),
            &mut rng,
        );

        let forwarded = actions
            .iter()
            .find_map(|action| match action {
                Action::Send(to, Message::Shuffle(s)) => Some((to, s)),
                _ => None,
            })
            .expect("forwarded shuffle");
        assert_eq!(forwarded.1.ttl, 1);
        assert_ne!(forwarded.0, &name("a0@h"));
    }

    #[test]
    fn shuffle_tick_mixes_self_active_and_passive() {
        let (mut handler, mut rng) = handler();
        fill_active(&mut handler, &mut rng, 3);
        for i in 0..6 {
            handler
                .views_mut()
                .add_passive(spec(&format!("p{i}@h")), &mut rng);
        }

        let actions = handler.handle_shuffle_tick(&mut rng);
        let shuffle = actions
            .iter()
            .find_map(|action| match action {
                Action::Send(_, Message::Shuffle(s)) => Some(s),
                _ => None,
            })
            .expect("shuffle sent");

        assert!(shuffle
            .exchange
            .iter()
            .any(|s| s.name.as_str() == "self@h"));
        let limits = Limits::default();
        assert!(
            shuffle.exchange.len()
                <= 1 + limits.shuffle_active_count + limits.shuffle_passive_count
        );
    }

    #[test]
    fn shuffle_tick_without_active_peers_is_silent() {
        let (mut handler, mut rng) = handler();
        assert!(handler.handle_shuffle_tick(&mut rng).is_empty());
    }

    #[test]
    fn peer_down_suspects_and_dials_replacement_candidate() {
        let (mut handler, mut rng) = handler();
        fill_active(&mut handler, &mut rng, 2);
        handler.views_mut().add_passive(spec("backup@h"), &mut rng);

        let actions = handler.handle_peer_down(&name("a0@h"), &mut rng);

        assert!(handler.views().is_suspected(&name("a0@h")));
        assert!(!handler.views().in_active(&name("a0@h")));
        // The dial targets the replacement candidate, not the dead peer.
        let dialed = actions
            .iter()
            .find_map(|action| match action {
                Action::Dial(spec) => Some(spec),
                _ => None,
            })
            .expect("replacement dial");
        assert_eq!(dialed.name.as_str(), "backup@h");
        assert_eq!(
            handler.views().pending_kind(&name("backup@h")),
            Some(crate::membership::view::PendingKind::Replacement)
        );
    }

    #[test]
    fn replacement_up_sends_neighbor_with_priority() {
        let (mut handler, mut rng) = handler();
        fill_active(&mut handler, &mut rng, 1);
        handler.views_mut().add_passive(spec("backup@h"), &mut rng);
        handler.handle_peer_down(&name("a0@h"), &mut rng);

        // Active view is empty now, so priority must be high.
        let actions = handler.handle_peer_up(spec("backup@h"), &mut rng);
        let sent = sends_to(&actions, &name("backup@h"));
        let neighbor = sent
            .iter()
            .find_map(|msg| match msg {
                Message::Neighbor(n) => Some(n),
                _ => None,
            })
            .expect("neighbor request");
        assert!(neighbor.high_priority);
    }

    #[test]
    fn neighbor_rejected_tries_next_candidate() {
        let (mut handler, mut rng) = handler();
        fill_active(&mut handler, &mut rng, 2);
        handler.views_mut().add_passive(spec("b1@h"), &mut rng);
        handler.views_mut().add_passive(spec("b2@h"), &mut rng);
        handler.handle_peer_down(&name("a0@h"), &mut rng);

        let rejected = handler
            .views()
            .pending_kind(&name("b1@h"))
            .map(|_| name("b1@h"))
            .unwrap_or_else(|| name("b2@h"));
        let other = if rejected.as_str() == "b1@h" {
            name("b2@h")
        } else {
            name("b1@h")
        };

        let actions = handler.handle_protocol(
            rejected.clone(),
            Message::NeighborRejected(NeighborRejected {
                sender: rejected.clone(),
            }),
            &mut rng,
        );

        let dialed = actions
            .iter()
            .find_map(|action| match action {
                Action::Dial(spec) => Some(spec.name.clone()),
                _ => None,
            })
            .expect("next candidate dialed");
        assert_eq!(dialed, other);
    }

    #[test]
    fn disconnect_from_evictor_moves_it_to_passive() {
        let (mut handler, mut rng) = handler();
        fill_active(&mut handler, &mut rng, 2);

        let actions = handler.handle_protocol(
            name("a0@h"),
            Message::Disconnect(Disconnect {
                peer: name("self@h"),
                sender: name("a0@h"),
            }),
            &mut rng,
        );

        assert!(!handler.views().in_active(&name("a0@h")));
        assert!(handler.views().in_passive(&name("a0@h")));
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::Drop(n) if n == &name("a0@h"))));
    }

    #[test]
    fn leave_broadcasts_delta_and_forgets() {
        let (mut handler, mut rng) = handler();
        fill_active(&mut handler, &mut rng, 3);

        let actions = handler.handle_leave(&name("a1@h"));

        assert!(!handler.views().in_active(&name("a1@h")));
        let deltas: Vec<_> = actions
            .iter()
            .filter_map(|action| match action {
                Action::Send(to, Message::Disconnect(d)) => Some((to, d)),
                _ => None,
            })
            .collect();
        // Remaining two active members hear about the departure.
        assert_eq!(deltas.len(), 2);
        assert!(deltas.iter().all(|(_, d)| d.peer == name("a1@h")));
    }

    #[test]
    fn leave_is_idempotent() {
        let (mut handler, mut rng) = handler();
        fill_active(&mut handler, &mut rng, 1);
        assert!(!handler.handle_leave(&name("a0@h")).is_empty());
        assert!(handler.handle_leave(&name("a0@h")).is_empty());
    }
}
