//! Membership manager task.
//!
//! One mailbox-driven task owns the views. Everything else (listeners, the
//! registry's connector tasks, the dispatcher) communicates with it through
//! messages; nothing but this task touches membership state. The periodic
//! shuffle rides the same loop off a tick channel.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{bounded, tick, unbounded, Receiver, Sender};

use crate::core::{Limits, NodeName, NodeSpec, RefFormat};
use crate::events::PeerEvents;
use crate::net::proto::{encode_envelope, Envelope, Message};
use crate::net::registry::ConnectionRegistry;
use crate::net::ConnectError;

use super::handler::{Action, Handler};
use super::persist::SnapshotStore;

pub enum ManagerMsg {
    Join(NodeSpec, Sender<Result<(), ConnectError>>),
    Leave(NodeName),
    Members(Sender<Vec<NodeSpec>>),
    LocalState(Sender<(Vec<NodeSpec>, Vec<NodeSpec>)>),
    Protocol(NodeName, Message),
    PeerUp(NodeSpec),
    PeerDown(NodeName),
    Shutdown,
}

pub struct ManagerHandle {
    tx: Sender<ManagerMsg>,
    join: Option<JoinHandle<()>>,
    join_timeout: Duration,
}

impl ManagerHandle {
    pub fn sender(&self) -> Sender<ManagerMsg> {
        self.tx.clone()
    }

    /// `join(peer)`: resolves once the hello handshake to the contact node
    /// has succeeded (or failed).
    pub fn join(&self, peer: NodeSpec) -> Result<(), ConnectError> {
        let (reply_tx, reply_rx) = bounded(1);
        if self.tx.send(ManagerMsg::Join(peer.clone(), reply_tx)).is_err() {
            return Err(ConnectError::NoAddress { peer: peer.name });
        }
        match reply_rx.recv_timeout(self.join_timeout) {
            Ok(result) => result,
            Err(_) => Err(ConnectError::Timeout {
                addr: peer
                    .primary_addr()
                    .unwrap_or_else(|| "0.0.0.0:0".parse().expect("static addr")),
                ms: self.join_timeout.as_millis() as u64,
            }),
        }
    }

    pub fn leave(&self, peer: NodeName) {
        let _ = self.tx.send(ManagerMsg::Leave(peer));
    }

    /// Best-effort local view of the active membership.
    pub fn members(&self) -> Vec<NodeSpec> {
        let (reply_tx, reply_rx) = bounded(1);
        if self.tx.send(ManagerMsg::Members(reply_tx)).is_err() {
            return Vec::new();
        }
        reply_rx
            .recv_timeout(Duration::from_secs(5))
            .unwrap_or_default()
    }

    pub fn local_state(&self) -> (Vec<NodeSpec>, Vec<NodeSpec>) {
        let (reply_tx, reply_rx) = bounded(1);
        if self.tx.send(ManagerMsg::LocalState(reply_tx)).is_err() {
            return (Vec::new(), Vec::new());
        }
        reply_rx
            .recv_timeout(Duration::from_secs(5))
            .unwrap_or_default()
    }

    pub fn shutdown(mut self) {
        let _ = self.tx.send(ManagerMsg::Shutdown);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

pub struct ManagerConfig {
    pub local: NodeSpec,
    pub limits: Limits,
    pub broadcast: bool,
    pub ref_format: RefFormat,
    pub persist: Option<SnapshotStore>,
}

pub fn start(
    config: ManagerConfig,
    registry: ConnectionRegistry,
    events: std::sync::Arc<PeerEvents>,
) -> ManagerHandle {
    let (tx, rx) = unbounded();
    let join_timeout = Duration::from_millis(config.limits.connect_timeout_ms * 2);

    let join = thread::spawn(move || {
        let mut runtime = ManagerRuntime {
            handler: Handler::new(
                config.local.clone(),
                config.limits.clone(),
                config.broadcast,
            ),
            registry,
            events,
            persist: config.persist,
            ref_format: config.ref_format,
            limits: config.limits,
        };
        runtime.restore_from_snapshot();
        runtime.run(rx);
    });

    ManagerHandle {
        tx,
        join: Some(join),
        join_timeout,
    }
}

struct ManagerRuntime {
    handler: Handler,
    registry: ConnectionRegistry,
    events: std::sync::Arc<PeerEvents>,
    persist: Option<SnapshotStore>,
    ref_format: RefFormat,
    limits: Limits,
}

impl ManagerRuntime {
    fn restore_from_snapshot(&mut self) {
        let Some(store) = &self.persist else {
            return;
        };
        let Some((active, passive)) = store.load() else {
            return;
        };
        tracing::info!(
            target: "membership",
            active = active.len(),
            passive = passive.len(),
            "restored cluster state"
        );
        let mut rng = rand::thread_rng();
        self.handler
            .views_mut()
            .restore(active.clone(), passive, &mut rng);
        // Previously-active peers are re-dialed; they are admitted again on
        // connection-up.
        for spec in active {
            self.registry.insert_peer(spec);
        }
    }

    fn run(&mut self, rx: Receiver<ManagerMsg>) {
        let shuffle_tick = tick(Duration::from_millis(self.limits.shuffle_interval_ms));

        loop {
            crossbeam::select! {
                recv(rx) -> msg => {
                    let msg = match msg {
                        Ok(msg) => msg,
                        Err(_) => break,
                    };
                    if !self.handle(msg) {
                        break;
                    }
                }
                recv(shuffle_tick) -> _ => {
                    let mut rng = rand::thread_rng();
                    let actions = self.handler.handle_shuffle_tick(&mut rng);
                    self.apply_actions(actions);
                }
            }
        }
    }

    /// Returns false on shutdown.
    fn handle(&mut self, msg: ManagerMsg) -> bool {
        let mut rng = rand::thread_rng();
        match msg {
            ManagerMsg::Join(spec, reply) => {
                let actions = self.handler.handle_join(spec.clone());
                self.apply_actions(actions);
                // join() resolves with the hello handshake to the contact.
                let result = self.registry.ensure_peer_sync(spec);
                let _ = reply.send(result);
            }
            ManagerMsg::Leave(peer) => {
                let actions = if self.handler.views().is_self(&peer) {
                    self.handler.handle_leave_self()
                } else {
                    self.handler.handle_leave(&peer)
                };
                self.apply_actions(actions);
            }
            ManagerMsg::Members(reply) => {
                let _ = reply.send(self.handler.views().active_specs());
            }
            ManagerMsg::LocalState(reply) => {
                let _ = reply.send(self.handler.views().snapshot());
            }
            ManagerMsg::Protocol(from, message) => {
                let actions = self.handler.handle_protocol(from, message, &mut rng);
                self.apply_actions(actions);
            }
            ManagerMsg::PeerUp(spec) => {
                let actions = self.handler.handle_peer_up(spec, &mut rng);
                self.apply_actions(actions);
            }
            ManagerMsg::PeerDown(name) => {
                let actions = self.handler.handle_peer_down(&name, &mut rng);
                self.apply_actions(actions);
            }
            ManagerMsg::Shutdown => return false,
        }
        true
    }

    fn apply_actions(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Send(peer, message) => self.send_to(&peer, message),
                Action::SendSpec(spec, message) => self.send_spec(&spec, message),
                Action::Dial(spec) => self.registry.insert_peer(spec),
                Action::Drop(peer) => self.registry.close_peer(&peer),
                Action::Persist => self.persist_views(),
                Action::Notify => self
                    .events
                    .notify_membership(self.handler.views().active_specs()),
                Action::DeleteState => {
                    if let Some(store) = &self.persist {
                        store.delete();
                    }
                }
            }
        }
    }

    fn send_to(&self, peer: &NodeName, message: Message) {
        let bytes = match encode_envelope(&Envelope::v1(message), self.ref_format) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::error!(target: "membership", "protocol encode failed: {err}");
                return;
            }
        };

        let membership = crate::core::ChannelId::membership();
        let handle = match self.registry.pick(peer, &membership, None) {
            Ok(handle) => handle,
            Err(_) => {
                // Not connected yet; open the membership lane if we know the
                // peer at all.
                if self.registry.ensure(peer, &membership, 0).is_err() {
                    tracing::debug!(
                        target: "membership",
                        peer = %peer,
                        "dropping protocol message for unreachable peer"
                    );
                    return;
                }
                match self.registry.pick(peer, &membership, None) {
                    Ok(handle) => handle,
                    Err(_) => return,
                }
            }
        };

        if let Err(err) = handle.send_frame(bytes) {
            tracing::debug!(target: "membership", peer = %peer, "protocol send failed: {err}");
        }
    }

    /// One-shot protocol send to a peer we are not (yet) keeping
    /// connections to. Known peers reuse their membership socket; everyone
    /// else gets a transient connection that closes after the frame drains,
    /// so shuffle walks do not accrete sockets.
    fn send_spec(&self, spec: &NodeSpec, message: Message) {
        if self.registry.peer_spec(&spec.name).is_some() {
            self.send_to(&spec.name, message);
            return;
        }

        let bytes = match encode_envelope(&Envelope::v1(message), self.ref_format) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::error!(target: "membership", "protocol encode failed: {err}");
                return;
            }
        };
        let addr = match spec.primary_addr() {
            Some(addr) => addr,
            None => return,
        };

        let key = crate::net::ConnKey {
            peer: spec.name.clone(),
            channel: crate::core::ChannelId::membership(),
            slot: 0,
        };
        let (failure_tx, _failure_rx) = crossbeam::channel::unbounded();
        match crate::net::client::dial(addr, key, &self.registry.dial_options(), failure_tx) {
            Ok(conn) => {
                let _ = conn.handle().send_frame(bytes);
                // Shutdown queues behind the frame; the writer drains FIFO.
                conn.shutdown();
            }
            Err(err) => {
                tracing::debug!(
                    target: "membership",
                    peer = %spec.name,
                    "transient protocol send failed: {err}"
                );
            }
        }
    }

    fn persist_views(&self) {
        if let Some(store) = &self.persist {
            let (active, passive) = self.handler.views().snapshot();
            if let Err(err) = store.save(&active, &passive) {
                tracing::warn!(target: "membership", "cluster state write failed: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use crate::core::{ChannelId, ChannelOptions, ListenAddr};
    use crate::net::registry::{RegistryConfig, RegistryNotice};
    use crate::net::DialOptions;

    fn local_spec(name: &str) -> NodeSpec {
        NodeSpec {
            name: NodeName::parse(name).unwrap(),
            listen_addrs: vec![ListenAddr::parse("127.0.0.1:1").unwrap()],
            channels: vec![ChannelId::default_channel(), ChannelId::membership()],
        }
    }

    fn test_registry(local: &str) -> (ConnectionRegistry, Receiver<RegistryNotice>) {
        let mut channels = BTreeMap::new();
        channels.insert(ChannelId::membership(), ChannelOptions::default());
        let (notices_tx, notices_rx) = unbounded();
        let registry = ConnectionRegistry::new(
            RegistryConfig {
                channels,
                dial: DialOptions {
                    local: NodeName::parse(local).unwrap(),
                    connect_timeout: Duration::from_millis(200),
                    egress_delay: Duration::ZERO,
                    keepalive: Duration::from_secs(30),
                    max_frame_bytes: Limits::default().max_frame_bytes,
                    ref_format: RefFormat::ImproperList,
                    tls: None,
                },
                reconnect_base: Duration::from_millis(20),
                reconnect_max: Duration::from_millis(50),
            },
            Arc::new(PeerEvents::new()),
            notices_tx,
        );
        (registry, notices_rx)
    }

    fn start_manager(local: &str) -> (ManagerHandle, ConnectionRegistry) {
        let (registry, _notices) = test_registry(local);
        let handle = start(
            ManagerConfig {
                local: local_spec(local),
                limits: Limits::default(),
                broadcast: true,
                ref_format: RefFormat::ImproperList,
                persist: None,
            },
            registry.clone(),
            Arc::new(PeerEvents::new()),
        );
        (handle, registry)
    }

    #[test]
    fn fresh_manager_has_empty_views() {
        let (handle, registry) = start_manager("m@h");
        assert!(handle.members().is_empty());
        let (active, passive) = handle.local_state();
        assert!(active.is_empty());
        assert!(passive.is_empty());
        handle.shutdown();
        registry.shutdown();
    }

    #[test]
    fn join_unreachable_peer_reports_error() {
        let (handle, registry) = start_manager("m@h");
        // Port chosen by binding-then-dropping, so the dial is refused.
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let peer = NodeSpec {
            name: NodeName::parse("gone@h").unwrap(),
            listen_addrs: vec![ListenAddr::from(addr)],
            channels: vec![ChannelId::membership()],
        };
        assert!(handle.join(peer).is_err());
        handle.shutdown();
        registry.shutdown();
    }

    #[test]
    fn leave_of_unknown_peer_is_idempotent() {
        let (handle, registry) = start_manager("m@h");
        handle.leave(NodeName::parse("ghost@h").unwrap());
        handle.leave(NodeName::parse("ghost@h").unwrap());
        assert!(handle.members().is_empty());
        handle.shutdown();
        registry.shutdown();
    }
}
