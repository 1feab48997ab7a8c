//! Node runtime: wires listeners, registry, manager and dispatcher together
//! and exposes the public facade.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::{unbounded, Receiver, Sender};
use thiserror::Error;

use crate::config::Config;
use crate::core::{ChannelId, NodeName, NodeSpec, RemoteRef};
use crate::dispatch::{
    causal::DeliveryFn, AckReceipt, Dispatcher, DispatcherConfig, FilterFn, FilterTag,
    PartitionRef, SendOptions,
};
use crate::error::Transience;
use crate::events::{PeerCallback, PeerEvents};
use crate::membership::{self, ManagerConfig, ManagerHandle, ManagerMsg, SnapshotStore};
use crate::net::registry::{ConnectionRegistry, RegistryConfig, RegistryNotice};
use crate::net::server::{self, ListenerConfig, ListenerHandle, NetEvent};
use crate::net::{AcceptError, DialOptions, TlsContext, TlsError};
use crate::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("no listen address configured")]
    NoListenAddr,
    #[error(transparent)]
    Accept(#[from] AcceptError),
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error("node already shut down")]
    ShutDown,
}

impl NodeError {
    pub fn transience(&self) -> Transience {
        match self {
            NodeError::NoListenAddr => Transience::Permanent,
            NodeError::Accept(_) | NodeError::Tls(_) => Transience::Unknown,
            NodeError::ShutDown => Transience::Permanent,
        }
    }
}

/// Handle to a running node. Clones share the same runtime.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

/// Alias kept for call sites that hold the owning handle.
pub type NodeHandle = Node;

struct NodeInner {
    spec: NodeSpec,
    registry: ConnectionRegistry,
    dispatcher: Dispatcher,
    manager: Mutex<Option<ManagerHandle>>,
    manager_tx: Sender<ManagerMsg>,
    listeners: Mutex<Vec<ListenerHandle>>,
    events: Arc<PeerEvents>,
    shutdown: AtomicBool,
}

impl Node {
    /// Start a node from configuration: bind every listen address, spawn the
    /// membership manager and dispatcher, and start routing frames.
    pub fn start(config: Config) -> Result<Node, Error> {
        config.validate()?;
        let channels = config.effective_channels()?;
        let limits = config.limits.clone();

        let listen_addrs = config.effective_listen_addrs();
        if listen_addrs.is_empty() {
            return Err(NodeError::NoListenAddr.into());
        }

        let tls = if config.tls {
            Some(
                TlsContext::from_options(&config.tls_server_options, &config.tls_client_options)
                    .map_err(NodeError::Tls)?,
            )
        } else {
            None
        };

        if config.connect_disterl {
            tracing::debug!("connect_disterl is set but has no effect here");
        }

        // Bind sockets before fixing the node name so ephemeral ports end up
        // in our own spec, then hand them to the accept loops.
        let mut sockets = Vec::new();
        let mut bound_addrs = Vec::new();
        for addr in &listen_addrs {
            let socket = std::net::TcpListener::bind(addr.socket_addr())
                .map_err(|e| NodeError::Accept(AcceptError::Io(e)))?;
            bound_addrs.push(crate::core::ListenAddr::from(
                socket
                    .local_addr()
                    .map_err(|e| NodeError::Accept(AcceptError::Io(e)))?,
            ));
            sockets.push(socket);
        }

        let name = match &config.name {
            Some(name) => NodeName::parse(name.clone())?,
            None => {
                let first = bound_addrs[0];
                NodeName::parse(format!("partisan_{}@{}", first.port, first.ip))?
            }
        };
        let spec = NodeSpec::new(
            name.clone(),
            bound_addrs,
            channels.keys().cloned().collect(),
        );

        let (net_tx, net_rx) = unbounded::<NetEvent>();
        let mut listeners = Vec::new();
        for socket in sockets {
            let handle = server::start_with(
                socket,
                ListenerConfig {
                    local: name.clone(),
                    limits: limits.clone(),
                    ingress_delay: Duration::from_millis(config.ingress_delay_ms),
                    tls: tls.clone(),
                    max_connections: NonZeroUsize::new(1024).expect("static limit"),
                },
                net_tx.clone(),
            )
            .map_err(NodeError::Accept)?;
            listeners.push(handle);
        }

        let events = Arc::new(PeerEvents::new());
        let (notices_tx, notices_rx) = unbounded::<RegistryNotice>();
        let registry = ConnectionRegistry::new(
            RegistryConfig {
                channels: channels.clone(),
                dial: DialOptions {
                    local: name.clone(),
                    connect_timeout: Duration::from_millis(limits.connect_timeout_ms),
                    egress_delay: Duration::from_millis(config.egress_delay_ms),
                    keepalive: Duration::from_millis(limits.keepalive_ms),
                    max_frame_bytes: limits.max_frame_bytes,
                    ref_format: config.remote_ref_format,
                    tls,
                },
                reconnect_base: Duration::from_millis(limits.reconnect_base_ms),
                reconnect_max: Duration::from_millis(limits.reconnect_max_ms),
            },
            Arc::clone(&events),
            notices_tx,
        );

        let dispatcher = Dispatcher::new(
            DispatcherConfig {
                local: spec.clone(),
                channels,
                limits: limits.clone(),
                binary_padding: config.binary_padding,
                ref_format: config.remote_ref_format,
                causal_labels: config.causal_labels.clone(),
            },
            registry.clone(),
        );

        let persist = config
            .data_dir
            .as_deref()
            .map(|dir| SnapshotStore::new(dir, limits.clone()));

        let manager = membership::start(
            ManagerConfig {
                local: spec.clone(),
                limits,
                broadcast: config.broadcast,
                ref_format: config.remote_ref_format,
                persist,
            },
            registry.clone(),
            Arc::clone(&events),
        );
        let manager_tx = manager.sender();

        let node = Node {
            inner: Arc::new(NodeInner {
                spec,
                registry,
                dispatcher,
                manager: Mutex::new(Some(manager)),
                manager_tx: manager_tx.clone(),
                listeners: Mutex::new(listeners),
                events,
                shutdown: AtomicBool::new(false),
            }),
        };

        let router = node.clone();
        thread::spawn(move || router.run_router(net_rx, notices_rx));

        tracing::info!(node = %node.inner.spec.name, "partisan node started");
        Ok(node)
    }

    pub fn spec(&self) -> &NodeSpec {
        &self.inner.spec
    }

    pub fn name(&self) -> &NodeName {
        &self.inner.spec.name
    }

    /// Contact `peer` and start the join protocol. Resolves once the hello
    /// handshake to the contact has succeeded.
    pub fn join(&self, peer: NodeSpec) -> Result<(), Error> {
        let manager = self.inner.manager.lock().expect("node lock poisoned");
        match manager.as_ref() {
            Some(manager) => manager.join(peer).map_err(Error::from),
            None => Err(NodeError::ShutDown.into()),
        }
    }

    /// Remove `peer` from the local views; leaving with our own name tears
    /// the node down and deletes persisted state.
    pub fn leave(&self, peer: &NodeName) {
        if peer == &self.inner.spec.name {
            let _ = self.inner.manager_tx.send(ManagerMsg::Leave(peer.clone()));
            self.shutdown();
            return;
        }
        let _ = self.inner.manager_tx.send(ManagerMsg::Leave(peer.clone()));
    }

    /// Best-effort local view of the active membership.
    pub fn members(&self) -> Vec<NodeSpec> {
        let manager = self.inner.manager.lock().expect("node lock poisoned");
        manager
            .as_ref()
            .map(ManagerHandle::members)
            .unwrap_or_default()
    }

    pub fn local_state(&self) -> (Vec<NodeSpec>, Vec<NodeSpec>) {
        let manager = self.inner.manager.lock().expect("node lock poisoned");
        manager
            .as_ref()
            .map(ManagerHandle::local_state)
            .unwrap_or_default()
    }

    pub fn send(
        &self,
        dest: &RemoteRef,
        payload: impl Into<Bytes>,
        opts: SendOptions,
    ) -> Result<Option<AckReceipt>, Error> {
        self.inner
            .dispatcher
            .send(dest, payload.into(), opts)
            .map_err(Error::from)
    }

    pub fn forward(
        &self,
        node: &NodeName,
        server_ref: &str,
        payload: impl Into<Bytes>,
        opts: SendOptions,
    ) -> Result<Option<AckReceipt>, Error> {
        self.inner
            .dispatcher
            .forward(node, server_ref, payload.into(), opts)
            .map_err(Error::from)
    }

    pub fn register_proc(&self, name: impl Into<String>, tx: Sender<Bytes>) {
        self.inner.dispatcher.register_proc(name, tx);
    }

    pub fn subscribe_data(&self) -> Receiver<(NodeName, ChannelId, Bytes)> {
        self.inner.dispatcher.subscribe_data()
    }

    pub fn subscribe_membership(&self) -> Receiver<Vec<NodeSpec>> {
        self.inner.events.subscribe()
    }

    pub fn on_up(&self, peer: NodeName, callback: PeerCallback) {
        self.inner.events.on_up(peer, callback);
    }

    pub fn on_down(&self, peer: NodeName, callback: PeerCallback) {
        self.inner.events.on_down(peer, callback);
    }

    pub fn add_interposition_fun(&self, peer: NodeName, tag: FilterTag, filter: FilterFn) {
        self.inner.dispatcher.interpose().add(peer, tag, filter);
    }

    pub fn remove_interposition_fun(&self, peer: &NodeName) {
        self.inner.dispatcher.interpose().remove(peer);
    }

    pub fn inject_partition(&self, peers: Vec<NodeName>) -> PartitionRef {
        self.inner.dispatcher.interpose().inject_partition(peers)
    }

    pub fn resolve_partition(&self, reference: PartitionRef) -> bool {
        self.inner
            .dispatcher
            .interpose()
            .resolve_partition(reference)
    }

    pub fn partitions(&self) -> Vec<(PartitionRef, Vec<NodeName>)> {
        self.inner.dispatcher.interpose().partitions()
    }

    pub fn set_causal_delivery(&self, label: &str, delivery: DeliveryFn) {
        self.inner.dispatcher.causal().set_delivery_fn(label, delivery);
    }

    /// Stop every task and close every socket. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(node = %self.inner.spec.name, "partisan node stopping");

        if let Some(manager) = self
            .inner
            .manager
            .lock()
            .expect("node lock poisoned")
            .take()
        {
            manager.shutdown();
        }

        let listeners = {
            let mut listeners = self.inner.listeners.lock().expect("node lock poisoned");
            std::mem::take(&mut *listeners)
        };
        for listener in listeners {
            listener.shutdown();
        }

        self.inner.registry.shutdown();
        self.inner.dispatcher.shutdown();
    }

    fn run_router(&self, net_rx: Receiver<NetEvent>, notices_rx: Receiver<RegistryNotice>) {
        let mut inbound_counts: std::collections::HashMap<NodeName, usize> =
            std::collections::HashMap::new();

        loop {
            if self.inner.shutdown.load(Ordering::Relaxed) {
                return;
            }

            crossbeam::select! {
                recv(net_rx) -> event => {
                    let event = match event {
                        Ok(event) => event,
                        Err(_) => return,
                    };
                    match event {
                        NetEvent::HelloAccepted { peer, channel } => {
                            tracing::debug!(
                                target: "net",
                                peer = %peer,
                                channel = %channel,
                                "hello accepted"
                            );
                            *inbound_counts.entry(peer).or_insert(0) += 1;
                        }
                        NetEvent::Frame { peer, message, .. } => {
                            if message.is_protocol() {
                                let _ = self
                                    .inner
                                    .manager_tx
                                    .send(ManagerMsg::Protocol(peer, message));
                            } else {
                                self.inner.dispatcher.receive(peer, message);
                            }
                        }
                        NetEvent::PeerClosed { peer, .. } => {
                            let count = inbound_counts.entry(peer.clone()).or_insert(1);
                            *count = count.saturating_sub(1);
                            if *count == 0 {
                                inbound_counts.remove(&peer);
                                let _ =
                                    self.inner.manager_tx.send(ManagerMsg::PeerDown(peer));
                            }
                        }
                    }
                }
                recv(notices_rx) -> notice => {
                    let notice = match notice {
                        Ok(notice) => notice,
                        Err(_) => return,
                    };
                    match notice {
                        RegistryNotice::PeerUp(spec) => {
                            let _ = self.inner.manager_tx.send(ManagerMsg::PeerUp(spec));
                        }
                        RegistryNotice::PeerDown(name) => {
                            let _ = self.inner.manager_tx.send(ManagerMsg::PeerDown(name));
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ListenAddr;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.listen_addrs = vec![ListenAddr::parse("127.0.0.1:0").unwrap()];
        config
    }

    #[test]
    fn start_binds_ephemeral_port_and_derives_name() {
        let node = Node::start(test_config()).unwrap();
        let spec = node.spec().clone();
        assert_ne!(spec.listen_addrs[0].port, 0);
        assert!(spec
            .name
            .as_str()
            .starts_with(&format!("partisan_{}", spec.listen_addrs[0].port)));
        assert!(node.members().is_empty());
        node.shutdown();
    }

    #[test]
    fn explicit_name_is_kept() {
        let mut config = test_config();
        config.name = Some("alpha@127.0.0.1".into());
        let node = Node::start(config).unwrap();
        assert_eq!(node.name().as_str(), "alpha@127.0.0.1");
        node.shutdown();
    }

    #[test]
    fn missing_listen_addr_is_rejected() {
        let config = Config::default();
        assert!(Node::start(config).is_err());
    }

    #[test]
    fn self_send_round_trips_without_peers() {
        let node = Node::start(test_config()).unwrap();
        let rx = node.subscribe_data();
        node.send(
            &RemoteRef::Node(node.name().clone()),
            Bytes::from_static(b"loopback"),
            SendOptions::default(),
        )
        .unwrap();
        let (_, _, payload) = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(&payload[..], b"loopback");
        node.shutdown();
    }

    #[test]
    fn shutdown_is_idempotent() {
        let node = Node::start(test_config()).unwrap();
        node.shutdown();
        node.shutdown();
        assert!(node.join(node.spec().clone()).is_err() || node.members().is_empty());
    }
}
