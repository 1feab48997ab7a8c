//! Connection registry: the (peer, channel, slot) socket pool.
//!
//! The registry owns every outbound connection. Each known peer gets a
//! connector task that keeps the full (channel x slot) matrix dialed,
//! retrying with bounded exponential backoff, and reports edge-triggered
//! up/down transitions. Readers (the dispatcher) only ever take handles out
//! of a locked snapshot; all mutation happens here.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use thiserror::Error;

use crate::core::{ChannelId, ChannelOptions, NodeName, NodeSpec, Slot};
use crate::events::PeerEvents;
use crate::metrics;
use crate::net::client::{dial, ConnKey, ConnectError, Connection, ConnectionHandle, DialOptions};

/// Connection-level transitions the node router forwards to the membership
/// manager.
#[derive(Debug)]
pub enum RegistryNotice {
    PeerUp(NodeSpec),
    PeerDown(NodeName),
}

#[derive(Debug, Error)]
pub enum PickError {
    #[error("peer {peer} is not connected")]
    NotConnected { peer: NodeName },
}

#[derive(Clone)]
pub struct RegistryConfig {
    pub channels: BTreeMap<ChannelId, ChannelOptions>,
    pub dial: DialOptions,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
}

#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    config: RegistryConfig,
    state: Mutex<RegistryState>,
    events: Arc<PeerEvents>,
    notices: Sender<RegistryNotice>,
    failure_tx: Sender<ConnKey>,
    shutdown: AtomicBool,
}

#[derive(Default)]
struct RegistryState {
    peers: BTreeMap<NodeName, PeerEntry>,
}

struct PeerEntry {
    spec: NodeSpec,
    conns: BTreeMap<(ChannelId, Slot), Connection>,
    round_robin: BTreeMap<ChannelId, usize>,
    connected: bool,
    wake: Sender<()>,
}

impl ConnectionRegistry {
    pub fn new(
        config: RegistryConfig,
        events: Arc<PeerEvents>,
        notices: Sender<RegistryNotice>,
    ) -> Self {
        let (failure_tx, failure_rx) = unbounded();
        let registry = Self {
            inner: Arc::new(RegistryInner {
                config,
                state: Mutex::new(RegistryState::default()),
                events,
                notices,
                failure_tx,
                shutdown: AtomicBool::new(false),
            }),
        };

        let monitor = registry.clone();
        thread::spawn(move || monitor.run_failure_monitor(failure_rx));

        registry
    }

    /// Make `spec` a known peer and keep its connection matrix dialed.
    /// Idempotent; a fresher spec replaces the stored metadata.
    pub fn insert_peer(&self, spec: NodeSpec) {
        if spec.name == self.inner.config.dial.local {
            return;
        }
        let mut state = self.lock_state();
        if let Some(entry) = state.peers.get_mut(&spec.name) {
            entry.spec = spec;
            let _ = entry.wake.send(());
            return;
        }

        let (wake_tx, wake_rx) = unbounded();
        state.peers.insert(
            spec.name.clone(),
            PeerEntry {
                spec: spec.clone(),
                conns: BTreeMap::new(),
                round_robin: BTreeMap::new(),
                connected: false,
                wake: wake_tx,
            },
        );
        drop(state);

        let registry = self.clone();
        let name = spec.name.clone();
        thread::spawn(move || registry.run_peer_connector(name, wake_rx));
    }

    /// Idempotently open the socket for one (peer, channel, slot) triple,
    /// dialing synchronously if it is missing.
    pub fn ensure(
        &self,
        peer: &NodeName,
        channel: &ChannelId,
        slot: Slot,
    ) -> Result<(), ConnectError> {
        let (spec, exists) = {
            let state = self.lock_state();
            match state.peers.get(peer) {
                Some(entry) => (
                    entry.spec.clone(),
                    entry.conns.contains_key(&(channel.clone(), slot)),
                ),
                None => {
                    return Err(ConnectError::NoAddress { peer: peer.clone() });
                }
            }
        };
        if exists {
            return Ok(());
        }

        let conn = self.dial_slot(&spec, channel.clone(), slot)?;
        let mut state = self.lock_state();
        match state.peers.get_mut(peer) {
            Some(entry) => {
                entry.conns.insert((channel.clone(), slot), conn);
                let _ = entry.wake.send(());
                Ok(())
            }
            None => {
                // Peer was removed while we were dialing.
                conn.shutdown();
                Err(ConnectError::NoAddress { peer: peer.clone() })
            }
        }
    }

    /// Insert `spec` and synchronously establish the membership socket so a
    /// protocol message can be sent immediately after return.
    pub fn ensure_peer_sync(&self, spec: NodeSpec) -> Result<(), ConnectError> {
        self.insert_peer(spec.clone());
        self.ensure(&spec.name, &ChannelId::membership(), 0)
    }

    /// Select a connection: monotonic channels pin slot 0, a partition key
    /// hashes to a stable slot, everything else round-robins.
    pub fn pick(
        &self,
        peer: &NodeName,
        channel: &ChannelId,
        partition_key: Option<u64>,
    ) -> Result<ConnectionHandle, PickError> {
        let opts = self.channel_options(channel);
        let parallelism = opts.effective_parallelism().max(1);

        let mut state = self.lock_state();
        let entry = state.peers.get_mut(peer).ok_or_else(|| PickError::NotConnected {
            peer: peer.clone(),
        })?;

        let slot: Slot = if opts.monotonic {
            0
        } else if let Some(key) = partition_key {
            (key % parallelism as u64) as Slot
        } else {
            let counter = entry.round_robin.entry(channel.clone()).or_insert(0);
            *counter = counter.wrapping_add(1);
            (*counter % parallelism as usize) as Slot
        };

        // Fall back to any open slot on the channel when the preferred one is
        // still reconnecting, unless ordering pins us to slot 0.
        let preferred = entry
            .conns
            .get(&(channel.clone(), slot))
            .filter(|conn| !conn.is_closed());
        let conn = match preferred {
            Some(conn) => Some(conn),
            None if !opts.monotonic && partition_key.is_none() => entry
                .conns
                .iter()
                .filter(|((ch, _), conn)| ch == channel && !conn.is_closed())
                .map(|(_, conn)| conn)
                .next(),
            None => None,
        };

        conn.map(Connection::handle).ok_or_else(|| PickError::NotConnected {
            peer: peer.clone(),
        })
    }

    /// Close all sockets to `peer` and forget it.
    pub fn close_peer(&self, peer: &NodeName) {
        let removed = {
            let mut state = self.lock_state();
            state.peers.remove(peer)
        };
        if let Some(entry) = removed {
            let was_connected = entry.connected;
            for (_, conn) in entry.conns {
                conn.shutdown();
            }
            if was_connected {
                self.transition_down(peer);
            }
        }
    }

    pub fn dial_options(&self) -> DialOptions {
        self.inner.config.dial.clone()
    }

    pub fn is_connected(&self, peer: &NodeName) -> bool {
        self.lock_state()
            .peers
            .get(peer)
            .map(|entry| entry.connected)
            .unwrap_or(false)
    }

    pub fn peer_spec(&self, peer: &NodeName) -> Option<NodeSpec> {
        self.lock_state().peers.get(peer).map(|e| e.spec.clone())
    }

    pub fn connected_peers(&self) -> Vec<NodeName> {
        self.lock_state()
            .peers
            .iter()
            .filter(|(_, entry)| entry.connected)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Open socket count for one (peer, channel) pair.
    pub fn conn_count(&self, peer: &NodeName, channel: &ChannelId) -> usize {
        self.lock_state()
            .peers
            .get(peer)
            .map(|entry| {
                entry
                    .conns
                    .iter()
                    .filter(|((ch, _), conn)| ch == channel && !conn.is_closed())
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Relaxed);
        let mut state = self.lock_state();
        let peers = std::mem::take(&mut state.peers);
        drop(state);
        for (_, entry) in peers {
            let _ = entry.wake.send(());
            for (_, conn) in entry.conns {
                conn.shutdown();
            }
        }
    }

    fn channel_options(&self, channel: &ChannelId) -> ChannelOptions {
        self.inner
            .config
            .channels
            .get(channel)
            .copied()
            .unwrap_or_default()
    }

    fn required_slots(&self) -> Vec<(ChannelId, Slot)> {
        let mut slots = Vec::new();
        for (channel, opts) in &self.inner.config.channels {
            for slot in 0..opts.effective_parallelism().max(1) {
                slots.push((channel.clone(), slot));
            }
        }
        slots
    }

    fn dial_slot(
        &self,
        spec: &NodeSpec,
        channel: ChannelId,
        slot: Slot,
    ) -> Result<Connection, ConnectError> {
        let addr = spec.primary_addr().ok_or_else(|| ConnectError::NoAddress {
            peer: spec.name.clone(),
        })?;
        let key = ConnKey {
            peer: spec.name.clone(),
            channel,
            slot,
        };
        dial(addr, key, &self.inner.config.dial, self.inner.failure_tx.clone())
    }

    fn run_peer_connector(&self, peer: NodeName, wake_rx: Receiver<()>) {
        let mut backoff = Backoff::new(
            self.inner.config.reconnect_base,
            self.inner.config.reconnect_max,
        );
        // A peer that never completed a single handshake is given up after a
        // bounded number of attempts; established peers are retried until
        // the membership manager removes them.
        const GIVE_UP_ATTEMPTS: u32 = 8;
        let mut ever_connected = false;
        let mut consecutive_failures = 0u32;

        loop {
            if self.inner.shutdown.load(Ordering::Relaxed) {
                return;
            }

            let (spec, missing, slot0_missing) = {
                let mut state = self.lock_state();
                let entry = match state.peers.get_mut(&peer) {
                    Some(entry) => entry,
                    None => return,
                };
                entry.conns.retain(|_, conn| !conn.is_closed());

                let mut missing = Vec::new();
                for pair in self.required_slots() {
                    if !entry.conns.contains_key(&pair) {
                        missing.push(pair);
                    }
                }
                let slot0_missing = missing.iter().any(|(_, slot)| *slot == 0);
                (entry.spec.clone(), missing, slot0_missing)
            };

            // Connected means a live slot-0 socket on every configured
            // channel; higher slots may still be filling in.
            if slot0_missing {
                self.mark_disconnected(&peer);
            } else {
                ever_connected = true;
                self.mark_connected(&peer, &spec);
            }

            if missing.is_empty() {
                backoff.reset();
                consecutive_failures = 0;
                match wake_rx.recv_timeout(Duration::from_millis(500)) {
                    Ok(()) | Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            }

            let mut failed = false;
            for (channel, slot) in missing {
                if self.inner.shutdown.load(Ordering::Relaxed) {
                    return;
                }
                metrics::reconnect_attempt(peer.as_str());
                match self.dial_slot(&spec, channel.clone(), slot) {
                    Ok(conn) => {
                        let mut state = self.lock_state();
                        match state.peers.get_mut(&peer) {
                            Some(entry) => {
                                entry.conns.insert((channel, slot), conn);
                            }
                            None => {
                                conn.shutdown();
                                return;
                            }
                        }
                    }
                    Err(err) => {
                        tracing::debug!(
                            target: "net",
                            peer = %peer,
                            channel = %channel,
                            slot,
                            "dial failed: {err}"
                        );
                        failed = true;
                        break;
                    }
                }
            }

            if failed {
                consecutive_failures += 1;
                if !ever_connected && consecutive_failures >= GIVE_UP_ATTEMPTS {
                    tracing::debug!(
                        target: "net",
                        peer = %peer,
                        attempts = consecutive_failures,
                        "giving up on unreachable peer"
                    );
                    let removed = self.lock_state().peers.remove(&peer);
                    if let Some(entry) = removed {
                        for (_, conn) in entry.conns {
                            conn.shutdown();
                        }
                    }
                    let _ = self
                        .inner
                        .notices
                        .send(RegistryNotice::PeerDown(peer.clone()));
                    return;
                }
                let delay = backoff.next_delay();
                match wake_rx.recv_timeout(delay) {
                    Ok(()) => {}
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            } else {
                consecutive_failures = 0;
            }
        }
    }

    fn run_failure_monitor(&self, failure_rx: Receiver<ConnKey>) {
        while let Ok(key) = failure_rx.recv() {
            if self.inner.shutdown.load(Ordering::Relaxed) {
                return;
            }
            let mut state = self.lock_state();
            if let Some(entry) = state.peers.get_mut(&key.peer) {
                entry
                    .conns
                    .retain(|(channel, slot), conn| {
                        !(channel == &key.channel && *slot == key.slot && conn.is_closed())
                    });
                let _ = entry.wake.send(());
            }
        }
    }

    fn mark_connected(&self, peer: &NodeName, spec: &NodeSpec) {
        let newly_connected = {
            let mut state = self.lock_state();
            match state.peers.get_mut(peer) {
                Some(entry) if !entry.connected => {
                    entry.connected = true;
                    true
                }
                _ => false,
            }
        };
        if newly_connected {
            tracing::info!(target: "net", peer = %peer, "peer fully connected");
            metrics::peer_up();
            self.inner.events.fire_up(peer);
            let _ = self.inner.notices.send(RegistryNotice::PeerUp(spec.clone()));
        }
    }

    fn mark_disconnected(&self, peer: &NodeName) {
        let newly_down = {
            let mut state = self.lock_state();
            match state.peers.get_mut(peer) {
                Some(entry) if entry.connected => {
                    entry.connected = false;
                    true
                }
                _ => false,
            }
        };
        if newly_down {
            self.transition_down(peer);
        }
    }

    fn transition_down(&self, peer: &NodeName) {
        tracing::info!(target: "net", peer = %peer, "peer disconnected");
        metrics::peer_down();
        self.inner.events.fire_down(peer);
        let _ = self
            .inner
            .notices
            .send(RegistryNotice::PeerDown(peer.clone()));
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.inner.state.lock().expect("registry lock poisoned")
    }
}

struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            current: base,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let next = self.current.checked_mul(2).unwrap_or(self.max);
        self.current = std::cmp::min(next, self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.base;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::num::NonZeroUsize;

    use crate::core::{Limits, ListenAddr, RefFormat};
    use crate::net::server::{self, ListenerConfig, NetEvent};

    fn node_name(raw: &str) -> NodeName {
        NodeName::parse(raw).unwrap()
    }

    fn channels() -> BTreeMap<ChannelId, ChannelOptions> {
        let mut channels = BTreeMap::new();
        channels.insert(ChannelId::default_channel(), ChannelOptions::default());
        channels.insert(ChannelId::membership(), ChannelOptions::default());
        channels
    }

    fn registry_with(
        channels: BTreeMap<ChannelId, ChannelOptions>,
    ) -> (
        ConnectionRegistry,
        Receiver<RegistryNotice>,
        Arc<PeerEvents>,
    ) {
        let events = Arc::new(PeerEvents::new());
        let (notices_tx, notices_rx) = unbounded();
        let config = RegistryConfig {
            channels,
            dial: DialOptions {
                local: node_name("me@h"),
                connect_timeout: Duration::from_millis(1_000),
                egress_delay: Duration::ZERO,
                keepalive: Duration::from_secs(30),
                max_frame_bytes: Limits::default().max_frame_bytes,
                ref_format: RefFormat::ImproperList,
                tls: None,
            },
            reconnect_base: Duration::from_millis(20),
            reconnect_max: Duration::from_millis(100),
        };
        let registry = ConnectionRegistry::new(config, Arc::clone(&events), notices_tx);
        (registry, notices_rx, events)
    }

    /// A listener that speaks just enough of the accept side to count
    /// inbound sockets.
    fn spawn_listener(local: &str) -> (std::net::SocketAddr, Receiver<NetEvent>) {
        let (events_tx, events_rx) = crossbeam::channel::unbounded();
        let handle = server::start(
            "127.0.0.1:0".parse().unwrap(),
            ListenerConfig {
                local: node_name(local),
                limits: Limits::default(),
                ingress_delay: Duration::ZERO,
                tls: None,
                max_connections: NonZeroUsize::new(64).unwrap(),
            },
            events_tx,
        )
        .unwrap();
        let addr = handle.local_addr();
        // Leak the handle; the test process ends soon enough.
        std::mem::forget(handle);
        (addr, events_rx)
    }

    fn spec_for(name: &str, addr: std::net::SocketAddr) -> NodeSpec {
        NodeSpec {
            name: node_name(name),
            listen_addrs: vec![ListenAddr::from(addr)],
            channels: vec![ChannelId::default_channel(), ChannelId::membership()],
        }
    }

    #[test]
    fn insert_peer_dials_full_matrix_and_reports_up() {
        let (addr, listener_events) = spawn_listener("peer@h");
        let mut chans = channels();
        chans.insert(
            ChannelId::parse("vnode").unwrap(),
            ChannelOptions {
                monotonic: false,
                parallelism: 3,
                compression: None,
            },
        );
        let (registry, notices, _) = registry_with(chans);

        registry.insert_peer(spec_for("peer@h", addr));

        match notices.recv_timeout(Duration::from_secs(5)).unwrap() {
            RegistryNotice::PeerUp(spec) => assert_eq!(spec.name.as_str(), "peer@h"),
            other => panic!("expected up, got {other:?}"),
        }
        assert!(registry.is_connected(&node_name("peer@h")));
        assert_eq!(
            registry.conn_count(&node_name("peer@h"), &ChannelId::parse("vnode").unwrap()),
            3
        );

        // The listener saw one hello per (channel, slot).
        let mut hellos = 0;
        while let Ok(event) = listener_events.recv_timeout(Duration::from_millis(500)) {
            if matches!(event, NetEvent::HelloAccepted { .. }) {
                hellos += 1;
            }
            if hellos == 5 {
                break;
            }
        }
        assert_eq!(hellos, 5);

        registry.shutdown();
    }

    #[test]
    fn pick_respects_monotonic_and_partition_key() {
        let (addr, _listener_events) = spawn_listener("peer@h");
        let mut chans = channels();
        chans.insert(
            ChannelId::parse("vnode").unwrap(),
            ChannelOptions {
                monotonic: true,
                parallelism: 4,
                compression: None,
            },
        );
        chans.insert(
            ChannelId::parse("rpc").unwrap(),
            ChannelOptions {
                monotonic: false,
                parallelism: 4,
                compression: None,
            },
        );
        let (registry, notices, _) = registry_with(chans);
        registry.insert_peer(spec_for("peer@h", addr));
        notices.recv_timeout(Duration::from_secs(5)).unwrap();

        let peer = node_name("peer@h");
        let vnode = ChannelId::parse("vnode").unwrap();
        let rpc = ChannelId::parse("rpc").unwrap();

        // Monotonic: always slot 0.
        for _ in 0..8 {
            let handle = registry.pick(&peer, &vnode, None).unwrap();
            assert_eq!(handle.key().slot, 0);
        }

        // Partition key: stable slot, key mod parallelism.
        for key in [0u64, 1, 2, 3, 7, 13] {
            let handle = registry.pick(&peer, &rpc, Some(key)).unwrap();
            assert_eq!(handle.key().slot, (key % 4) as Slot);
        }

        // Round robin: more than one distinct slot over several picks.
        let mut seen = std::collections::BTreeSet::new();
        for _ in 0..16 {
            seen.insert(registry.pick(&peer, &rpc, None).unwrap().key().slot);
        }
        assert!(seen.len() > 1);

        registry.shutdown();
    }

    #[test]
    fn pick_unknown_peer_is_not_connected() {
        let (registry, _notices, _) = registry_with(channels());
        let err = registry
            .pick(&node_name("ghost@h"), &ChannelId::default_channel(), None)
            .unwrap_err();
        assert!(matches!(err, PickError::NotConnected { .. }));
        registry.shutdown();
    }

    #[test]
    fn close_peer_reports_down_once() {
        let (addr, _listener_events) = spawn_listener("peer@h");
        let (registry, notices, _) = registry_with(channels());
        registry.insert_peer(spec_for("peer@h", addr));
        notices.recv_timeout(Duration::from_secs(5)).unwrap();

        registry.close_peer(&node_name("peer@h"));
        match notices.recv_timeout(Duration::from_secs(2)).unwrap() {
            RegistryNotice::PeerDown(name) => assert_eq!(name.as_str(), "peer@h"),
            other => panic!("expected down, got {other:?}"),
        }
        assert!(!registry.is_connected(&node_name("peer@h")));
        // Idempotent: closing again emits nothing.
        registry.close_peer(&node_name("peer@h"));
        assert!(notices.recv_timeout(Duration::from_millis(300)).is_err());

        registry.shutdown();
    }

    #[test]
    fn unreachable_peer_is_given_up_after_bounded_attempts() {
        // Bind then drop, so the port is very likely closed.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let (registry, notices, _) = registry_with(channels());
        registry.insert_peer(spec_for("gone@h", addr));

        assert!(!registry.is_connected(&node_name("gone@h")));
        match notices.recv_timeout(Duration::from_secs(10)).unwrap() {
            RegistryNotice::PeerDown(name) => assert_eq!(name.as_str(), "gone@h"),
            other => panic!("expected down, got {other:?}"),
        }
        assert!(registry.peer_spec(&node_name("gone@h")).is_none());

        registry.shutdown();
    }
}
