//! Message dispatch: the send/forward path and its receive mirror.
//!
//! Routing: resolve the destination, bypass the network for self, stamp
//! causal metadata, run the forward interposition filter, pick a socket by
//! channel/partition-key/monotonicity, and (for acked sends) register a
//! resend entry. The receive side mirrors the filter and causal steps before
//! delivering to a registered local process or the data subscribers.

pub mod causal;
pub mod interpose;

pub use causal::{CausalLayer, DeliveryFn};
pub use interpose::{FilterDecision, FilterFn, FilterTag, InterpositionTable, PartitionRef};

use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use thiserror::Error;

use crate::core::{
    ChannelId, ChannelOptions, Limits, NodeName, NodeSpec, RefFormat, RemoteRef, WallClock,
};
use crate::error::Transience;
use crate::metrics;
use crate::net::proto::{
    encode_envelope, Ack, Data, DataWithId, Envelope, Forward, Message, ProtoEncodeError,
};
use crate::net::registry::ConnectionRegistry;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("peer {peer} is not connected")]
    NotConnected { peer: NodeName },
    #[error("peer {peer} disconnected mid-send")]
    Disconnected { peer: NodeName },
    #[error("send to {peer} failed: {reason}")]
    SendFailed { peer: NodeName, reason: String },
    #[error("ack {id} timed out after {attempts} attempts")]
    AckTimeout { id: u64, attempts: u32 },
    #[error("payload encode: {0}")]
    Encode(#[from] ProtoEncodeError),
    #[error("payload compression: {0}")]
    Compression(#[from] std::io::Error),
}

impl DispatchError {
    pub fn transience(&self) -> Transience {
        match self {
            DispatchError::NotConnected { .. }
            | DispatchError::Disconnected { .. }
            | DispatchError::SendFailed { .. }
            | DispatchError::AckTimeout { .. } => Transience::Retryable,
            DispatchError::Encode(_) | DispatchError::Compression(_) => Transience::Permanent,
        }
    }
}

/// Per-send knobs. Defaults: `default` channel, no partition key, no ack, no
/// causal label.
#[derive(Clone, Debug, Default)]
pub struct SendOptions {
    pub channel: Option<ChannelId>,
    pub partition_key: Option<u64>,
    pub ack: bool,
    pub causal_label: Option<String>,
}

/// Outcome handle for an acked send; resolves when the ack arrives or the
/// retry budget is exhausted.
#[derive(Debug)]
pub struct AckReceipt {
    id: u64,
    peer: NodeName,
    rx: Receiver<Result<(), DispatchError>>,
}

impl AckReceipt {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn wait(&self, timeout: Duration) -> Result<(), DispatchError> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(crossbeam::channel::RecvTimeoutError::Timeout) => {
                Err(DispatchError::AckTimeout {
                    id: self.id,
                    attempts: 0,
                })
            }
            // The dispatcher went away with the send still pending.
            Err(crossbeam::channel::RecvTimeoutError::Disconnected) => {
                Err(DispatchError::SendFailed {
                    peer: self.peer.clone(),
                    reason: "dispatcher shut down".to_string(),
                })
            }
        }
    }
}

/// A message handed to the application: origin peer, channel, payload.
pub type Delivery = (NodeName, ChannelId, Bytes);

struct PendingAck {
    peer: NodeName,
    channel: ChannelId,
    partition_key: Option<u64>,
    bytes: Vec<u8>,
    attempts: u32,
    deadline_ms: u64,
    notify: Sender<Result<(), DispatchError>>,
}

enum DelayedOp {
    /// Re-run the send path with the substituted payload.
    Send {
        dest: RemoteRef,
        payload: Bytes,
        opts: SendOptions,
    },
    /// Deliver the substituted payload locally.
    Deliver {
        peer: NodeName,
        channel: ChannelId,
        target: Option<String>,
        payload: Bytes,
    },
}

struct Delayed {
    due_ms: u64,
    op: DelayedOp,
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    local: NodeSpec,
    registry: ConnectionRegistry,
    channels: BTreeMap<ChannelId, ChannelOptions>,
    interpose: InterpositionTable,
    causal: CausalLayer,
    limits: Limits,
    binary_padding: usize,
    ref_format: RefFormat,
    procs: Mutex<HashMap<String, Sender<Bytes>>>,
    data_subs: Mutex<Vec<Sender<Delivery>>>,
    acks: Mutex<HashMap<u64, PendingAck>>,
    delayed: Mutex<Vec<Delayed>>,
    shutdown: AtomicBool,
}

pub struct DispatcherConfig {
    pub local: NodeSpec,
    pub channels: BTreeMap<ChannelId, ChannelOptions>,
    pub limits: Limits,
    pub binary_padding: usize,
    pub ref_format: RefFormat,
    pub causal_labels: Vec<String>,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig, registry: ConnectionRegistry) -> Self {
        let causal = CausalLayer::new(config.local.name.clone(), config.causal_labels);
        let dispatcher = Self {
            inner: Arc::new(DispatcherInner {
                local: config.local,
                registry,
                channels: config.channels,
                interpose: InterpositionTable::new(),
                causal,
                limits: config.limits,
                binary_padding: config.binary_padding,
                ref_format: config.ref_format,
                procs: Mutex::new(HashMap::new()),
                data_subs: Mutex::new(Vec::new()),
                acks: Mutex::new(HashMap::new()),
                delayed: Mutex::new(Vec::new()),
                shutdown: AtomicBool::new(false),
            }),
        };

        let timer = dispatcher.clone();
        thread::spawn(move || timer.run_timer());

        dispatcher
    }

    pub fn interpose(&self) -> &InterpositionTable {
        &self.inner.interpose
    }

    pub fn causal(&self) -> &CausalLayer {
        &self.inner.causal
    }

    /// Bind a named local process; `forward` frames naming it land on the
    /// sender.
    pub fn register_proc(&self, name: impl Into<String>, tx: Sender<Bytes>) {
        self.lock_procs().insert(name.into(), tx);
    }

    pub fn unregister_proc(&self, name: &str) {
        self.lock_procs().remove(name);
    }

    /// Subscribe to plain data frames (no server ref).
    pub fn subscribe_data(&self) -> Receiver<Delivery> {
        let (tx, rx) = crossbeam::channel::unbounded();
        self.lock_subs().push(tx);
        rx
    }

    /// Send a payload to a destination. For acked sends the returned receipt
    /// resolves once the remote acknowledged (or the retry budget ran out).
    pub fn send(
        &self,
        dest: &RemoteRef,
        payload: Bytes,
        opts: SendOptions,
    ) -> Result<Option<AckReceipt>, DispatchError> {
        // Self-destined traffic bypasses the network entirely.
        if dest.node() == &self.inner.local.name {
            let channel = self.resolve_channel(&opts);
            self.deliver_local(
                self.inner.local.name.clone(),
                channel,
                dest.target().map(str::to_string),
                payload,
            );
            return Ok(None);
        }

        self.send_remote(dest, payload, opts)
    }

    /// `forward`: like send, but routes to a registered process on the
    /// receiving node.
    pub fn forward(
        &self,
        node: &NodeName,
        server_ref: &str,
        payload: Bytes,
        opts: SendOptions,
    ) -> Result<Option<AckReceipt>, DispatchError> {
        let dest = RemoteRef::Name {
            node: node.clone(),
            name: server_ref.to_string(),
        };
        self.send(&dest, payload, opts)
    }

    fn send_remote(
        &self,
        dest: &RemoteRef,
        payload: Bytes,
        opts: SendOptions,
    ) -> Result<Option<AckReceipt>, DispatchError> {
        let peer = dest.node().clone();

        let causal = opts
            .causal_label
            .as_deref()
            .map(|label| self.inner.causal.emit(label));

        let payload = match self
            .inner
            .interpose
            .evaluate(FilterTag::ForwardMessage, &peer, &payload)
        {
            FilterDecision::Pass => payload,
            FilterDecision::Drop => return Ok(None),
            FilterDecision::Substitute(substituted) => substituted,
            FilterDecision::Delay(delayed) => {
                self.push_delayed(DelayedOp::Send {
                    dest: dest.clone(),
                    payload: delayed,
                    opts: SendOptions {
                        // The substituted payload must not loop through the
                        // causal layer a second time.
                        causal_label: None,
                        ..opts
                    },
                });
                return Ok(None);
            }
        };

        let channel = self.resolve_channel(&opts);
        let channel_opts = self.channel_options(&channel);

        let (payload, compressed) = match channel_opts.compression {
            Some(level) => (Bytes::from(compress_payload(&payload, level)?), true),
            None => (payload, false),
        };

        let data = Data {
            channel: channel.clone(),
            payload,
            compressed,
            padding: self.inner.binary_padding as u32,
            causal,
        };

        // Only the plain data form carries an ack id on the wire; an acked
        // send naming a server ref degrades to fire-and-forget.
        let want_ack = opts.ack && dest.target().is_none();
        if opts.ack && !want_ack {
            tracing::warn!(
                target: "dispatch",
                peer = %peer,
                "ack requested for a forward send; sending without ack"
            );
        }

        let (message, receipt) = if want_ack {
            let id = rand::random();
            let (notify_tx, notify_rx) = bounded(1);
            (
                Message::DataWithId(DataWithId { id, data }),
                Some((
                    id,
                    notify_tx,
                    AckReceipt {
                        id,
                        peer: peer.clone(),
                        rx: notify_rx,
                    },
                )),
            )
        } else {
            match dest.target() {
                None => (Message::Data(data), None),
                Some(_) => (
                    Message::Forward(Forward {
                        channel: data.channel,
                        server_ref: dest.clone(),
                        payload: data.payload,
                        compressed: data.compressed,
                        padding: data.padding,
                        causal: data.causal,
                    }),
                    None,
                ),
            }
        };

        let bytes = encode_envelope(&Envelope::v1(message), self.inner.ref_format)?;
        self.write_frame(&peer, &channel, opts.partition_key, bytes.clone())?;

        match receipt {
            Some((id, notify, receipt)) => {
                let deadline_ms = WallClock::now().ms() + self.inner.limits.ack_timeout_ms;
                self.lock_acks().insert(
                    id,
                    PendingAck {
                        peer,
                        channel,
                        partition_key: opts.partition_key,
                        bytes,
                        attempts: 1,
                        deadline_ms,
                        notify,
                    },
                );
                Ok(Some(receipt))
            }
            None => Ok(None),
        }
    }

    /// Receive path for application frames; the node router calls this for
    /// everything `Message::is_protocol` does not claim.
    pub fn receive(&self, peer: NodeName, message: Message) {
        match message {
            Message::Ack(Ack { id }) => {
                if let Some(pending) = self.lock_acks().remove(&id) {
                    let _ = pending.notify.send(Ok(()));
                }
            }
            Message::Data(data) => self.receive_payload(peer, None, data, None),
            Message::DataWithId(DataWithId { id, data }) => {
                self.receive_payload(peer, None, data, Some(id))
            }
            Message::Forward(forward) => {
                let target = forward.server_ref.target().map(str::to_string);
                let data = Data {
                    channel: forward.channel,
                    payload: forward.payload,
                    compressed: forward.compressed,
                    padding: forward.padding,
                    causal: forward.causal,
                };
                self.receive_payload(peer, target, data, None)
            }
            Message::Pong(_) | Message::Ping(_) => {}
            other => {
                tracing::warn!(
                    target: "dispatch",
                    peer = %peer,
                    "protocol message reached the dispatcher: {other:?}"
                );
            }
        }
    }

    fn receive_payload(
        &self,
        peer: NodeName,
        target: Option<String>,
        data: Data,
        ack_id: Option<u64>,
    ) {
        // Acks go out even for frames a filter later drops; the sender's
        // retry budget measures transport, not interposition.
        if let Some(id) = ack_id {
            self.send_ack(&peer, &data.channel, id);
        }

        let payload = match self
            .inner
            .interpose
            .evaluate(FilterTag::ReceiveMessage, &peer, &data.payload)
        {
            FilterDecision::Pass => data.payload,
            FilterDecision::Drop => return,
            FilterDecision::Substitute(substituted) => substituted,
            FilterDecision::Delay(delayed) => {
                self.push_delayed(DelayedOp::Deliver {
                    peer,
                    channel: data.channel,
                    target,
                    payload: delayed,
                });
                return;
            }
        };

        let payload = if data.compressed {
            match decompress_payload(&payload) {
                Ok(decompressed) => Bytes::from(decompressed),
                Err(err) => {
                    tracing::warn!(target: "dispatch", peer = %peer, "decompress failed: {err}");
                    return;
                }
            }
        } else {
            payload
        };

        if let Some(meta) = data.causal {
            for (target, payload) in self.inner.causal.receive(meta, target.clone(), payload) {
                self.deliver_local(peer.clone(), data.channel.clone(), target, payload);
            }
            return;
        }

        self.deliver_local(peer, data.channel, target, payload);
    }

    fn deliver_local(
        &self,
        from: NodeName,
        channel: ChannelId,
        target: Option<String>,
        payload: Bytes,
    ) {
        match target {
            Some(name) => {
                let procs = self.lock_procs();
                match procs.get(&name) {
                    Some(tx) => {
                        let _ = tx.send(payload);
                    }
                    None => {
                        tracing::warn!(
                            target: "dispatch",
                            target = %name,
                            "no process registered for forward target"
                        );
                    }
                }
            }
            None => {
                let mut subs = self.lock_subs();
                subs.retain(|tx| {
                    match tx.try_send((from.clone(), channel.clone(), payload.clone())) {
                        Ok(()) => true,
                        Err(TrySendError::Full(_)) => true,
                        Err(TrySendError::Disconnected(_)) => false,
                    }
                });
            }
        }
    }

    fn send_ack(&self, peer: &NodeName, channel: &ChannelId, id: u64) {
        let envelope = Envelope::v1(Message::Ack(Ack { id }));
        let bytes = match encode_envelope(&envelope, self.inner.ref_format) {
            Ok(bytes) => bytes,
            Err(_) => return,
        };
        if let Err(err) = self.write_frame(peer, channel, None, bytes) {
            tracing::debug!(target: "dispatch", peer = %peer, "ack send failed: {err}");
        }
    }

    fn write_frame(
        &self,
        peer: &NodeName,
        channel: &ChannelId,
        partition_key: Option<u64>,
        bytes: Vec<u8>,
    ) -> Result<(), DispatchError> {
        let handle = self
            .inner
            .registry
            .pick(peer, channel, partition_key)
            .map_err(|_| DispatchError::NotConnected { peer: peer.clone() })?;
        handle
            .send_frame(bytes)
            .map_err(|_| DispatchError::Disconnected { peer: peer.clone() })
    }

    fn resolve_channel(&self, opts: &SendOptions) -> ChannelId {
        opts.channel.clone().unwrap_or_else(ChannelId::default_channel)
    }

    fn channel_options(&self, channel: &ChannelId) -> ChannelOptions {
        self.inner
            .channels
            .get(channel)
            .copied()
            .unwrap_or_default()
    }

    fn push_delayed(&self, op: DelayedOp) {
        let due_ms = WallClock::now().ms() + self.inner.limits.delay_retry_ms;
        self.lock_delayed().push(Delayed { due_ms, op });
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Relaxed);
    }

    fn run_timer(&self) {
        loop {
            if self.inner.shutdown.load(Ordering::Relaxed) {
                return;
            }
            thread::sleep(Duration::from_millis(50));
            let now = WallClock::now().ms();
            self.flush_delayed(now);
            self.retry_acks(now);
        }
    }

    fn flush_delayed(&self, now: u64) {
        let due: Vec<Delayed> = {
            let mut delayed = self.lock_delayed();
            let (ready, waiting): (Vec<Delayed>, Vec<Delayed>) = delayed
                .drain(..)
                .partition(|entry| entry.due_ms <= now);
            *delayed = waiting;
            ready
        };

        for entry in due {
            match entry.op {
                DelayedOp::Send {
                    dest,
                    payload,
                    opts,
                } => {
                    if let Err(err) = self.send(&dest, payload, opts) {
                        tracing::debug!(target: "dispatch", "delayed send failed: {err}");
                    }
                }
                DelayedOp::Deliver {
                    peer,
                    channel,
                    target,
                    payload,
                } => self.deliver_local(peer, channel, target, payload),
            }
        }
    }

    fn retry_acks(&self, now: u64) {
        let mut expired = Vec::new();
        {
            let mut acks = self.lock_acks();
            let ids: Vec<u64> = acks
                .iter()
                .filter(|(_, pending)| pending.deadline_ms <= now)
                .map(|(id, _)| *id)
                .collect();
            for id in ids {
                let attempts = match acks.get(&id) {
                    Some(pending) => pending.attempts,
                    None => continue,
                };
                if attempts >= self.inner.limits.ack_retry_limit {
                    if let Some(pending) = acks.remove(&id) {
                        metrics::ack_timed_out();
                        let _ = pending
                            .notify
                            .send(Err(DispatchError::AckTimeout { id, attempts }));
                    }
                    continue;
                }
                if let Some(pending) = acks.get_mut(&id) {
                    pending.attempts += 1;
                    pending.deadline_ms = now + self.inner.limits.ack_timeout_ms;
                    expired.push((
                        id,
                        pending.peer.clone(),
                        pending.channel.clone(),
                        pending.partition_key,
                        pending.bytes.clone(),
                    ));
                }
            }
        }

        for (id, peer, channel, partition_key, bytes) in expired {
            tracing::debug!(target: "dispatch", id, peer = %peer, "resending unacked frame");
            if let Err(err) = self.write_frame(&peer, &channel, partition_key, bytes) {
                // The peer may be reconnecting; the next deadline retries.
                tracing::debug!(target: "dispatch", id, "resend failed: {err}");
            }
        }
    }

    fn lock_procs(&self) -> std::sync::MutexGuard<'_, HashMap<String, Sender<Bytes>>> {
        self.inner.procs.lock().expect("dispatcher lock poisoned")
    }

    fn lock_subs(&self) -> std::sync::MutexGuard<'_, Vec<Sender<Delivery>>> {
        self.inner
            .data_subs
            .lock()
            .expect("dispatcher lock poisoned")
    }

    fn lock_acks(&self) -> std::sync::MutexGuard<'_, HashMap<u64, PendingAck>> {
        self.inner.acks.lock().expect("dispatcher lock poisoned")
    }

    fn lock_delayed(&self) -> std::sync::MutexGuard<'_, Vec<Delayed>> {
        self.inner.delayed.lock().expect("dispatcher lock poisoned")
    }
}

fn compress_payload(payload: &[u8], level: u32) -> std::io::Result<Vec<u8>> {
    let mut encoder =
        flate2::read::ZlibEncoder::new(payload, flate2::Compression::new(level.min(9)));
    let mut out = Vec::new();
    encoder.read_to_end(&mut out)?;
    Ok(out)
}

fn decompress_payload(payload: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = flate2::read::ZlibDecoder::new(payload);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}
