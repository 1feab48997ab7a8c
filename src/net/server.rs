//! Inbound peer listener: accept loop and per-socket readers.
//!
//! Every accepted socket must present a hello frame within the handshake
//! window naming the remote node and the channel the socket carries. A
//! missing, malformed or mismatched hello closes the socket. Accepted
//! sockets are read-only; decoded frames flow to the node's router.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::Sender;
use thiserror::Error;

use crate::core::{ChannelId, Limits, NodeName};
use crate::metrics;
use crate::net::frame::FrameReader;
use crate::net::proto::{decode_envelope, Message};
use crate::net::tls::{PeerStream, TlsContext};

/// What a listener tells the node about its sockets.
#[derive(Debug)]
pub enum NetEvent {
    HelloAccepted {
        peer: NodeName,
        channel: ChannelId,
    },
    Frame {
        peer: NodeName,
        channel: ChannelId,
        message: Message,
    },
    PeerClosed {
        peer: NodeName,
        channel: ChannelId,
    },
}

#[derive(Debug, Error)]
pub enum AcceptError {
    #[error("listener io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone)]
pub struct ListenerConfig {
    pub local: NodeName,
    pub limits: Limits,
    pub ingress_delay: Duration,
    pub tls: Option<TlsContext>,
    pub max_connections: NonZeroUsize,
}

pub struct ListenerHandle {
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl ListenerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Bind `addr` and run the accept loop on its own task.
pub fn start(
    addr: SocketAddr,
    config: ListenerConfig,
    events: Sender<NetEvent>,
) -> Result<ListenerHandle, AcceptError> {
    let listener = TcpListener::bind(addr)?;
    start_with(listener, config, events)
}

/// Run the accept loop over an already-bound listener. Useful when the bound
/// port has to be known before the rest of the node comes up.
pub fn start_with(
    listener: TcpListener,
    config: ListenerConfig,
    events: Sender<NetEvent>,
) -> Result<ListenerHandle, AcceptError> {
    let local_addr = listener.local_addr()?;
    listener.set_nonblocking(true)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let runtime = ListenerRuntime {
        config,
        events,
        shutdown: Arc::clone(&shutdown),
        active_connections: Arc::new(AtomicUsize::new(0)),
    };

    let join = thread::spawn(move || run_accept_loop(listener, runtime));

    Ok(ListenerHandle {
        shutdown,
        join: Some(join),
        local_addr,
    })
}

#[derive(Clone)]
struct ListenerRuntime {
    config: ListenerConfig,
    events: Sender<NetEvent>,
    shutdown: Arc<AtomicBool>,
    active_connections: Arc<AtomicUsize>,
}

struct ConnectionGuard {
    active: Arc<AtomicUsize>,
}

impl ConnectionGuard {
    fn try_acquire(active: &Arc<AtomicUsize>, max: NonZeroUsize) -> Option<Self> {
        let mut current = active.load(Ordering::Acquire);
        loop {
            if current >= max.get() {
                return None;
            }
            match active.compare_exchange(
                current,
                current.saturating_add(1),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(Self {
                        active: Arc::clone(active),
                    });
                }
                Err(next) => current = next,
            }
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let prev = self.active.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "active connection counter underflow");
    }
}

fn run_accept_loop(listener: TcpListener, runtime: ListenerRuntime) {
    loop {
        if runtime.shutdown.load(Ordering::Relaxed) {
            break;
        }

        match listener.accept() {
            Ok((stream, remote)) => {
                if let Some(guard) = ConnectionGuard::try_acquire(
                    &runtime.active_connections,
                    runtime.config.max_connections,
                ) {
                    let runtime = runtime.clone();
                    thread::spawn(move || run_inbound_socket(stream, remote, runtime, guard));
                } else {
                    tracing::warn!(target: "net", %remote, "connection limit reached, refusing");
                    drop(stream);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(25));
            }
            Err(err) => {
                tracing::warn!(target: "net", "accept error: {err}");
                thread::sleep(Duration::from_millis(25));
            }
        }
    }
}

fn run_inbound_socket(
    stream: TcpStream,
    remote: SocketAddr,
    runtime: ListenerRuntime,
    _guard: ConnectionGuard,
) {
    if stream.set_nodelay(true).is_err() {
        return;
    }

    let stream = match &runtime.config.tls {
        Some(tls) => match tls.wrap_server(stream) {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!(target: "net", %remote, "tls accept failed: {err}");
                return;
            }
        },
        None => PeerStream::Plain(stream),
    };

    let limits = runtime.config.limits.clone();
    if stream
        .set_read_timeout(Some(Duration::from_millis(limits.hello_timeout_ms)))
        .is_err()
    {
        return;
    }

    let mut reader = FrameReader::new(stream, limits.max_frame_bytes);

    let (peer, channel) = match read_hello(&mut reader, &runtime.config.local, &limits) {
        Ok(hello) => hello,
        Err(reason) => {
            tracing::warn!(target: "net", %remote, "rejecting inbound socket: {reason}");
            return;
        }
    };

    // The handshake window is over; the socket may now idle between frames.
    if reader.get_ref().set_read_timeout(None).is_err() {
        return;
    }

    tracing::debug!(
        target: "net",
        peer = %peer,
        channel = %channel,
        %remote,
        "inbound connection accepted"
    );
    if runtime
        .events
        .send(NetEvent::HelloAccepted {
            peer: peer.clone(),
            channel: channel.clone(),
        })
        .is_err()
    {
        return;
    }

    loop {
        if runtime.shutdown.load(Ordering::Relaxed) {
            break;
        }

        match reader.read_next() {
            Ok(Some(bytes)) => {
                let envelope = match decode_envelope(&bytes, &limits) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        tracing::warn!(
                            target: "net",
                            peer = %peer,
                            "bad frame, closing socket: {err}"
                        );
                        break;
                    }
                };
                metrics::frame_received(channel.as_str(), bytes.len());

                if let Message::Ping(_) = envelope.message {
                    continue;
                }

                if !runtime.config.ingress_delay.is_zero() {
                    thread::sleep(runtime.config.ingress_delay);
                }

                if runtime
                    .events
                    .send(NetEvent::Frame {
                        peer: peer.clone(),
                        channel: channel.clone(),
                        message: envelope.message,
                    })
                    .is_err()
                {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                tracing::debug!(target: "net", peer = %peer, "inbound socket error: {err}");
                break;
            }
        }
    }

    let _ = runtime.events.send(NetEvent::PeerClosed { peer, channel });
}

/// Read and validate the hello frame.
fn read_hello(
    reader: &mut FrameReader<PeerStream>,
    local: &NodeName,
    limits: &Limits,
) -> Result<(NodeName, ChannelId), String> {
    let bytes = match reader.read_next() {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return Err("closed before hello".to_string()),
        Err(err) => return Err(format!("hello not readable: {err}")),
    };

    let envelope =
        decode_envelope(&bytes, limits).map_err(|err| format!("hello malformed: {err}"))?;

    let hello = match envelope.message {
        Message::Hello(hello) => hello,
        other => {
            return Err(format!(
                "unexpected_peer: first frame was {other:?}, expected hello"
            ))
        }
    };

    // A peer presenting our own name is either misconfigured or hostile.
    if &hello.node == local {
        return Err(format!("unexpected_peer: hello named ourselves ({local})"));
    }

    Ok((hello.node, hello.channel))
}
