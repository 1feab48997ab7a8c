//! Outbound peer connections.
//!
//! A connection is owned by exactly one (peer, channel, slot) triple and is
//! write-only: the dialing side sends, the accepting side reads. The hello
//! frame is written synchronously during dial so a successful return means
//! the handshake reached the wire.

use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{unbounded, RecvTimeoutError, Sender};
use thiserror::Error;

use crate::core::{ChannelId, NodeName, RefFormat, Slot};
use crate::error::Transience;
use crate::metrics;
use crate::net::frame::{FrameError, FrameWriter};
use crate::net::proto::{encode_envelope, Envelope, Hello, Message, Ping, ProtoEncodeError};
use crate::net::tls::{PeerStream, TlsContext, TlsError};

/// Identity of one outbound socket.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnKey {
    pub peer: NodeName,
    pub channel: ChannelId,
    pub slot: Slot,
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("connect to {addr} timed out after {ms}ms")]
    Timeout { addr: SocketAddr, ms: u64 },
    #[error("connect io: {0}")]
    Io(#[from] std::io::Error),
    #[error("connect tls: {0}")]
    Tls(#[from] TlsError),
    #[error("hello frame: {0}")]
    Frame(#[from] FrameError),
    #[error("hello encode: {0}")]
    Encode(#[from] ProtoEncodeError),
    #[error("peer {peer} advertises no listen address")]
    NoAddress { peer: NodeName },
}

impl ConnectError {
    pub fn transience(&self) -> Transience {
        match self {
            ConnectError::NoAddress { .. } => Transience::Permanent,
            _ => Transience::Retryable,
        }
    }
}

/// Sent on the channel given to [`dial`] when a writer dies.
pub type FailureNotice = ConnKey;

#[derive(Clone)]
pub struct DialOptions {
    pub local: NodeName,
    pub connect_timeout: Duration,
    pub egress_delay: Duration,
    pub keepalive: Duration,
    pub max_frame_bytes: usize,
    pub ref_format: RefFormat,
    pub tls: Option<TlsContext>,
}

enum WriterCmd {
    Frame(Vec<u8>),
    Shutdown,
}

/// Clonable sending half of a connection.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    key: ConnKey,
    cmd_tx: Sender<WriterCmd>,
    closed: Arc<AtomicBool>,
}

#[derive(Debug, Error)]
#[error("connection to {peer} ({channel}:{slot}) is closed")]
pub struct ConnectionClosed {
    pub peer: NodeName,
    pub channel: ChannelId,
    pub slot: Slot,
}

impl ConnectionHandle {
    pub fn key(&self) -> &ConnKey {
        &self.key
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Queue one encoded envelope for the writer. FIFO per connection.
    pub fn send_frame(&self, bytes: Vec<u8>) -> Result<(), ConnectionClosed> {
        if self.is_closed() || self.cmd_tx.send(WriterCmd::Frame(bytes)).is_err() {
            return Err(self.closed_error());
        }
        Ok(())
    }

    fn closed_error(&self) -> ConnectionClosed {
        ConnectionClosed {
            peer: self.key.peer.clone(),
            channel: self.key.channel.clone(),
            slot: self.key.slot,
        }
    }
}

/// An open outbound socket plus its writer task.
pub struct Connection {
    handle: ConnectionHandle,
    join: Option<JoinHandle<()>>,
}

impl Connection {
    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    pub fn key(&self) -> &ConnKey {
        &self.handle.key
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    /// Ask the writer to stop and wait for it.
    pub fn shutdown(mut self) {
        let _ = self.handle.cmd_tx.send(WriterCmd::Shutdown);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let _ = self.handle.cmd_tx.send(WriterCmd::Shutdown);
    }
}

/// Dial `addr`, perform the hello handshake for `key.channel`, and spawn the
/// writer task. Returns within `opts.connect_timeout` or fails.
pub fn dial(
    addr: SocketAddr,
    key: ConnKey,
    opts: &DialOptions,
    failures: Sender<FailureNotice>,
) -> Result<Connection, ConnectError> {
    let stream =
        TcpStream::connect_timeout(&addr, opts.connect_timeout).map_err(|e| match e.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                ConnectError::Timeout {
                    addr,
                    ms: opts.connect_timeout.as_millis() as u64,
                }
            }
            _ => ConnectError::Io(e),
        })?;
    stream.set_nodelay(true)?;

    let stream = match &opts.tls {
        Some(tls) => tls.wrap_client(stream, &addr.ip().to_string())?,
        None => PeerStream::Plain(stream),
    };

    let mut writer = FrameWriter::new(stream, opts.max_frame_bytes);
    let hello = Envelope::v1(Message::Hello(Hello {
        node: opts.local.clone(),
        channel: key.channel.clone(),
    }));
    writer.write_frame(&encode_envelope(&hello, opts.ref_format)?)?;

    tracing::debug!(
        target: "net",
        peer = %key.peer,
        channel = %key.channel,
        slot = key.slot,
        %addr,
        "outbound connection established"
    );

    Ok(spawn_writer(writer, key, opts, failures))
}

/// Spawn the writer task over an already-framed stream. Split from [`dial`]
/// so tests can run a writer over any `Write`.
pub(crate) fn spawn_writer<W: std::io::Write + Send + 'static>(
    writer: FrameWriter<W>,
    key: ConnKey,
    opts: &DialOptions,
    failures: Sender<FailureNotice>,
) -> Connection {
    let (cmd_tx, cmd_rx) = unbounded::<WriterCmd>();
    let closed = Arc::new(AtomicBool::new(false));

    let handle = ConnectionHandle {
        key: key.clone(),
        cmd_tx,
        closed: Arc::clone(&closed),
    };

    let egress_delay = opts.egress_delay;
    let keepalive = opts.keepalive;
    let ref_format = opts.ref_format;
    let join = thread::spawn(move || {
        run_writer(
            writer,
            cmd_rx,
            key,
            egress_delay,
            keepalive,
            ref_format,
            closed,
            failures,
        );
    });

    Connection {
        handle,
        join: Some(join),
    }
}

#[allow(clippy::too_many_arguments)]
fn run_writer<W: std::io::Write>(
    mut writer: FrameWriter<W>,
    cmd_rx: crossbeam::channel::Receiver<WriterCmd>,
    key: ConnKey,
    egress_delay: Duration,
    keepalive: Duration,
    ref_format: RefFormat,
    closed: Arc<AtomicBool>,
    failures: Sender<FailureNotice>,
) {
    loop {
        match cmd_rx.recv_timeout(keepalive) {
            Ok(WriterCmd::Frame(bytes)) => {
                if !egress_delay.is_zero() {
                    thread::sleep(egress_delay);
                }
                match writer.write_frame(&bytes) {
                    Ok(written) => metrics::frame_sent(key.channel.as_str(), written),
                    Err(err) => {
                        tracing::warn!(
                            target: "net",
                            peer = %key.peer,
                            channel = %key.channel,
                            slot = key.slot,
                            "outbound write failed: {err}"
                        );
                        closed.store(true, Ordering::Release);
                        let _ = failures.send(key);
                        return;
                    }
                }
            }
            Ok(WriterCmd::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                closed.store(true, Ordering::Release);
                return;
            }
            Err(RecvTimeoutError::Timeout) => {
                let ping = Envelope::v1(Message::Ping(Ping {
                    nonce: rand::random(),
                }));
                let bytes = match encode_envelope(&ping, ref_format) {
                    Ok(bytes) => bytes,
                    Err(_) => continue,
                };
                if writer.write_frame(&bytes).is_err() {
                    closed.store(true, Ordering::Release);
                    let _ = failures.send(key);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    use crate::core::Limits;
    use crate::net::frame::FrameReader;
    use crate::net::proto::decode_envelope;

    fn opts(local: &str) -> DialOptions {
        DialOptions {
            local: NodeName::parse(local).unwrap(),
            connect_timeout: Duration::from_millis(1_000),
            egress_delay: Duration::ZERO,
            keepalive: Duration::from_secs(30),
            max_frame_bytes: Limits::default().max_frame_bytes,
            ref_format: RefFormat::ImproperList,
            tls: None,
        }
    }

    fn key(peer: &str) -> ConnKey {
        ConnKey {
            peer: NodeName::parse(peer).unwrap(),
            channel: ChannelId::default_channel(),
            slot: 0,
        }
    }

    #[test]
    fn dial_sends_hello_then_frames_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (failures, _failure_rx) = unbounded();

        let conn = dial(addr, key("peer@h"), &opts("me@h"), failures).unwrap();

        let (stream, _) = listener.accept().unwrap();
        let mut reader = FrameReader::new(stream, Limits::default().max_frame_bytes);

        let hello = decode_envelope(
            &reader.read_next().unwrap().unwrap(),
            &Limits::default(),
        )
        .unwrap();
        let Message::Hello(hello) = hello.message else {
            panic!("expected hello first");
        };
        assert_eq!(hello.node.as_str(), "me@h");

        let ack = Envelope::v1(Message::Ack(crate::net::proto::Ack { id: 1 }));
        conn.handle()
            .send_frame(encode_envelope(&ack, RefFormat::ImproperList).unwrap())
            .unwrap();
        let next = decode_envelope(
            &reader.read_next().unwrap().unwrap(),
            &Limits::default(),
        )
        .unwrap();
        assert!(matches!(next.message, Message::Ack(_)));

        conn.shutdown();
        assert!(reader.read_next().unwrap().is_none());
    }

    #[test]
    fn dial_times_out_against_blackhole() {
        // RFC 5737 TEST-NET-1 address drops SYNs on most networks; a refused
        // connection also satisfies the bounded-failure contract.
        let addr: SocketAddr = "192.0.2.1:9".parse().unwrap();
        let (failures, _failure_rx) = unbounded();
        let mut o = opts("me@h");
        o.connect_timeout = Duration::from_millis(50);
        let started = std::time::Instant::now();
        let result = dial(addr, key("peer@h"), &o, failures);
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn writer_failure_is_reported_once() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (failures, failure_rx) = unbounded();

        let conn = dial(addr, key("peer@h"), &opts("me@h"), failures).unwrap();
        let (stream, _) = listener.accept().unwrap();
        drop(stream);

        // Keep writing until the broken pipe surfaces.
        let payload =
            encode_envelope(&Envelope::v1(Message::Ping(Ping { nonce: 1 })), RefFormat::ImproperList)
                .unwrap();
        for _ in 0..200 {
            if conn.handle().send_frame(payload.clone()).is_err() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }

        let notice = failure_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("failure notice");
        assert_eq!(notice.peer.as_str(), "peer@h");
        assert!(conn.is_closed());
    }
}
