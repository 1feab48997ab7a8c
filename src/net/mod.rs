//! Peer sockets, wire protocol and the connection registry.

pub mod client;
pub mod frame;
pub mod proto;
pub mod registry;
pub mod server;
pub mod tls;

pub use client::{ConnKey, ConnectError, Connection, ConnectionHandle, DialOptions};
pub use frame::{FrameError, FrameReader, FrameWriter};
pub use proto::{
    decode_envelope, encode_envelope, Envelope, Message, ProtoDecodeError, ProtoEncodeError,
};
pub use registry::{ConnectionRegistry, PickError, RegistryConfig, RegistryNotice};
pub use server::{AcceptError, ListenerConfig, ListenerHandle, NetEvent};
pub use tls::{PeerStream, TlsContext, TlsError};
