#![forbid(unsafe_code)]

//! Partisan is a cluster membership and messaging substrate: nodes discover
//! each other through a HyParView-style partial-view protocol, keep a pool of
//! multiplexed, channelised connections to their active peers, and exchange
//! application payloads with per-channel parallelism, optional TLS, optional
//! monotonic delivery, and interposition hooks for fault injection.
//!
//! Module hierarchy follows dependency order:
//! - `core`: identity atoms (node names/specs, channels, remote refs, limits)
//! - `net`: framing, wire protocol, TLS, outbound clients, inbound servers,
//!   and the connection registry
//! - `membership`: the HyParView views, protocol state machine, manager task
//!   and snapshot persistence
//! - `dispatch`: the send/forward path, ack retries, interposition filters
//!   and causal delivery
//! - `node`: runtime composition and the public facade

pub mod config;
pub mod core;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod membership;
pub mod metrics;
pub mod net;
pub mod node;
mod paths;
pub mod telemetry;

pub use error::{Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the types most callers need at the crate root.
pub use crate::core::{
    ChannelId, ChannelOptions, Limits, ListenAddr, NodeName, NodeSpec, RefFormat, RemoteRef,
};
pub use crate::dispatch::{AckReceipt, FilterDecision, FilterTag, SendOptions};
pub use crate::node::{Node, NodeHandle};
