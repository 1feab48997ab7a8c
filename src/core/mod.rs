//! Core identity atoms.
//!
//! Module hierarchy follows type dependency order:
//! - time: wall clock
//! - error: validation errors
//! - identity: NodeName, ListenAddr, NodeSpec
//! - channel: ChannelId, ChannelOptions
//! - remote_ref: RemoteRef and its two wire forms
//! - limits: normative protocol defaults

pub mod channel;
pub mod error;
pub mod identity;
pub mod limits;
pub mod remote_ref;
pub mod time;

pub use channel::{ChannelId, ChannelOptions, Slot};
pub use error::CoreError;
pub use identity::{ListenAddr, NodeName, NodeSpec};
pub use limits::Limits;
pub use remote_ref::{RefFormat, RemoteRef};
pub use time::WallClock;
