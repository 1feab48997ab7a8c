//! Core capability errors (parsing and validation).
//!
//! These are bounded and stable: core errors represent domain/refusal states,
//! not library implementation details.

use thiserror::Error;

use crate::error::Transience;

/// Invalid identifier.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum InvalidId {
    #[error("node name `{raw}` is invalid: {reason}")]
    Node { raw: String, reason: String },
    #[error("channel name `{raw}` is invalid: {reason}")]
    Channel { raw: String, reason: String },
    #[error("remote ref `{raw}` is invalid: {reason}")]
    RemoteRef { raw: String, reason: String },
    #[error("listen address `{raw}` is invalid: {reason}")]
    ListenAddr { raw: String, reason: String },
}

/// Invalid per-channel option.
#[derive(Debug, Error, Clone)]
#[error("channel option {field} value {value} out of range {min}..={max}")]
pub struct ChannelOptionError {
    pub field: &'static str,
    pub value: u32,
    pub min: u32,
    pub max: u32,
}

/// Canonical error enum for core capability.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum CoreError {
    #[error(transparent)]
    InvalidId(#[from] InvalidId),
    #[error(transparent)]
    ChannelOption(#[from] ChannelOptionError),
}

impl CoreError {
    pub fn transience(&self) -> Transience {
        // Core errors are pure domain/input failures.
        Transience::Permanent
    }
}
