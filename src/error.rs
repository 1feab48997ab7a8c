use thiserror::Error;

use crate::config::ConfigError;
use crate::core::CoreError;
use crate::dispatch::DispatchError;
use crate::net::{AcceptError, ConnectError};
use crate::node::NodeError;

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (transient contention/outage).
    Retryable,
    /// Unknown if retry will help.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// Crate-level convenience error.
///
/// Not a "god error": it is a thin wrapper over canonical capability errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Accept(#[from] AcceptError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Node(#[from] NodeError),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Core(e) => e.transience(),
            Error::Config(_) => Transience::Permanent,
            Error::Connect(e) => e.transience(),
            Error::Accept(_) => Transience::Unknown,
            Error::Dispatch(e) => e.transience(),
            Error::Node(e) => e.transience(),
        }
    }
}
