//! Channels: named logical lanes between two peers.
//!
//! Every node carries a fixed channel set from start; `default` always
//! exists, and `membership` carries protocol traffic where configured.
//! Other conventional names are `gossip`, `vnode` and `rpc`.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::{ChannelOptionError, CoreError, InvalidId};

/// Index into the parallel socket set of one (peer, channel) pair.
pub type Slot = u16;

/// Validated channel name.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    pub const DEFAULT: &'static str = "default";
    pub const MEMBERSHIP: &'static str = "membership";

    pub fn parse(s: impl Into<String>) -> Result<Self, CoreError> {
        let s = s.into();
        if s.is_empty() {
            return Err(InvalidId::Channel {
                raw: s,
                reason: "empty".into(),
            }
            .into());
        }
        for c in s.chars() {
            if !(c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_') {
                return Err(InvalidId::Channel {
                    raw: s.clone(),
                    reason: format!("contains forbidden character {c:?}"),
                }
                .into());
            }
        }
        Ok(Self(s))
    }

    pub fn default_channel() -> Self {
        Self(Self::DEFAULT.to_string())
    }

    pub fn membership() -> Self {
        Self(Self::MEMBERSHIP.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelId({:?})", self.0)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-channel behaviour knobs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelOptions {
    /// Monotonic channels force slot 0 so delivery order equals send order.
    pub monotonic: bool,
    /// Number of parallel sockets kept open for the channel.
    pub parallelism: u16,
    /// Deflate level 0-9; `None` disables compression.
    pub compression: Option<u32>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            monotonic: false,
            parallelism: 1,
            compression: None,
        }
    }
}

impl ChannelOptions {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.parallelism == 0 {
            return Err(ChannelOptionError {
                field: "parallelism",
                value: 0,
                min: 1,
                max: u16::MAX as u32,
            }
            .into());
        }
        if let Some(level) = self.compression {
            if level > 9 {
                return Err(ChannelOptionError {
                    field: "compression",
                    value: level,
                    min: 0,
                    max: 9,
                }
                .into());
            }
        }
        Ok(())
    }

    /// Effective parallelism: monotonic channels only ever use slot 0.
    pub fn effective_parallelism(&self) -> u16 {
        if self.monotonic {
            1
        } else {
            self.parallelism
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_id_validation() {
        assert!(ChannelId::parse("vnode").is_ok());
        assert!(ChannelId::parse("big_lane2").is_ok());
        assert!(ChannelId::parse("").is_err());
        assert!(ChannelId::parse("No-Caps").is_err());
    }

    #[test]
    fn options_reject_out_of_range() {
        let mut opts = ChannelOptions::default();
        assert!(opts.validate().is_ok());
        opts.parallelism = 0;
        assert!(opts.validate().is_err());
        opts.parallelism = 4;
        opts.compression = Some(10);
        assert!(opts.validate().is_err());
        opts.compression = Some(9);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn monotonic_pins_parallelism() {
        let opts = ChannelOptions {
            monotonic: true,
            parallelism: 4,
            compression: None,
        };
        assert_eq!(opts.effective_parallelism(), 1);
    }
}
