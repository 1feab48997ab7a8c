//! Protocol limits and timing (normative defaults).
//!
//! Values are intentionally explicit about their units to avoid confusion.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Bound on the active view, self excluded.
    pub active_view_size: usize,
    /// Bound on the passive view.
    pub passive_view_size: usize,
    /// Active random-walk length for forward joins.
    pub active_rwl: u32,
    /// Passive random-walk length for forward joins.
    pub passive_rwl: u32,

    pub shuffle_interval_ms: u64,
    pub shuffle_active_count: usize,
    pub shuffle_passive_count: usize,

    pub connect_timeout_ms: u64,
    pub hello_timeout_ms: u64,
    pub keepalive_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,

    pub ack_timeout_ms: u64,
    pub ack_retry_limit: u32,
    pub delay_retry_ms: u64,

    pub max_frame_bytes: usize,
    pub max_cbor_map_entries: u64,
    pub max_cbor_array_entries: u64,
    pub max_cbor_text_len: u64,
    pub max_cbor_bytes_len: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            active_view_size: 5,
            passive_view_size: 30,
            active_rwl: 6,
            passive_rwl: 3,

            shuffle_interval_ms: 10_000,
            shuffle_active_count: 3,
            shuffle_passive_count: 4,

            connect_timeout_ms: 1_000,
            hello_timeout_ms: 1_000,
            keepalive_ms: 5_000,
            reconnect_base_ms: 100,
            reconnect_max_ms: 5_000,

            ack_timeout_ms: 1_000,
            ack_retry_limit: 3,
            delay_retry_ms: 100,

            max_frame_bytes: 16 * 1024 * 1024,
            max_cbor_map_entries: 10_000,
            max_cbor_array_entries: 10_000,
            max_cbor_text_len: 1024 * 1024,
            max_cbor_bytes_len: 16 * 1024 * 1024,
        }
    }
}
