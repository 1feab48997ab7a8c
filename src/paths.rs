//! XDG directory helpers for config/data locations.

use std::path::{Path, PathBuf};

/// Base directory for persistent data (cluster state snapshots).
///
/// Uses `PARTISAN_DATA_DIR` if set, otherwise `$XDG_DATA_HOME/partisan` or
/// `~/.local/share/partisan`.
pub(crate) fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("PARTISAN_DATA_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }

    std::env::var("XDG_DATA_HOME")
        .ok()
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".local")
                .join("share")
        })
        .join("partisan")
}

/// Base directory for configuration files.
pub(crate) fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .ok()
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".config")
        })
        .join("partisan")
}

/// Directory for log files.
pub(crate) fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Location of the persisted `(Active, Passive)` snapshot.
pub(crate) fn cluster_state_path(data_dir: &Path) -> PathBuf {
    data_dir.join("peer_service").join("cluster_state")
}
