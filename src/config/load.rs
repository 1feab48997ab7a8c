use std::fs;
use std::path::{Path, PathBuf};

use super::{Config, ConfigError};

pub fn config_path() -> PathBuf {
    crate::paths::config_dir().join("config.toml")
}

/// Load the user config file (if any) and apply environment overrides.
pub fn load() -> Result<Config, ConfigError> {
    let path = config_path();
    let mut config = if path.exists() {
        let contents = fs::read_to_string(&path).map_err(|e| ConfigError::Io {
            reason: format!("failed to read {}: {e}", path.display()),
        })?;
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            reason: format!("failed to parse {}: {e}", path.display()),
        })?
    } else {
        Config::default()
    };
    apply_env_overrides(&mut config);
    config.validate()?;
    Ok(config)
}

/// Like [`load`], but never fails: parse errors fall back to defaults and a
/// missing user config is written back.
pub fn load_or_init() -> Config {
    let path = config_path();
    let had_user_config = path.exists();

    let config = match load() {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!("config load failed, using defaults: {e}");
            let mut cfg = Config::default();
            apply_env_overrides(&mut cfg);
            cfg
        }
    };

    if !had_user_config {
        if let Err(e) = write_config(&path, &Config::default()) {
            tracing::warn!("failed to write default config: {e}");
        }
    }

    config
}

pub fn write_config(path: &Path, cfg: &Config) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|e| ConfigError::Io {
            reason: format!("failed to create {}: {e}", dir.display()),
        })?;
    }
    let contents = toml::to_string_pretty(cfg).map_err(|e| ConfigError::Io {
        reason: format!("failed to render config: {e}"),
    })?;
    atomic_write(path, contents.as_bytes())
}

fn atomic_write(path: &Path, data: &[u8]) -> Result<(), ConfigError> {
    let dir = path.parent().ok_or_else(|| ConfigError::Io {
        reason: "config path missing parent directory".into(),
    })?;
    let temp = tempfile::NamedTempFile::new_in(dir).map_err(|e| ConfigError::Io {
        reason: format!("failed to create temp file in {}: {e}", dir.display()),
    })?;
    fs::write(temp.path(), data).map_err(|e| ConfigError::Io {
        reason: format!("failed to write config temp file: {e}"),
    })?;
    temp.persist(path).map_err(|e| ConfigError::Io {
        reason: format!("failed to persist config to {}: {e}", path.display()),
    })?;
    Ok(())
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(name) = std::env::var("PARTISAN_NAME") {
        if !name.is_empty() {
            config.name = Some(name);
        }
    }
    if let Ok(ip) = std::env::var("PARTISAN_PEER_IP") {
        if let Ok(ip) = ip.parse() {
            config.peer_ip = Some(ip);
        }
    }
    if let Ok(port) = std::env::var("PARTISAN_PEER_PORT") {
        if let Ok(port) = port.parse() {
            config.peer_port = Some(port);
        }
    }
    if let Ok(dir) = std::env::var("PARTISAN_DATA_DIR") {
        if !dir.is_empty() {
            config.data_dir = Some(PathBuf::from(dir));
        }
    }
    if let Ok(delay) = std::env::var("PARTISAN_EGRESS_DELAY_MS") {
        if let Ok(delay) = delay.parse() {
            config.egress_delay_ms = delay;
        }
    }
    if let Ok(delay) = std::env::var("PARTISAN_INGRESS_DELAY_MS") {
        if let Ok(delay) = delay.parse() {
            config.ingress_delay_ms = delay;
        }
    }
}
