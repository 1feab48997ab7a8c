//! Node configuration schema and loading.

mod load;

pub use load::{config_path, load, load_or_init, write_config};

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{ChannelId, ChannelOptions, Limits, ListenAddr, RefFormat};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io: {reason}")]
    Io { reason: String },
    #[error("config parse: {reason}")]
    Parse { reason: String },
    #[error("config invalid: {reason}")]
    Invalid { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Globally unique node name; derived from the first listen address when
    /// absent.
    pub name: Option<String>,
    /// Convenience single-address form; folded into `listen_addrs`.
    pub peer_ip: Option<IpAddr>,
    pub peer_port: Option<u16>,
    pub listen_addrs: Vec<ListenAddr>,
    /// Default parallelism applied to channels that do not set their own.
    pub parallelism: u16,
    /// Channel map; `default` and `membership` always exist.
    pub channels: BTreeMap<String, ChannelOptions>,

    pub tls: bool,
    pub tls_server_options: TlsOptions,
    pub tls_client_options: TlsOptions,

    /// Snapshot directory; `None` disables persistence.
    pub data_dir: Option<PathBuf>,

    /// Sleep applied before every socket write / after every read.
    pub egress_delay_ms: u64,
    pub ingress_delay_ms: u64,
    /// Zero padding appended to data frames to emulate large payloads.
    pub binary_padding: usize,

    pub remote_ref_format: RefFormat,
    /// Causal labels to pre-register at start.
    pub causal_labels: Vec<String>,
    /// Gates the membership delta fanout on leave.
    pub broadcast: bool,
    /// Accepted for compatibility; there is no foreign distribution to
    /// bridge, so this is inert.
    pub connect_disterl: bool,

    pub logging: LoggingConfig,
    pub limits: Limits,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: None,
            peer_ip: None,
            peer_port: None,
            listen_addrs: Vec::new(),
            parallelism: 1,
            channels: default_channels(),
            tls: false,
            tls_server_options: TlsOptions::default(),
            tls_client_options: TlsOptions::default(),
            data_dir: None,
            egress_delay_ms: 0,
            ingress_delay_ms: 0,
            binary_padding: 0,
            remote_ref_format: RefFormat::default(),
            causal_labels: Vec::new(),
            broadcast: true,
            connect_disterl: false,
            logging: LoggingConfig::default(),
            limits: Limits::default(),
        }
    }
}

impl Config {
    /// All listen addresses, folding the `peer_ip`/`peer_port` convenience
    /// keys in front of the explicit list.
    pub fn effective_listen_addrs(&self) -> Vec<ListenAddr> {
        let mut addrs = Vec::new();
        if let (Some(ip), Some(port)) = (self.peer_ip, self.peer_port) {
            addrs.push(ListenAddr::new(ip, port));
        }
        for addr in &self.listen_addrs {
            if !addrs.contains(addr) {
                addrs.push(*addr);
            }
        }
        addrs
    }

    /// Channel table with validated names, the `default` and `membership`
    /// lanes guaranteed present, and the node-wide parallelism default
    /// applied.
    pub fn effective_channels(&self) -> Result<BTreeMap<ChannelId, ChannelOptions>, ConfigError> {
        let mut channels = BTreeMap::new();
        for (raw, opts) in &self.channels {
            let id = ChannelId::parse(raw.clone()).map_err(|e| ConfigError::Invalid {
                reason: e.to_string(),
            })?;
            opts.validate().map_err(|e| ConfigError::Invalid {
                reason: format!("channel {raw}: {e}"),
            })?;
            channels.insert(id, *opts);
        }
        let default_opts = ChannelOptions {
            parallelism: self.parallelism.max(1),
            ..ChannelOptions::default()
        };
        channels
            .entry(ChannelId::default_channel())
            .or_insert(default_opts);
        channels
            .entry(ChannelId::membership())
            .or_insert_with(ChannelOptions::default);
        Ok(channels)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.effective_channels()?;
        if self.tls {
            if self.tls_server_options.certfile.is_none()
                || self.tls_server_options.keyfile.is_none()
            {
                return Err(ConfigError::Invalid {
                    reason: "tls enabled but tls_server_options lacks certfile/keyfile".into(),
                });
            }
            if self.tls_client_options.cacertfile.is_none() {
                return Err(ConfigError::Invalid {
                    reason: "tls enabled but tls_client_options lacks cacertfile".into(),
                });
            }
        }
        Ok(())
    }
}

fn default_channels() -> BTreeMap<String, ChannelOptions> {
    let mut channels = BTreeMap::new();
    channels.insert(ChannelId::DEFAULT.to_string(), ChannelOptions::default());
    channels.insert(ChannelId::MEMBERSHIP.to_string(), ChannelOptions::default());
    channels
}

/// Certificate material for one side of a TLS connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsOptions {
    pub certfile: Option<PathBuf>,
    pub keyfile: Option<PathBuf>,
    pub cacertfile: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Tree,
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogRotation {
    Daily,
    Hourly,
    Minutely,
    Never,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub stdout: bool,
    pub stdout_format: LogFormat,
    pub filter: Option<String>,
    pub file: FileLoggingConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            stdout: true,
            stdout_format: LogFormat::Compact,
            filter: None,
            file: FileLoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileLoggingConfig {
    pub enabled: bool,
    pub dir: Option<PathBuf>,
    pub format: LogFormat,
    pub rotation: LogRotation,
    pub retention_max_age_days: Option<u64>,
    pub retention_max_files: Option<usize>,
}

impl Default for FileLoggingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: None,
            format: LogFormat::Compact,
            rotation: LogRotation::Daily,
            retention_max_age_days: Some(7),
            retention_max_files: Some(16),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_required_channels() {
        let cfg = Config::default();
        let channels = cfg.effective_channels().unwrap();
        assert!(channels.contains_key(&ChannelId::default_channel()));
        assert!(channels.contains_key(&ChannelId::membership()));
    }

    #[test]
    fn parallelism_default_applies_to_default_channel() {
        let mut cfg = Config::default();
        cfg.parallelism = 4;
        cfg.channels.clear();
        let channels = cfg.effective_channels().unwrap();
        assert_eq!(
            channels[&ChannelId::default_channel()].parallelism,
            4
        );
    }

    #[test]
    fn peer_ip_port_folds_into_listen_addrs() {
        let mut cfg = Config::default();
        cfg.peer_ip = Some("127.0.0.1".parse().unwrap());
        cfg.peer_port = Some(9100);
        cfg.listen_addrs = vec![ListenAddr::parse("127.0.0.1:9200").unwrap()];
        let addrs = cfg.effective_listen_addrs();
        assert_eq!(addrs.len(), 2);
        assert_eq!(addrs[0].port, 9100);
    }

    #[test]
    fn tls_requires_material() {
        let mut cfg = Config::default();
        cfg.tls = true;
        assert!(cfg.validate().is_err());
        cfg.tls_server_options.certfile = Some("cert.pem".into());
        cfg.tls_server_options.keyfile = Some("key.pem".into());
        cfg.tls_client_options.cacertfile = Some("ca.pem".into());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn invalid_channel_name_is_rejected() {
        let mut cfg = Config::default();
        cfg.channels
            .insert("Bad-Name".into(), ChannelOptions::default());
        assert!(cfg.effective_channels().is_err());
    }
}
