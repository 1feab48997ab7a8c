//! Cluster state snapshots.
//!
//! The `(Active, Passive)` pair is written as one CBOR document to
//! `<data_dir>/peer_service/cluster_state` after every view mutation. Writes
//! go through a temp file and an atomic rename; loads tolerate a missing or
//! corrupt file by reporting first boot.

use std::fs;
use std::path::{Path, PathBuf};

use minicbor::{Decoder, Encoder};
use thiserror::Error;

use crate::core::{Limits, NodeSpec};
use crate::net::proto::{
    decode_map_len, decode_node_spec, decode_text, encode_node_spec, ProtoDecodeError,
    ProtoEncodeError,
};

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("snapshot io: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot encode: {0}")]
    Encode(#[from] minicbor::encode::Error<std::convert::Infallible>),
    #[error("snapshot proto encode: {0}")]
    ProtoEncode(#[from] ProtoEncodeError),
    #[error("snapshot persist: {0}")]
    Rename(#[from] tempfile::PersistError),
}

pub struct SnapshotStore {
    path: PathBuf,
    limits: Limits,
}

impl SnapshotStore {
    pub fn new(data_dir: &Path, limits: Limits) -> Self {
        Self {
            path: crate::paths::cluster_state_path(data_dir),
            limits,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self, active: &[NodeSpec], passive: &[NodeSpec]) -> Result<(), PersistError> {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.map(2)?;
        enc.str("active")?;
        enc.array(active.len() as u64)?;
        for spec in active {
            encode_node_spec(&mut enc, spec)?;
        }
        enc.str("passive")?;
        enc.array(passive.len() as u64)?;
        for spec in passive {
            encode_node_spec(&mut enc, spec)?;
        }

        let dir = self.path.parent().ok_or_else(|| {
            PersistError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "snapshot path missing parent directory",
            ))
        })?;
        fs::create_dir_all(dir)?;
        let temp = tempfile::NamedTempFile::new_in(dir)?;
        fs::write(temp.path(), &buf)?;
        temp.persist(&self.path)?;
        Ok(())
    }

    /// Load the snapshot. `None` means first boot; a corrupt snapshot is
    /// logged and treated the same way.
    pub fn load(&self) -> Option<(Vec<NodeSpec>, Vec<NodeSpec>)> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                tracing::warn!("cluster state unreadable, starting fresh: {err}");
                return None;
            }
        };

        match decode_snapshot(&bytes, &self.limits) {
            Ok(views) => Some(views),
            Err(err) => {
                tracing::warn!("cluster state corrupt, starting fresh: {err}");
                None
            }
        }
    }

    pub fn delete(&self) {
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("failed to delete cluster state: {err}");
            }
        }
    }
}

fn decode_snapshot(
    bytes: &[u8],
    limits: &Limits,
) -> Result<(Vec<NodeSpec>, Vec<NodeSpec>), ProtoDecodeError> {
    let mut dec = Decoder::new(bytes);
    let map_len = decode_map_len(&mut dec, limits)?;
    let mut active = None;
    let mut passive = None;

    for _ in 0..map_len {
        let key = decode_text(&mut dec, limits)?;
        match key {
            "active" => active = Some(decode_spec_array(&mut dec, limits)?),
            "passive" => passive = Some(decode_spec_array(&mut dec, limits)?),
            _ => dec.skip()?,
        }
    }

    Ok((
        active.ok_or(ProtoDecodeError::MissingField("active"))?,
        passive.ok_or(ProtoDecodeError::MissingField("passive"))?,
    ))
}

fn decode_spec_array(
    dec: &mut Decoder,
    limits: &Limits,
) -> Result<Vec<NodeSpec>, ProtoDecodeError> {
    let len = crate::net::proto::decode_array_len(dec, limits)?;
    let mut specs = Vec::with_capacity(len as usize);
    for _ in 0..len {
        specs.push(decode_node_spec(dec, limits)?);
    }
    Ok(specs)
}
