//! Optional TLS for peer sockets.
//!
//! Certificate material is loaded from the PEM paths in configuration. Peers
//! authenticate against a shared CA; the server presents its certificate and
//! optionally demands one from clients when a CA is configured server-side.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::sync::Arc;

use rustls::server::AllowAnyAuthenticatedClient;
use rustls::{
    Certificate, ClientConfig, ClientConnection, PrivateKey, RootCertStore, ServerConfig,
    ServerConnection, ServerName, StreamOwned,
};
use thiserror::Error;

use crate::config::TlsOptions;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("tls io: {0}")]
    Io(#[from] io::Error),
    #[error("tls config: {0}")]
    Config(#[from] rustls::Error),
    #[error("tls material missing: {0}")]
    MaterialMissing(&'static str),
    #[error("invalid server name `{0}`")]
    InvalidServerName(String),
}

/// Shared client/server TLS configuration for one node.
#[derive(Clone)]
pub struct TlsContext {
    client: Arc<ClientConfig>,
    server: Arc<ServerConfig>,
}

impl TlsContext {
    pub fn from_options(
        server_opts: &TlsOptions,
        client_opts: &TlsOptions,
    ) -> Result<Self, TlsError> {
        let certfile = server_opts
            .certfile
            .as_deref()
            .ok_or(TlsError::MaterialMissing("tls_server_options.certfile"))?;
        let keyfile = server_opts
            .keyfile
            .as_deref()
            .ok_or(TlsError::MaterialMissing("tls_server_options.keyfile"))?;
        let cacertfile = client_opts
            .cacertfile
            .as_deref()
            .ok_or(TlsError::MaterialMissing("tls_client_options.cacertfile"))?;

        let certs = load_certs(certfile)?;
        let key = load_key(keyfile)?;
        let roots = load_roots(cacertfile)?;

        let server = match server_opts.cacertfile.as_deref() {
            Some(server_ca) => {
                let verifier = Arc::new(AllowAnyAuthenticatedClient::new(load_roots(server_ca)?));
                ServerConfig::builder()
                    .with_safe_defaults()
                    .with_client_cert_verifier(verifier)
                    .with_single_cert(certs.clone(), key.clone())?
            }
            None => ServerConfig::builder()
                .with_safe_defaults()
                .with_no_client_auth()
                .with_single_cert(certs.clone(), key.clone())?,
        };

        let client = match (client_opts.certfile.as_deref(), client_opts.keyfile.as_deref()) {
            (Some(client_cert), Some(client_key)) => ClientConfig::builder()
                .with_safe_defaults()
                .with_root_certificates(roots)
                .with_client_auth_cert(load_certs(client_cert)?, load_key(client_key)?)?,
            _ => ClientConfig::builder()
                .with_safe_defaults()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        };

        Ok(Self {
            client: Arc::new(client),
            server: Arc::new(server),
        })
    }

    pub fn wrap_client(
        &self,
        stream: TcpStream,
        server_name: &str,
    ) -> Result<PeerStream, TlsError> {
        let name = ServerName::try_from(server_name)
            .map_err(|_| TlsError::InvalidServerName(server_name.to_string()))?;
        let conn = ClientConnection::new(Arc::clone(&self.client), name)?;
        Ok(PeerStream::TlsClient(Box::new(StreamOwned::new(
            conn, stream,
        ))))
    }

    pub fn wrap_server(&self, stream: TcpStream) -> Result<PeerStream, TlsError> {
        let conn = ServerConnection::new(Arc::clone(&self.server))?;
        Ok(PeerStream::TlsServer(Box::new(StreamOwned::new(
            conn, stream,
        ))))
    }
}

/// A peer socket, plaintext or TLS. Sockets are unidirectional: one task
/// either reads or writes a given stream, never both.
pub enum PeerStream {
    Plain(TcpStream),
    TlsClient(Box<StreamOwned<ClientConnection, TcpStream>>),
    TlsServer(Box<StreamOwned<ServerConnection, TcpStream>>),
}

impl PeerStream {
    pub fn set_read_timeout(&self, timeout: Option<std::time::Duration>) -> io::Result<()> {
        self.tcp().set_read_timeout(timeout)
    }

    fn tcp(&self) -> &TcpStream {
        match self {
            PeerStream::Plain(stream) => stream,
            PeerStream::TlsClient(stream) => stream.get_ref(),
            PeerStream::TlsServer(stream) => stream.get_ref(),
        }
    }
}

impl Read for PeerStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            PeerStream::Plain(stream) => stream.read(buf),
            PeerStream::TlsClient(stream) => stream.read(buf),
            PeerStream::TlsServer(stream) => stream.read(buf),
        }
    }
}

impl Write for PeerStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            PeerStream::Plain(stream) => stream.write(buf),
            PeerStream::TlsClient(stream) => stream.write(buf),
            PeerStream::TlsServer(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            PeerStream::Plain(stream) => stream.flush(),
            PeerStream::TlsClient(stream) => stream.flush(),
            PeerStream::TlsServer(stream) => stream.flush(),
        }
    }
}

fn load_certs(path: &Path) -> Result<Vec<Certificate>, TlsError> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader)?;
    Ok(certs.into_iter().map(Certificate).collect())
}

fn load_key(path: &Path) -> Result<PrivateKey, TlsError> {
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;

    let mut reader = BufReader::new(bytes.as_slice());
    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut reader)?;
    if let Some(key) = keys.pop() {
        return Ok(PrivateKey(key));
    }

    let mut reader = BufReader::new(bytes.as_slice());
    let mut keys = rustls_pemfile::rsa_private_keys(&mut reader)?;
    keys.pop()
        .map(PrivateKey)
        .ok_or(TlsError::MaterialMissing("private key"))
}

fn load_roots(path: &Path) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots.add(&cert)?;
    }
    Ok(roots)
}
