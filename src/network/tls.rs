//! Shared TLS context
//!
//! Built once from the `[tls]` config table and shared by every server. The
//! client side trusts the configured CA bundle, or pins the node's own
//! certificate when no CA is given.

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, ClientConnection, RootCertStore, ServerConfig, ServerConnection};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// TLS setup errors
#[derive(Error, Debug)]
pub enum TlsError {
    #[error("Failed to read {path}: {reason}")]
    Pem { path: String, reason: String },
    #[error("No certificates found in {0}")]
    NoCertificates(String),
    #[error("TLS error: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Server and client configurations sharing one crypto provider
#[derive(Debug, Clone)]
pub struct TlsContext {
    server: Arc<ServerConfig>,
    client: Arc<ClientConfig>,
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let pem_err = |e: rustls::pki_types::pem::Error| TlsError::Pem {
        path: path.display().to_string(),
        reason: e.to_string(),
    };

    let certs = CertificateDer::pem_file_iter(path)
        .map_err(pem_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(pem_err)?;

    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.display().to_string()));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    PrivateKeyDer::from_pem_file(path).map_err(|e| TlsError::Pem {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

impl TlsContext {
    /// Load certificate chain, private key and optional CA bundle
    pub fn load(cert: &Path, key: &Path, ca: Option<&Path>) -> Result<Self, TlsError> {
        let chain = load_certs(cert)?;
        let key = load_key(key)?;

        let mut roots = RootCertStore::empty();
        let trusted = match ca {
            Some(ca) => load_certs(ca)?,
            None => chain.clone(),
        };
        let (added, ignored) = roots.add_parsable_certificates(trusted);
        log::debug!("TLS trust store: {} added, {} ignored", added, ignored);

        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let server = ServerConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(chain, key)?;

        let client = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Self {
            server: Arc::new(server),
            client: Arc::new(client),
        })
    }

    /// Session for an accepted connection
    pub fn accept(&self) -> Result<rustls::Connection, TlsError> {
        let conn = ServerConnection::new(self.server.clone())?;
        Ok(rustls::Connection::Server(conn))
    }

    /// Session for a dial to `ip`
    pub fn connect(&self, ip: IpAddr) -> Result<rustls::Connection, TlsError> {
        let name = ServerName::IpAddress(ip.into());
        let conn = ClientConnection::new(self.client.clone(), name)?;
        Ok(rustls::Connection::Client(conn))
    }
}

/// Context around a fresh self-signed certificate for 127.0.0.1, written to `dir`
#[cfg(test)]
pub(crate) fn self_signed(dir: &Path) -> TlsContext {
    let names = vec!["127.0.0.1".to_string(), "localhost".to_string()];
    let certified = rcgen::generate_simple_self_signed(names).unwrap();

    let cert = dir.join("cert.pem");
    let key = dir.join("key.pem");
    std::fs::write(&cert, certified.cert.pem()).unwrap();
    std::fs::write(&key, certified.key_pair.serialize_pem()).unwrap();
    TlsContext::load(&cert, &key, None).unwrap()
}
