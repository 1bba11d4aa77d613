//! TLS Trust Configuration
//!
//! Two trust modes are used by the client:
//! - Public: webpki roots, server name taken from the URL host
//! - Pinned: a bundled root CA, server name supplied by the caller
//!
//! Provider gateways are reached by IP address but present certificates
//! issued for a region common name, so pinned requests verify against that
//! name instead of the connection address.

use crate::client::HttpError;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Expected identity for a pinned TLS connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPin {
    /// Key under which the connector is cached (the region id)
    pub cache_key: String,
    /// Name the server certificate must be valid for
    pub server_name: String,
}

impl TlsPin {
    pub fn new(cache_key: impl Into<String>, server_name: impl Into<String>) -> Self {
        Self {
            cache_key: cache_key.into(),
            server_name: server_name.into(),
        }
    }
}

/// Load a PEM root CA bundle from disk
pub fn load_ca_bundle(path: &Path) -> Result<RootCertStore, HttpError> {
    let file = File::open(path).map_err(|e| {
        HttpError::TlsError(format!("Failed to open CA bundle {}: {}", path.display(), e))
    })?;
    let mut reader = BufReader::new(file);
    roots_from_reader(&mut reader)
}

/// Parse a PEM root CA bundle held in memory
pub fn load_ca_bundle_pem(pem: &[u8]) -> Result<RootCertStore, HttpError> {
    let mut reader = BufReader::new(pem);
    roots_from_reader(&mut reader)
}

fn roots_from_reader(reader: &mut dyn std::io::BufRead) -> Result<RootCertStore, HttpError> {
    let certs = rustls_pemfile::certs(reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| HttpError::TlsError(format!("Failed to parse CA bundle: {}", e)))?;

    if certs.is_empty() {
        return Err(HttpError::TlsError("No certificates found in CA bundle".to_string()));
    }

    let mut roots = RootCertStore::empty();
    for cert in certs {
        roots
            .add(cert)
            .map_err(|e| HttpError::TlsError(format!("Invalid CA certificate: {}", e)))?;
    }

    debug!("Loaded {} pinned root certificate(s)", roots.len());
    Ok(roots)
}

/// Public web PKI roots
pub(crate) fn public_roots() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    roots
}

pub(crate) fn connector(roots: Arc<RootCertStore>) -> TlsConnector {
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

pub(crate) fn server_name(name: &str) -> Result<ServerName<'static>, HttpError> {
    ServerName::try_from(name.to_string())
        .map_err(|_| HttpError::TlsError(format!("Invalid server name: {}", name)))
}
