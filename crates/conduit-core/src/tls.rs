//! TLS configuration for the block transfer protocol and the gateway.
//!
//! PEM loading plus rustls config builders. Brokers present a server
//! identity from `certificate-file`/`private-key-file`; clients verify it
//! against an explicit root set (the `verify-root-ca` surface). There is no
//! insecure mode.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),

    #[error("no PEM certificates found in {0}")]
    NoCertificates(PathBuf),

    #[error("no PEM private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("invalid host name for TLS: {0}")]
    InvalidHostName(String),

    #[error("TLS configuration rejected: {0}")]
    Config(#[from] rustls::Error),
}

/// All certificates from a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = File::open(path).map_err(|e| TlsError::ReadFailed(path.to_path_buf(), e))?;
    let mut reader = BufReader::new(file);

    let certs: Vec<_> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<_, _>>()
        .map_err(|e| TlsError::ReadFailed(path.to_path_buf(), e))?;

    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

/// The first private key (PKCS#8, PKCS#1, or SEC1) from a PEM file.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = File::open(path).map_err(|e| TlsError::ReadFailed(path.to_path_buf(), e))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TlsError::ReadFailed(path.to_path_buf(), e))?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_path_buf()))
}

/// Server-side TLS identity from PEM paths.
pub fn server_config(
    certificate_file: &Path,
    private_key_file: &Path,
) -> Result<Arc<ServerConfig>, TlsError> {
    let certs = load_certs(certificate_file)?;
    let key = load_private_key(private_key_file)?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(Arc::new(config))
}

/// Client-side verification against the given trust roots.
pub fn client_config(
    roots: Vec<CertificateDer<'static>>,
) -> Result<Arc<ClientConfig>, TlsError> {
    let mut store = RootCertStore::empty();
    for cert in roots {
        store.add(cert)?;
    }

    let config = ClientConfig::builder()
        .with_root_certificates(store)
        .with_no_client_auth();

    Ok(Arc::new(config))
}

/// SNI name for an outbound connection.
pub fn server_name(host: &str) -> Result<ServerName<'static>, TlsError> {
    ServerName::try_from(host.to_owned()).map_err(|_| TlsError::InvalidHostName(host.to_owned()))
}
