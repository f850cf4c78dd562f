use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;

use crate::config::TlsConfig;

#[derive(Debug)]
pub enum TlsError {
    ReadFile {
        path: PathBuf,
        source: io::Error,
    },
    ParseCertificates {
        path: PathBuf,
        source: rustls::pki_types::pem::Error,
    },
    NoCertificates {
        path: PathBuf,
    },
    ParsePrivateKey {
        path: PathBuf,
        source: rustls::pki_types::pem::Error,
    },
    Config(rustls::Error),
}

impl fmt::Display for TlsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadFile { path, source } => {
                write!(f, "failed to read TLS file '{}': {source}", path.display())
            }
            Self::ParseCertificates { path, source } => write!(
                f,
                "failed to parse PEM certificates in '{}': {source}",
                path.display()
            ),
            Self::NoCertificates { path } => {
                write!(f, "no certificates found in '{}'", path.display())
            }
            Self::ParsePrivateKey { path, source } => write!(
                f,
                "failed to parse PEM private key in '{}': {source}",
                path.display()
            ),
            Self::Config(source) => write!(f, "invalid TLS server configuration: {source}"),
        }
    }
}

impl std::error::Error for TlsError {}

/// Returns `None` when TLS is disabled.
pub fn server_config_from(config: &TlsConfig) -> Result<Option<Arc<ServerConfig>>, TlsError> {
    if !config.enabled {
        return Ok(None);
    }
    load_server_config(Path::new(&config.cert_path), Path::new(&config.key_path)).map(Some)
}

/// Builds a server-only (no client auth) rustls config from a PEM certificate
/// chain and a PEM private key.
pub fn load_server_config(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>, TlsError> {
    let cert_pem = read_pem(cert_path)?;
    let key_pem = read_pem(key_path)?;

    let certs: Vec<CertificateDer<'static>> = CertificateDer::pem_slice_iter(&cert_pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::ParseCertificates {
            path: cert_path.to_path_buf(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates {
            path: cert_path.to_path_buf(),
        });
    }

    let key = PrivateKeyDer::from_pem_slice(&key_pem).map_err(|source| {
        TlsError::ParsePrivateKey {
            path: key_path.to_path_buf(),
            source,
        }
    })?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(TlsError::Config)?;

    Ok(Arc::new(config))
}

fn read_pem(path: &Path) -> Result<Vec<u8>, TlsError> {
    fs::read(path).map_err(|source| TlsError::ReadFile {
        path: path.to_path_buf(),
        source,
    })
}
