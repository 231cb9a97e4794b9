//! Certificate loading shared by the DoT, DoH and DoQ listeners.

use crate::error::{Result, TdnsError};
use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Load certificate chain and private key from PEM files. The caller
/// skips the transport when either file is missing.
pub fn load_tls_config(cert_path: &Path, key_path: &Path, alpn: &[&[u8]]) -> Result<Arc<ServerConfig>> {
    let cert_pem = std::fs::read(cert_path)
        .map_err(|e| TdnsError::CertificateRead(format!("{}: {}", cert_path.display(), e)))?;
    let key_pem = std::fs::read(key_path)
        .map_err(|e| TdnsError::CertificateRead(format!("{}: {}", key_path.display(), e)))?;

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| TdnsError::CertificateParse(e.to_string()))?;
    if certs.is_empty() {
        return Err(TdnsError::CertificateParse(format!(
            "no certificate in {}",
            cert_path.display()
        )));
    }

    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .map_err(|e| TdnsError::PrivateKeyParse(e.to_string()))?
        .ok_or_else(|| {
            TdnsError::PrivateKeyParse(format!("no private key in {}", key_path.display()))
        })?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TdnsError::CertificateParse(e.to_string()))?;
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();

    info!(cert = %cert_path.display(), "TLS material loaded");
    Ok(Arc::new(config))
}

/// Both files must exist for an encrypted transport to start.
pub fn tls_material_present(cert_path: &Path, key_path: &Path) -> bool {
    cert_path.exists() && key_path.exists()
}
