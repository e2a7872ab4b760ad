//! Certificate loading for the HTTPS listener.

use anyhow::{anyhow, Context, Result};
use rustls::crypto::ring;
use rustls::ServerConfig;
use std::path::Path;
use std::sync::Arc;

/// Builds a rustls server config from PEM certificate chain and key files.
pub fn load_server_config(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>> {
    let cert_bytes = std::fs::read(cert_path)
        .with_context(|| format!("failed to read TLS certificate '{}'", cert_path.display()))?;
    let key_bytes = std::fs::read(key_path)
        .with_context(|| format!("failed to read TLS key '{}'", key_path.display()))?;
    server_config_from_pem(&cert_bytes, &key_bytes)
}

pub fn server_config_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Arc<ServerConfig>> {
    let certs = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow!("failed to parse certificate chain from PEM: {}", e))?;
    if certs.is_empty() {
        return Err(anyhow!("no certificate found in PEM"));
    }
    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| anyhow!("failed to parse private key from PEM: {}", e))?
        .ok_or_else(|| anyhow!("no private key found in PEM"))?;

    let config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| anyhow!("failed to configure TLS versions: {}", e))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| anyhow!("invalid TLS certificate or key: {}", e))?;
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_files_are_reported() {
        let err = load_server_config(
            Path::new("/nonexistent/cert.pem"),
            Path::new("/nonexistent/key.pem"),
        )
        .unwrap_err();
        assert!(err.to_string().contains("failed to read TLS certificate"));
    }

    #[test]
    fn pem_without_certificate_is_rejected() {
        let mut cert = tempfile::NamedTempFile::new().unwrap();
        writeln!(cert, "not a certificate").unwrap();
        let mut key = tempfile::NamedTempFile::new().unwrap();
        writeln!(key, "not a key").unwrap();
        let err = load_server_config(cert.path(), key.path()).unwrap_err();
        assert!(err.to_string().contains("no certificate found"));
    }

    #[test]
    fn loads_certificate_and_key_files() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/tls");
        let config = load_server_config(&dir.join("server.pem"), &dir.join("server.key")).unwrap();
        assert!(config.alpn_protocols.is_empty());
    }
}
