//! Certificate and identity store
//!
//! Holds the self-signed TLS keypair used by the public listener and the
//! stable identifiers (server id, registration secret) the relay knows this
//! server by.

pub mod identity;
pub mod self_signed;

pub use identity::{Identity, IdentityStore};
pub use self_signed::{generate_self_signed_cert, SelfSignedCertificate};

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CertError {
    #[error("Certificate generation failed: {0}")]
    Generation(String),

    #[error("Failed to parse certificate: {0}")]
    Parse(String),

    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Identity file is corrupt: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Certificate with private key
#[derive(Debug)]
pub struct Certificate {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub private_key: PrivateKeyDer<'static>,
}

impl Certificate {
    /// rustls server configuration for the public TLS listener
    pub fn server_config(self) -> Result<Arc<rustls::ServerConfig>, CertError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut config = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(self.cert_chain, self.private_key)?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(Arc::new(config))
    }
}

/// Parse a PEM certificate chain and private key
pub fn load_certificate(cert_pem: &str, key_pem: &str) -> Result<Certificate, CertError> {
    let cert_chain = rustls_pemfile::certs(&mut cert_pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CertError::Parse(format!("certificate: {}", e)))?;

    if cert_chain.is_empty() {
        return Err(CertError::Parse("no certificate found".to_string()));
    }

    let private_key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
        .map_err(|e| CertError::Parse(format!("private key: {}", e)))?
        .ok_or_else(|| CertError::Parse("no private key found".to_string()))?;

    Ok(Certificate {
        cert_chain,
        private_key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cert_can_be_used_with_rustls() {
        let cert = generate_self_signed_cert(&[]).unwrap();
        let parsed = load_certificate(&cert.pem_cert, &cert.pem_key).unwrap();

        let config = parsed.server_config().unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn test_load_certificate_rejects_garbage() {
        assert!(matches!(
            load_certificate("not a pem", "not a key"),
            Err(CertError::Parse(_))
        ));
    }
}
