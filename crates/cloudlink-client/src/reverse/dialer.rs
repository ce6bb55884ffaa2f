//! TLS connections to relay edges

use async_trait::async_trait;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::{ReachError, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Byte stream to the relay
pub trait RelayStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> RelayStream for T {}

pub type BoxedRelayStream = Box<dyn RelayStream>;

#[async_trait]
pub trait RelayDialer: Send + Sync {
    async fn dial(&self, host: &str, port: u16) -> Result<BoxedRelayStream>;
}

pub struct TlsRelayDialer {
    connector: TlsConnector,
}

impl TlsRelayDialer {
    /// `verify = false` accepts any relay certificate (development relays)
    pub fn new(verify: bool) -> Result<Self> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| ReachError::Relay(format!("TLS configuration: {}", e)))?;

        let config = if verify {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            builder.with_root_certificates(roots).with_no_client_auth()
        } else {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate))
                .with_no_client_auth()
        };

        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
        })
    }
}

#[async_trait]
impl RelayDialer for TlsRelayDialer {
    async fn dial(&self, host: &str, port: u16) -> Result<BoxedRelayStream> {
        let tcp = timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port)))
            .await
            .map_err(|_| ReachError::Relay(format!("connect to {}:{} timed out", host, port)))??;
        tcp.set_nodelay(true)?;

        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| ReachError::Relay(format!("invalid relay host {}: {}", host, e)))?;
        let tls = self
            .connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| ReachError::Relay(format!("TLS handshake with {}: {}", host, e)))?;

        debug!("Connected to relay edge {}:{}", host, port);
        Ok(Box::new(tls))
    }
}

#[derive(Debug)]
struct AcceptAnyCertificate;

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
