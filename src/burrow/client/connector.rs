use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use sha2::{Digest, Sha256};
use tokio_rustls::TlsConnector;

use crate::burrow::error::{ErrorCode, SessionError, SessionResult};
use crate::burrow::protocol::{self, ClientRequest};
use crate::burrow::tunnel::channel::BoxedStream;

/// Accepts the server certificate by SHA-256 fingerprint instead of a CA
/// chain; circumvention servers run self-signed certificates pinned in the
/// token. An empty fingerprint trusts any certificate.
#[derive(Debug)]
struct FingerprintVerifier {
    fingerprint: Vec<u8>,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for FingerprintVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if !self.fingerprint.is_empty() {
            let hash = Sha256::digest(end_entity.as_ref());
            if hash.as_slice() != self.fingerprint.as_slice() {
                return Err(rustls::Error::InvalidCertificate(
                    rustls::CertificateError::ApplicationVerificationFailure,
                ));
            }
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[derive(Clone)]
pub struct Connector {
    host_name: String,
    certificate_hash: Vec<u8>,
    connect_timeout: Duration,
}

impl Connector {
    pub fn new(host_name: String, certificate_hash: Vec<u8>, connect_timeout: Duration) -> Self {
        Self {
            host_name,
            certificate_hash,
            connect_timeout,
        }
    }

    /// Opens a fresh TLS stream to the server endpoint.
    pub async fn connect(&self, end_point: SocketAddr) -> SessionResult<BoxedStream> {
        let provider = CryptoProvider::get_default()
            .cloned()
            .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()));

        let verifier = Arc::new(FingerprintVerifier {
            fingerprint: self.certificate_hash.clone(),
            provider,
        });
        let config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));

        let tcp = tokio::time::timeout(
            self.connect_timeout,
            tokio::net::TcpStream::connect(end_point),
        )
        .await
        .map_err(|_| SessionError::general(format!("connect to {end_point} timed out")))?
        .map_err(SessionError::from)?;
        tcp.set_nodelay(true)?;

        let server_name = ServerName::try_from(self.host_name.clone())
            .or_else(|_| ServerName::try_from(end_point.ip().to_string()))
            .map_err(|_| SessionError::general("invalid server name"))?;

        let tls = tokio::time::timeout(self.connect_timeout, connector.connect(server_name, tcp))
            .await
            .map_err(|_| SessionError::general("tls handshake timed out"))?
            .map_err(SessionError::from)?;
        Ok(Box::new(tls))
    }

    /// One request/response exchange; the stream is returned for adoption as
    /// a channel.
    pub async fn request<T: serde::de::DeserializeOwned>(
        &self,
        end_point: SocketAddr,
        request: &ClientRequest,
    ) -> SessionResult<(T, BoxedStream)> {
        let mut stream = self.connect(end_point).await?;
        protocol::write_request(&mut stream, request)
            .await
            .map_err(|e| SessionError::general(e.to_string()))?;
        let response: T = protocol::read_frame(&mut stream)
            .await
            .map_err(|e| SessionError::new(ErrorCode::UnsupportedServer, e.to_string()))?;
        Ok((response, stream))
    }
}
