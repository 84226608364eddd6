//! HTTPS trust transport.
//!
//! Opens a mutual-TLS session to the peer with a verifier that accepts
//! exactly one certificate: the one whose SHA-256 fingerprint was
//! carried in the join token. The local certificate is presented as the
//! client certificate and the bearer secret goes in the request body:
//!
//! ```text
//! POST /1.0/certificates
//! {"type": "client", "name": <server_name>, "trust_token": <secret>}
//! ```

use std::sync::Arc;
use std::time::Duration;

use http::{Method, StatusCode};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use serde_json::json;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::{ClusterError, ClusterResult};
use crate::identity::{DEFAULT_PORT, split_host_port};
use crate::remote::BoxFuture;
use crate::tls::{Fingerprint, NodeCertificate, der_to_pem, parse_certificates, parse_private_key};
use crate::token::TokenSecret;
use crate::trust::{PeerEndpoint, TrustOutcome, TrustReceipt, TrustTransport};
use crate::wire::{self, Envelope, network, status_error};

/// Trust transport over mutual TLS with fingerprint pinning.
#[derive(Debug, Clone)]
pub struct HttpsTrustTransport {
    connect_timeout: Duration,
}

impl Default for HttpsTrustTransport {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl HttpsTrustTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    async fn post_certificate(
        &self,
        local: &NodeCertificate,
        peer: &PeerEndpoint,
        secret: &TokenSecret,
    ) -> ClusterResult<TrustReceipt> {
        let config = client_config(local, peer.fingerprint)?;
        let (host, port) = split_host_port(&peer.address, DEFAULT_PORT);
        let server_name = ServerName::try_from(host.clone())
            .map_err(|e| ClusterError::Network(format!("invalid peer host {host:?}: {e}")))?;

        let tcp = tokio::time::timeout(self.connect_timeout, TcpStream::connect((host.as_str(), port)))
            .await
            .map_err(|_| ClusterError::Timeout(self.connect_timeout))?
            .map_err(|e| ClusterError::Network(format!("{}: {e}", peer.address)))?;

        let tls = TlsConnector::from(Arc::new(config))
            .connect(server_name, tcp)
            .await
            .map_err(|e| classify_handshake_error(e, peer))?;

        let peer_certificate = tls
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|der| der_to_pem(der.as_ref()))
            .ok_or_else(|| ClusterError::AuthRejected("peer presented no certificate".to_string()))?;

        debug!(address = %peer.address, "tls session established");

        let body = json!({
            "type": "client",
            "name": peer.server_name,
            "trust_token": secret.expose(),
        });
        let body = serde_json::to_vec(&body).map_err(network)?;
        let reply = wire::send(
            tls,
            Method::POST,
            &peer.address,
            "/1.0/certificates",
            &[],
            Some(body),
        )
        .await?;

        let outcome = classify_reply(reply.status, &reply.body)?;
        Ok(TrustReceipt {
            outcome,
            peer_certificate,
        })
    }
}

impl TrustTransport for HttpsTrustTransport {
    fn establish<'a>(
        &'a self,
        local: &'a NodeCertificate,
        peer: &'a PeerEndpoint,
        secret: &'a TokenSecret,
    ) -> BoxFuture<'a, ClusterResult<TrustReceipt>> {
        Box::pin(self.post_certificate(local, peer, secret))
    }
}

/// Map the trust endpoint's reply onto an outcome.
///
/// Only 409 means the certificate is already trusted. Any other refusal
/// is an error whatever its message says.
fn classify_reply(status: StatusCode, body: &[u8]) -> ClusterResult<TrustOutcome> {
    if status.is_success() {
        return Ok(TrustOutcome::Added);
    }
    if status == StatusCode::CONFLICT {
        return Ok(TrustOutcome::AlreadyTrusted);
    }
    let envelope = Envelope::parse(body);
    let message = if envelope.error.is_empty() {
        status.to_string()
    } else {
        envelope.error
    };
    Err(status_error(status, message))
}

fn classify_handshake_error(e: std::io::Error, peer: &PeerEndpoint) -> ClusterError {
    let msg = e.to_string();
    if msg.contains("fingerprint") {
        ClusterError::AuthRejected(format!("{}: {msg}", peer.address))
    } else {
        ClusterError::Network(format!("tls handshake with {}: {msg}", peer.address))
    }
}

/// Client config that pins the server certificate and presents `local`.
fn client_config(local: &NodeCertificate, pinned: Fingerprint) -> ClusterResult<ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let certs = parse_certificates(&local.cert_pem)?;
    let key = parse_private_key(&local.key_pem)?;

    ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| ClusterError::Certificate(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PinnedCertificate {
            expected: pinned,
            provider,
        }))
        .with_client_auth_cert(certs, key)
        .map_err(|e| ClusterError::Certificate(e.to_string()))
}

/// Accepts exactly the server certificate with the expected fingerprint.
///
/// Handshake signatures are still verified with the provider's
/// algorithms; only chain building and hostname checks are replaced.
#[derive(Debug)]
struct PinnedCertificate {
    expected: Fingerprint,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for PinnedCertificate {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let actual = Fingerprint::of_der(end_entity.as_ref());
        if actual == self.expected {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General(format!(
                "certificate fingerprint mismatch: expected {}, got {actual}",
                self.expected
            )))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
