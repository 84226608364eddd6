//! Trust store: this node's certificate and the peers it accepts.
//!
//! Local material lives in the [`StateStore`] blob table; the network
//! half of the trust handshake is delegated to a [`TrustTransport`].

use std::sync::Arc;

use fleetgrid_state::{StateStore, TrustedPeer, blob};
use tracing::{debug, info, warn};

use crate::error::{ClusterError, ClusterResult};
use crate::identity::{NodeIdentity, canonical_address};
use crate::remote::BoxFuture;
use crate::tls::{Fingerprint, NodeCertificate, generate_node_cert};
use crate::token::{TokenSecret, epoch_secs};

/// A peer to establish trust with, pinned by certificate fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEndpoint {
    /// `host:port` of the peer.
    pub address: String,
    pub fingerprint: Fingerprint,
    /// Server name the bearer secret was issued for.
    pub server_name: String,
}

/// Result of presenting a certificate to a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustOutcome {
    /// The certificate was newly added to the peer's trusted set.
    Added,
    /// The certificate was already trusted; nothing changed.
    AlreadyTrusted,
}

/// What a successful handshake yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustReceipt {
    pub outcome: TrustOutcome,
    /// PEM certificate the peer presented during the handshake.
    pub peer_certificate: String,
}

/// Network half of the trust handshake.
///
/// Implementations connect to `peer`, refuse to talk to anything whose
/// certificate does not match `peer.fingerprint`, present `local` as the
/// client certificate and the secret as bearer credential.
pub trait TrustTransport: Send + Sync {
    fn establish<'a>(
        &'a self,
        local: &'a NodeCertificate,
        peer: &'a PeerEndpoint,
        secret: &'a TokenSecret,
    ) -> BoxFuture<'a, ClusterResult<TrustReceipt>>;
}

/// This node's identity certificate and its trusted peers.
#[derive(Clone)]
pub struct TrustStore {
    state: StateStore,
    transport: Arc<dyn TrustTransport>,
}

impl TrustStore {
    pub fn new(state: StateStore, transport: Arc<dyn TrustTransport>) -> Self {
        Self { state, transport }
    }

    /// Load this node's certificate and key.
    pub fn load_local_certificate(&self) -> ClusterResult<NodeCertificate> {
        let cert = self.state.get_blob(blob::SERVER_CERT)?;
        let key = self.state.get_blob(blob::SERVER_KEY)?;
        let (Some(cert), Some(key)) = (cert, key) else {
            return Err(ClusterError::CertificateNotFound);
        };
        let cert_pem = String::from_utf8(cert)
            .map_err(|_| ClusterError::Certificate("server.crt is not UTF-8".to_string()))?;
        let key_pem = String::from_utf8(key)
            .map_err(|_| ClusterError::Certificate("server.key is not UTF-8".to_string()))?;
        Ok(NodeCertificate { cert_pem, key_pem })
    }

    /// Persist this node's certificate and key.
    pub fn store_local_certificate(&self, cert: &NodeCertificate) -> ClusterResult<()> {
        self.state.put_blob(blob::SERVER_CERT, cert.cert_pem.as_bytes())?;
        self.state.put_blob(blob::SERVER_KEY, cert.key_pem.as_bytes())?;
        Ok(())
    }

    /// Build the node identity, generating a certificate on first start.
    pub fn load_or_create_identity(
        &self,
        name: &str,
        address: &str,
        port: u16,
    ) -> ClusterResult<NodeIdentity> {
        let certificate = match self.load_local_certificate() {
            Ok(cert) => cert,
            Err(ClusterError::CertificateNotFound) => {
                let cert = generate_node_cert(name, &[address.to_string()])?;
                self.store_local_certificate(&cert)?;
                cert
            }
            Err(e) => return Err(e),
        };
        let fingerprint = certificate.fingerprint()?;
        info!(%name, %address, port, %fingerprint, "node identity loaded");
        Ok(NodeIdentity {
            name: name.to_string(),
            address: address.to_string(),
            port,
            certificate,
        })
    }

    /// Ask `peer` to add `local` to its trusted set, presenting `secret`.
    ///
    /// Local state is not touched. Repeating the call with a still-valid
    /// secret yields [`TrustOutcome::AlreadyTrusted`].
    pub async fn establish_trust(
        &self,
        local: &NodeCertificate,
        peer: &PeerEndpoint,
        secret: &TokenSecret,
    ) -> ClusterResult<TrustReceipt> {
        debug!(address = %peer.address, fingerprint = %peer.fingerprint, "establishing trust");
        match self.transport.establish(local, peer, secret).await {
            Ok(receipt) => {
                info!(
                    address = %peer.address,
                    server_name = %peer.server_name,
                    outcome = ?receipt.outcome,
                    "trust established"
                );
                Ok(receipt)
            }
            Err(e) => {
                warn!(address = %peer.address, error = %e, "trust handshake failed");
                Err(e)
            }
        }
    }

    /// Add a peer certificate to the local trusted set.
    pub fn accept_peer(
        &self,
        name: &str,
        address: &str,
        certificate_pem: &str,
    ) -> ClusterResult<TrustOutcome> {
        let fingerprint = Fingerprint::from_pem(certificate_pem)?;
        let peer = TrustedPeer {
            fingerprint: fingerprint.to_hex(),
            name: name.to_string(),
            address: if address.is_empty() {
                String::new()
            } else {
                canonical_address(address, crate::identity::DEFAULT_PORT)
            },
            certificate: certificate_pem.to_string(),
            added_at: epoch_secs(),
        };
        if self.state.insert_trusted_peer(&peer)? {
            info!(%name, %fingerprint, "peer certificate trusted");
            Ok(TrustOutcome::Added)
        } else {
            debug!(%name, %fingerprint, "peer certificate already trusted");
            Ok(TrustOutcome::AlreadyTrusted)
        }
    }

    pub fn is_trusted(&self, fingerprint: &Fingerprint) -> ClusterResult<bool> {
        Ok(self.state.get_trusted_peer(&fingerprint.to_hex())?.is_some())
    }

    pub fn trusted_peers(&self) -> ClusterResult<Vec<TrustedPeer>> {
        Ok(self.state.list_trusted_peers()?)
    }

    /// Remove a peer from the trusted set. Returns true if it was present.
    pub fn revoke(&self, fingerprint: &Fingerprint) -> ClusterResult<bool> {
        let removed = self.state.delete_trusted_peer(&fingerprint.to_hex())?;
        if removed {
            info!(%fingerprint, "peer certificate revoked");
        }
        Ok(removed)
    }

    /// Underlying state store, including the token redemption ledger.
    pub fn state(&self) -> &StateStore {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    use crate::tls::generate_node_cert;

    /// Peer side of the handshake: a trust store plus the secrets it honours.
    struct LoopbackPeer {
        cluster_cert: NodeCertificate,
        trust: TrustStore,
        secrets: Mutex<HashSet<String>>,
    }

    impl TrustTransport for LoopbackPeer {
        fn establish<'a>(
            &'a self,
            local: &'a NodeCertificate,
            peer: &'a PeerEndpoint,
            secret: &'a TokenSecret,
        ) -> BoxFuture<'a, ClusterResult<TrustReceipt>> {
            Box::pin(async move {
                if !self.secrets.lock().unwrap().contains(secret.expose()) {
                    return Err(ClusterError::AuthRejected("unknown secret".to_string()));
                }
                let outcome =
                    self.trust
                        .accept_peer(&peer.server_name, "", &local.cert_pem)?;
                Ok(TrustReceipt {
                    outcome,
                    peer_certificate: self.cluster_cert.cert_pem.clone(),
                })
            })
        }
    }

    struct NoNetwork;

    impl TrustTransport for NoNetwork {
        fn establish<'a>(
            &'a self,
            _local: &'a NodeCertificate,
            _peer: &'a PeerEndpoint,
            _secret: &'a TokenSecret,
        ) -> BoxFuture<'a, ClusterResult<TrustReceipt>> {
            Box::pin(async { Err(ClusterError::Network("unreachable".to_string())) })
        }
    }

    fn local_store() -> TrustStore {
        TrustStore::new(StateStore::open_in_memory().unwrap(), Arc::new(NoNetwork))
    }

    fn loopback(secret: &str) -> Arc<LoopbackPeer> {
        Arc::new(LoopbackPeer {
            cluster_cert: generate_node_cert("node1", &["10.0.0.1".to_string()]).unwrap(),
            trust: local_store(),
            secrets: Mutex::new(HashSet::from([secret.to_string()])),
        })
    }

    #[test]
    fn missing_certificate_is_not_found() {
        let store = local_store();
        assert!(matches!(
            store.load_local_certificate(),
            Err(ClusterError::CertificateNotFound)
        ));
    }

    #[test]
    fn identity_is_created_once() {
        let store = local_store();
        let first = store.load_or_create_identity("node1", "10.0.0.5", 8443).unwrap();
        let second = store.load_or_create_identity("node1", "10.0.0.5", 8443).unwrap();
        assert_eq!(first.certificate, second.certificate);
        assert_eq!(store.load_local_certificate().unwrap(), first.certificate);
    }

    #[test]
    fn accept_peer_is_idempotent() {
        let store = local_store();
        let cert = generate_node_cert("node2", &[]).unwrap();

        assert_eq!(
            store.accept_peer("node2", "10.0.0.2", &cert.cert_pem).unwrap(),
            TrustOutcome::Added
        );
        assert_eq!(
            store.accept_peer("node2", "10.0.0.2", &cert.cert_pem).unwrap(),
            TrustOutcome::AlreadyTrusted
        );

        let peers = store.trusted_peers().unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].address, "10.0.0.2:8443");
        assert!(store.is_trusted(&cert.fingerprint().unwrap()).unwrap());
    }

    #[test]
    fn revoke_removes_peer() {
        let store = local_store();
        let cert = generate_node_cert("node2", &[]).unwrap();
        let fp = cert.fingerprint().unwrap();
        store.accept_peer("node2", "", &cert.cert_pem).unwrap();

        assert!(store.revoke(&fp).unwrap());
        assert!(!store.is_trusted(&fp).unwrap());
        assert!(!store.revoke(&fp).unwrap());
    }

    #[tokio::test]
    async fn establish_trust_twice_is_stable() {
        let peer_side = loopback("s3cret");
        let joiner = TrustStore::new(StateStore::open_in_memory().unwrap(), peer_side.clone());
        let identity = joiner.load_or_create_identity("node2", "10.0.0.2", 8443).unwrap();

        let endpoint = PeerEndpoint {
            address: "10.0.0.1:8443".to_string(),
            fingerprint: peer_side.cluster_cert.fingerprint().unwrap(),
            server_name: "node2".to_string(),
        };
        let secret = TokenSecret::new("s3cret");

        let first = joiner
            .establish_trust(&identity.certificate, &endpoint, &secret)
            .await
            .unwrap();
        let second = joiner
            .establish_trust(&identity.certificate, &endpoint, &secret)
            .await
            .unwrap();

        assert_eq!(first.outcome, TrustOutcome::Added);
        assert_eq!(second.outcome, TrustOutcome::AlreadyTrusted);
        assert_eq!(first.peer_certificate, second.peer_certificate);

        let trusted = peer_side.trust.trusted_peers().unwrap();
        assert_eq!(trusted.len(), 1);
        assert_eq!(
            trusted[0].fingerprint,
            identity.certificate.fingerprint().unwrap().to_hex()
        );
        // The joining side records nothing during the handshake.
        assert!(joiner.trusted_peers().unwrap().is_empty());
    }

    #[tokio::test]
    async fn wrong_secret_is_rejected() {
        let peer_side = loopback("s3cret");
        let joiner = TrustStore::new(StateStore::open_in_memory().unwrap(), peer_side.clone());
        let identity = joiner.load_or_create_identity("node2", "10.0.0.2", 8443).unwrap();
        let endpoint = PeerEndpoint {
            address: "10.0.0.1:8443".to_string(),
            fingerprint: peer_side.cluster_cert.fingerprint().unwrap(),
            server_name: "node2".to_string(),
        };

        let err = joiner
            .establish_trust(&identity.certificate, &endpoint, &TokenSecret::new("guess"))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::AuthRejected(_)));
        assert!(peer_side.trust.trusted_peers().unwrap().is_empty());
    }
}
