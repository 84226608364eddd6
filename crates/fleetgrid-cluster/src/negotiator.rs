//! Trust negotiation for a joining node.
//!
//! The token's secret is a one-time bearer credential: it is presented
//! exactly once to the member named in the token, over a session pinned
//! to the token's certificate fingerprint. Redemption is recorded locally
//! once the join has completed, so a replayed token is refused before any
//! network traffic while a join that failed part way can still retry with
//! the same token.

use fleetgrid_state::RedeemedToken;
use tracing::{info, warn};

use crate::error::{ClusterError, ClusterResult};
use crate::identity::NodeIdentity;
use crate::tls::Fingerprint;
use crate::token::{JoinToken, epoch_secs};
use crate::trust::{PeerEndpoint, TrustOutcome, TrustStore};

/// Outcome of a successful negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedTrust {
    /// Cluster certificate PEM, verified against the token fingerprint.
    pub cluster_certificate: String,
    pub outcome: TrustOutcome,
}

/// Runs the trust handshake on behalf of a joining node.
#[derive(Clone)]
pub struct TrustNegotiator {
    trust: TrustStore,
}

impl TrustNegotiator {
    pub fn new(trust: TrustStore) -> Self {
        Self { trust }
    }

    pub fn trust_store(&self) -> &TrustStore {
        &self.trust
    }

    /// Get this node into the trusted set of the cluster behind `token`.
    ///
    /// Nothing is recorded locally. Presenting the same secret again
    /// before [`TrustNegotiator::redeem`] is safe; the peer answers
    /// [`TrustOutcome::AlreadyTrusted`].
    pub async fn negotiate_join(
        &self,
        token: &JoinToken,
        identity: &NodeIdentity,
    ) -> ClusterResult<NegotiatedTrust> {
        token.ensure_fresh(epoch_secs())?;

        let digest = token.secret_digest();
        if self.trust.state().get_redemption(&digest)?.is_some() {
            warn!(cluster = %token.cluster_address, "join token was already redeemed");
            return Err(ClusterError::TokenRedeemed);
        }

        let local = self.trust.load_local_certificate()?;
        let peer = PeerEndpoint {
            address: token.cluster_address.clone(),
            fingerprint: token.fingerprint,
            server_name: identity.name.clone(),
        };
        let receipt = self.trust.establish_trust(&local, &peer, &token.secret).await?;

        let presented = Fingerprint::from_pem(&receipt.peer_certificate)?;
        if presented != token.fingerprint {
            return Err(ClusterError::FingerprintMismatch {
                expected: token.fingerprint.to_hex(),
                actual: presented.to_hex(),
            });
        }

        info!(
            cluster = %token.cluster_name,
            address = %token.cluster_address,
            outcome = ?receipt.outcome,
            "trust negotiated"
        );

        Ok(NegotiatedTrust {
            cluster_certificate: receipt.peer_certificate,
            outcome: receipt.outcome,
        })
    }

    /// Mark `token` as used. Fails with [`ClusterError::TokenRedeemed`] if
    /// another join already recorded it.
    pub fn redeem(&self, token: &JoinToken) -> ClusterResult<()> {
        let recorded = self.trust.state().record_redemption(&RedeemedToken {
            digest: token.secret_digest(),
            server_name: token.server_name.clone(),
            cluster_address: token.cluster_address.clone(),
            redeemed_at: epoch_secs(),
        })?;
        if !recorded {
            warn!(cluster = %token.cluster_address, "join token was redeemed concurrently");
            return Err(ClusterError::TokenRedeemed);
        }
        Ok(())
    }
}
