//! Records persisted by the fleetgrid state store.

use serde::{Deserialize, Serialize};

/// Well-known blob names.
pub mod blob {
    /// PEM certificate identifying this node.
    pub const SERVER_CERT: &str = "server.crt";
    /// PEM private key matching [`SERVER_CERT`].
    pub const SERVER_KEY: &str = "server.key";
}

/// A peer certificate this node accepts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrustedPeer {
    /// Lowercase hex SHA-256 of the certificate DER.
    pub fingerprint: String,
    /// Server name the peer is known by.
    pub name: String,
    /// host:port the peer was reached at (empty when unknown).
    pub address: String,
    /// PEM-encoded certificate.
    pub certificate: String,
    /// Unix timestamp (seconds) when the peer was added.
    pub added_at: u64,
}

/// Ledger entry for a join token this node has consumed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RedeemedToken {
    /// Lowercase hex SHA-256 of the token secret. The secret itself is never stored.
    pub digest: String,
    /// Server name the token was issued for.
    pub server_name: String,
    /// Cluster address the token pointed at.
    pub cluster_address: String,
    /// Unix timestamp (seconds) of redemption.
    pub redeemed_at: u64,
}
