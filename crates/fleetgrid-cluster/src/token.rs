//! Join token codec.
//!
//! A join token bundles everything a new node needs to reach and trust
//! a cluster: the address of an existing member, the fingerprint of the
//! cluster certificate, the server name it was issued for and a one-time
//! bearer secret.
//!
//! Token format: base64(json{server_name, cluster_name, cluster_address,
//! fingerprint, secret, expires_at})

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{ClusterError, ClusterResult};
use crate::tls::Fingerprint;

/// Opaque one-time bearer value carried by a token.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenSecret(String);

impl TokenSecret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// 32 random bytes, hex encoded.
    pub fn generate() -> ClusterResult<Self> {
        let mut buf = [0u8; 32];
        getrandom::getrandom(&mut buf)
            .map_err(|e| ClusterError::Io(std::io::Error::other(e.to_string())))?;
        Ok(Self(hex::encode(buf)))
    }

    /// The raw secret, for presenting to the peer.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Lowercase hex SHA-256 of the secret. Safe to persist and log.
    pub fn digest(&self) -> String {
        hex::encode(Sha256::digest(self.0.as_bytes()))
    }
}

impl fmt::Debug for TokenSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TokenSecret(<redacted>)")
    }
}

/// A decoded join token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JoinToken {
    /// Server name the token was issued for.
    pub server_name: String,
    /// Display name of the cluster.
    pub cluster_name: String,
    /// `host:port` of a member that will accept the trust handshake.
    pub cluster_address: String,
    /// Fingerprint of the cluster certificate.
    pub fingerprint: Fingerprint,
    pub secret: TokenSecret,
    /// Unix seconds after which the token is no longer accepted.
    pub expires_at: Option<u64>,
}

impl JoinToken {
    /// Mint a token with a fresh random secret.
    pub fn mint(
        server_name: &str,
        cluster_name: &str,
        cluster_address: &str,
        fingerprint: Fingerprint,
        ttl: Option<Duration>,
    ) -> ClusterResult<Self> {
        Ok(Self {
            server_name: server_name.to_string(),
            cluster_name: cluster_name.to_string(),
            cluster_address: cluster_address.to_string(),
            fingerprint,
            secret: TokenSecret::generate()?,
            expires_at: ttl.map(|ttl| epoch_secs() + ttl.as_secs()),
        })
    }

    /// Whether the token has expired at `now` (unix seconds).
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    /// Fail with [`ClusterError::TokenExpired`] if the token is stale.
    pub fn ensure_fresh(&self, now: u64) -> ClusterResult<()> {
        match self.expires_at {
            Some(expires_at) if self.is_expired(now) => {
                Err(ClusterError::TokenExpired { expires_at })
            }
            _ => Ok(()),
        }
    }

    /// Digest identifying this token in the redemption ledger.
    pub fn secret_digest(&self) -> String {
        self.secret.digest()
    }

    /// Convert the result payload of a completed create-member operation.
    ///
    /// Accepts either `cluster_address` or an `addresses` list, in which
    /// case the first entry is used.
    pub fn from_operation_metadata(metadata: &serde_json::Value) -> ClusterResult<Self> {
        let wire: WireToken = serde_json::from_value(metadata.clone())
            .map_err(|e| ClusterError::MalformedToken(format!("operation metadata: {e}")))?;
        wire.validate()
    }

    pub fn encode(&self) -> String {
        encode(self)
    }

    pub fn decode(text: &str) -> ClusterResult<Self> {
        decode(text)
    }
}

impl fmt::Display for JoinToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Encode a token into its transport-safe text form.
pub fn encode(token: &JoinToken) -> String {
    // Serializing plain strings and integers cannot fail.
    let json = serde_json::to_vec(token).unwrap_or_default();
    STANDARD.encode(json)
}

/// Decode a token from its text form.
pub fn decode(text: &str) -> ClusterResult<JoinToken> {
    let text = text.trim();
    if text.is_empty() {
        return Err(ClusterError::MalformedToken("empty token".to_string()));
    }
    let json = STANDARD
        .decode(text)
        .map_err(|e| ClusterError::MalformedToken(format!("invalid base64: {e}")))?;
    let wire: WireToken = serde_json::from_slice(&json)
        .map_err(|e| ClusterError::MalformedToken(format!("invalid token payload: {e}")))?;
    wire.validate()
}

/// Lenient wire form; every field is checked in [`WireToken::validate`].
#[derive(Deserialize)]
struct WireToken {
    #[serde(default)]
    server_name: String,
    #[serde(default)]
    cluster_name: String,
    #[serde(default)]
    cluster_address: String,
    #[serde(default)]
    addresses: Vec<String>,
    #[serde(default)]
    fingerprint: String,
    #[serde(default)]
    secret: String,
    #[serde(default)]
    expires_at: Option<u64>,
}

impl WireToken {
    fn validate(self) -> ClusterResult<JoinToken> {
        let cluster_address = if self.cluster_address.is_empty() {
            self.addresses.into_iter().find(|a| !a.is_empty()).unwrap_or_default()
        } else {
            self.cluster_address
        };
        if cluster_address.is_empty() {
            return Err(missing("cluster address"));
        }
        if self.fingerprint.is_empty() {
            return Err(missing("cluster certificate fingerprint"));
        }
        if self.secret.is_empty() {
            return Err(missing("secret"));
        }
        if self.server_name.is_empty() {
            return Err(missing("server name"));
        }
        let fingerprint = self
            .fingerprint
            .parse::<Fingerprint>()
            .map_err(ClusterError::MalformedToken)?;

        Ok(JoinToken {
            server_name: self.server_name,
            cluster_name: self.cluster_name,
            cluster_address,
            fingerprint,
            secret: TokenSecret(self.secret),
            expires_at: self.expires_at,
        })
    }
}

fn missing(field: &str) -> ClusterError {
    ClusterError::MalformedToken(format!("missing {field}"))
}

pub(crate) fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> JoinToken {
        JoinToken {
            server_name: "node2".to_string(),
            cluster_name: "lab".to_string(),
            cluster_address: "10.0.0.1:8443".to_string(),
            fingerprint: Fingerprint::of_der(b"cluster-cert"),
            secret: TokenSecret::new("s3cret"),
            expires_at: Some(1_900_000_000),
        }
    }

    fn encode_json(value: serde_json::Value) -> String {
        STANDARD.encode(serde_json::to_vec(&value).unwrap())
    }

    #[test]
    fn decode_inverts_encode() {
        let token = sample();
        assert_eq!(decode(&encode(&token)).unwrap(), token);

        let no_expiry = JoinToken {
            expires_at: None,
            cluster_name: String::new(),
            ..sample()
        };
        assert_eq!(decode(&no_expiry.encode()).unwrap(), no_expiry);
    }

    #[test]
    fn decode_tolerates_surrounding_whitespace() {
        let token = sample();
        let text = format!("  {}\n", token.encode());
        assert_eq!(JoinToken::decode(&text).unwrap(), token);
    }

    #[test]
    fn missing_cluster_address_is_malformed() {
        let fp = Fingerprint::of_der(b"x").to_hex();
        let text = encode_json(serde_json::json!({
            "server_name": "node2",
            "fingerprint": fp,
            "secret": "s",
        }));
        let err = decode(&text).unwrap_err();
        assert!(matches!(err, ClusterError::MalformedToken(ref m) if m.contains("cluster address")));
    }

    #[test]
    fn missing_fingerprint_is_malformed() {
        let text = encode_json(serde_json::json!({
            "server_name": "node2",
            "cluster_address": "10.0.0.1:8443",
            "secret": "s",
        }));
        let err = decode(&text).unwrap_err();
        assert!(matches!(err, ClusterError::MalformedToken(ref m) if m.contains("fingerprint")));
    }

    #[test]
    fn bad_fingerprint_is_malformed() {
        let text = encode_json(serde_json::json!({
            "server_name": "node2",
            "cluster_address": "10.0.0.1:8443",
            "fingerprint": "abcd",
            "secret": "s",
        }));
        assert!(matches!(decode(&text), Err(ClusterError::MalformedToken(_))));
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(decode(""), Err(ClusterError::MalformedToken(_))));
        assert!(matches!(decode("!!!not base64"), Err(ClusterError::MalformedToken(_))));
        let not_json = STANDARD.encode(b"plain text");
        assert!(matches!(decode(&not_json), Err(ClusterError::MalformedToken(_))));
    }

    #[test]
    fn metadata_with_address_list() {
        let fp = Fingerprint::of_der(b"x");
        let meta = serde_json::json!({
            "server_name": "node2",
            "addresses": ["10.0.0.1:8443", "10.0.0.2:8443"],
            "fingerprint": fp.to_hex(),
            "secret": "abc",
            "expires_at": 42,
        });
        let token = JoinToken::from_operation_metadata(&meta).unwrap();
        assert_eq!(token.cluster_address, "10.0.0.1:8443");
        assert_eq!(token.fingerprint, fp);
        assert_eq!(token.expires_at, Some(42));
    }

    #[test]
    fn expiry() {
        let token = sample();
        assert!(!token.is_expired(1_800_000_000));
        assert!(token.is_expired(1_900_000_000));
        assert!(matches!(
            token.ensure_fresh(1_900_000_001),
            Err(ClusterError::TokenExpired { expires_at: 1_900_000_000 })
        ));

        let forever = JoinToken { expires_at: None, ..sample() };
        assert!(forever.ensure_fresh(u64::MAX).is_ok());
    }

    #[test]
    fn minted_tokens_have_unique_secrets() {
        let fp = Fingerprint::of_der(b"x");
        let a = JoinToken::mint("node2", "lab", "10.0.0.1:8443", fp, None).unwrap();
        let b = JoinToken::mint("node2", "lab", "10.0.0.1:8443", fp, None).unwrap();
        assert_ne!(a.secret, b.secret);
        assert_eq!(a.secret.expose().len(), 64);
    }

    #[test]
    fn secret_is_redacted_in_debug() {
        let dbg = format!("{:?}", sample());
        assert!(!dbg.contains("s3cret"));
    }
}
