//! Node certificates and fingerprints.
//!
//! Every node identifies itself with a self-signed certificate. Peers
//! are pinned by the SHA-256 fingerprint of their certificate DER rather
//! than through a CA chain.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::error::{ClusterError, ClusterResult};

/// A PEM certificate and its private key.
#[derive(Clone, PartialEq, Eq)]
pub struct NodeCertificate {
    /// PEM-encoded certificate.
    pub cert_pem: String,
    /// PEM-encoded private key.
    pub key_pem: String,
}

impl NodeCertificate {
    /// Fingerprint of the certificate.
    pub fn fingerprint(&self) -> ClusterResult<Fingerprint> {
        Fingerprint::from_pem(&self.cert_pem)
    }
}

impl fmt::Debug for NodeCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeCertificate")
            .field("cert_pem", &self.cert_pem)
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

/// SHA-256 digest of a certificate's DER encoding.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Fingerprint of raw DER bytes.
    pub fn of_der(der: &[u8]) -> Self {
        Self(Sha256::digest(der).into())
    }

    /// Fingerprint of the first certificate in a PEM document.
    pub fn from_pem(pem: &str) -> ClusterResult<Self> {
        let certs = parse_certificates(pem)?;
        let first = certs
            .first()
            .ok_or_else(|| ClusterError::Certificate("no certificate in PEM".to_string()))?;
        Ok(Self::of_der(first.as_ref()))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim()).map_err(|e| format!("invalid fingerprint hex: {e}"))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| format!("fingerprint must be 32 bytes, got {}", v.len()))?;
        Ok(Self(arr))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Generate a self-signed certificate for a node.
///
/// `addresses` become subject alternative names: IP SANs when they
/// parse as IPs, DNS SANs otherwise.
pub fn generate_node_cert(name: &str, addresses: &[String]) -> ClusterResult<NodeCertificate> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, "fleetgrid");
    dn.push(DnType::CommonName, name);
    params.distinguished_name = dn;

    for addr in addresses {
        if let Ok(ip) = addr.parse::<std::net::IpAddr>() {
            params.subject_alt_names.push(rcgen::SanType::IpAddress(ip));
        } else {
            let dns = addr
                .clone()
                .try_into()
                .map_err(|e: rcgen::Error| ClusterError::Certificate(e.to_string()))?;
            params.subject_alt_names.push(rcgen::SanType::DnsName(dns));
        }
    }

    // Valid for 10 years.
    params.not_after = rcgen::date_time_ymd(current_year() + 10, 1, 1);

    let key_pair = KeyPair::generate().map_err(|e| ClusterError::Certificate(e.to_string()))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| ClusterError::Certificate(e.to_string()))?;

    info!(%name, sans = addresses.len(), "generated node certificate");

    Ok(NodeCertificate {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
    })
}

/// Parse every certificate in a PEM document.
pub fn parse_certificates(pem: &str) -> ClusterResult<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ClusterError::Certificate(format!("invalid certificate PEM: {e}")))?;
    if certs.is_empty() {
        return Err(ClusterError::Certificate("no certificate in PEM".to_string()));
    }
    Ok(certs)
}

/// Parse the first private key in a PEM document.
pub fn parse_private_key(pem: &str) -> ClusterResult<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(|e| ClusterError::Certificate(format!("invalid key PEM: {e}")))?
        .ok_or_else(|| ClusterError::Certificate("no private key in PEM".to_string()))
}

/// Encode a DER certificate as PEM.
pub fn der_to_pem(der: &[u8]) -> String {
    let encoded = STANDARD.encode(der);
    let mut pem = String::from("-----BEGIN CERTIFICATE-----\n");
    for chunk in encoded.as_bytes().chunks(64) {
        // base64 output is ASCII.
        pem.push_str(std::str::from_utf8(chunk).unwrap_or_default());
        pem.push('\n');
    }
    pem.push_str("-----END CERTIFICATE-----\n");
    pem
}

fn current_year() -> i32 {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    1970 + (secs / 31_556_952) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_node_cert_succeeds() {
        let pair = generate_node_cert(
            "node1",
            &["10.0.0.1".to_string(), "node1.fleet.local".to_string()],
        )
        .unwrap();

        assert!(pair.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(pair.key_pem.contains("BEGIN PRIVATE KEY"));
    }

    #[test]
    fn generated_certs_are_distinct() {
        let a = generate_node_cert("node1", &["10.0.0.1".to_string()]).unwrap();
        let b = generate_node_cert("node1", &["10.0.0.1".to_string()]).unwrap();
        assert_ne!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
    }

    #[test]
    fn fingerprint_is_stable_for_same_pem() {
        let pair = generate_node_cert("node1", &[]).unwrap();
        assert_eq!(
            Fingerprint::from_pem(&pair.cert_pem).unwrap(),
            Fingerprint::from_pem(&pair.cert_pem).unwrap()
        );
    }

    #[test]
    fn der_to_pem_round_trips_fingerprint() {
        let pair = generate_node_cert("node1", &[]).unwrap();
        let der = parse_certificates(&pair.cert_pem).unwrap().remove(0);
        let pem = der_to_pem(der.as_ref());
        assert_eq!(
            Fingerprint::from_pem(&pem).unwrap(),
            Fingerprint::of_der(der.as_ref())
        );
    }

    #[test]
    fn fingerprint_hex_parse() {
        let fp = Fingerprint::of_der(b"abc");
        let parsed: Fingerprint = fp.to_hex().parse().unwrap();
        assert_eq!(parsed, fp);
        assert!("zz".parse::<Fingerprint>().is_err());
        assert!("abcd".parse::<Fingerprint>().is_err());
    }

    #[test]
    fn private_key_parses() {
        let pair = generate_node_cert("node1", &[]).unwrap();
        assert!(parse_private_key(&pair.key_pem).is_ok());
        assert!(parse_private_key("garbage").is_err());
    }

    #[test]
    fn empty_pem_is_rejected() {
        assert!(matches!(
            Fingerprint::from_pem(""),
            Err(ClusterError::Certificate(_))
        ));
    }

    #[test]
    fn debug_redacts_key() {
        let pair = generate_node_cert("node1", &[]).unwrap();
        let dbg = format!("{pair:?}");
        assert!(!dbg.contains("PRIVATE KEY"));
    }
}
