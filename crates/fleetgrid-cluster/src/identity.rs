//! Node identity and the service descriptor it exposes.

use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::tls::NodeCertificate;

/// Default HTTPS port of the compute daemon.
pub const DEFAULT_PORT: u16 = 8443;

/// Who this node is. Built once at process start and passed in explicitly.
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    /// Server name, unique within a cluster.
    pub name: String,
    /// Advertised host (IP or DNS name, without port).
    pub address: String,
    /// Advertised port.
    pub port: u16,
    /// Certificate this node presents to peers.
    pub certificate: NodeCertificate,
}

impl NodeIdentity {
    /// `host:port` form of the advertised address.
    pub fn network_address(&self) -> String {
        canonical_address(&self.address, self.port)
    }

    /// Externally visible descriptor of this node's service.
    pub fn descriptor(&self) -> ServiceDescriptor {
        ServiceDescriptor::new(ServiceKind::Compute, &self.name, &self.address, self.port)
    }
}

/// Kind of service a descriptor refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    Compute,
}

/// Immutable, externally visible identity of a service instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    kind: ServiceKind,
    name: String,
    address: String,
    port: u16,
}

impl ServiceDescriptor {
    pub fn new(kind: ServiceKind, name: &str, address: &str, port: u16) -> Self {
        Self {
            kind,
            name: name.to_string(),
            address: address.to_string(),
            port,
        }
    }

    pub fn kind(&self) -> ServiceKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

/// Normalise `host` + `port` into a `host:port` string.
///
/// A host that already carries a port is returned as-is. IPv6 literals
/// are bracketed. An empty host means all interfaces.
pub fn canonical_address(host: &str, port: u16) -> String {
    let host = host.trim();
    if let Ok(sock) = host.parse::<SocketAddr>() {
        return sock.to_string();
    }
    match host.parse::<IpAddr>() {
        Ok(ip) => SocketAddr::new(ip, port).to_string(),
        Err(_) if host.is_empty() => format!("0.0.0.0:{port}"),
        Err(_) if has_port(host) => host.to_string(),
        Err(_) => format!("{host}:{port}"),
    }
}

/// Split `host:port` into its parts, defaulting the port when absent.
pub fn split_host_port(address: &str, default_port: u16) -> (String, u16) {
    if let Ok(sock) = address.parse::<SocketAddr>() {
        return (sock.ip().to_string(), sock.port());
    }
    if let Some((host, port)) = address.rsplit_once(':') {
        if let Ok(port) = port.parse::<u16>() {
            return (host.trim_matches(['[', ']']).to_string(), port);
        }
    }
    (address.trim_matches(['[', ']']).to_string(), default_port)
}

fn has_port(host: &str) -> bool {
    host.rsplit_once(':')
        .is_some_and(|(h, p)| !h.contains(':') && p.parse::<u16>().is_ok())
}
