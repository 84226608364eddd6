//! fleetgrid-cluster — cluster formation for fleetgrid compute nodes.
//!
//! A node either bootstraps a fresh cluster or joins an existing one with
//! a single-use join token. The token carries the address of an existing
//! member, the SHA-256 fingerprint of the cluster certificate and a
//! one-time bearer secret.
//!
//! # Architecture
//!
//! ```text
//! ClusterCoordinator
//!   ├── bootstrap()  local init → PUT /1.0/cluster (If-Match) → wait
//!   ├── join(token)  decode → local init → TrustNegotiator → PUT /1.0/cluster → wait
//!   └── issue_token  POST /1.0/cluster/members → wait → JoinToken
//!
//! TrustNegotiator
//!   └── TrustStore ── TrustTransport (HTTPS, fingerprint-pinned mTLS)
//!         └── StateStore (certificates, trusted peers, redemption ledger)
//!
//! RemoteOperationClient ── AdminClient (HTTP/1 over unix socket or TCP)
//! LocalInitializer      ── CommandInitializer (`<daemon> init --preseed`)
//! ```

pub mod admin;
pub mod coordinator;
pub mod error;
pub mod identity;
pub mod negotiator;
pub mod preseed;
pub mod remote;
pub mod tls;
pub mod token;
pub mod transport;
pub mod trust;
mod wire;

pub use admin::{AdminClient, AdminEndpoint};
pub use coordinator::{ClusterCoordinator, CoordinatorConfig, CoordinatorState};
pub use error::{ClusterError, ClusterResult, Stage, StageError};
pub use identity::{NodeIdentity, ServiceDescriptor, ServiceKind};
pub use negotiator::{NegotiatedTrust, TrustNegotiator};
pub use preseed::{CommandInitializer, LocalInitializer, Preseed};
pub use remote::{
    AsyncOperation, BoxFuture, ClusterMembershipConfig, ClusterState, Etag, OperationStatus,
    RemoteOperationClient, await_operation,
};
pub use tls::{Fingerprint, NodeCertificate};
pub use token::{JoinToken, TokenSecret};
pub use transport::HttpsTrustTransport;
pub use trust::{PeerEndpoint, TrustOutcome, TrustReceipt, TrustStore, TrustTransport};
