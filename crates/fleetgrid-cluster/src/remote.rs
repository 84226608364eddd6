//! Remote operation client, the administrative surface of the cluster.
//!
//! Mutations return an [`AsyncOperation`] handle for a server-side task.
//! Callers resolve it with [`await_operation`], which suspends until the
//! task reaches a terminal state or the deadline passes.
//!
//! The trait is object-safe so the coordinator can be driven by the HTTP
//! [`AdminClient`](crate::admin::AdminClient) in production and by an
//! in-memory fake in tests.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ClusterError, ClusterResult};
use crate::identity::NodeIdentity;
use crate::token::JoinToken;

/// Boxed future alias for remote calls.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Entity tag of the last observed cluster state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Etag(String);

impl Etag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Etag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Clustering status as reported by the administrative service.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClusterState {
    #[serde(default)]
    pub server_name: String,
    #[serde(default)]
    pub enabled: bool,
}

/// Target membership state requested of the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMembershipConfig {
    pub server_name: String,
    pub enabled: bool,
    /// Existing member to join through (empty when bootstrapping).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster_address: String,
    /// PEM certificate of the cluster (empty when bootstrapping).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster_certificate: String,
    /// Address this node advertises to the cluster.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub server_address: String,
}

impl ClusterMembershipConfig {
    /// Enable clustering on this node as the first member.
    pub fn bootstrap(identity: &NodeIdentity) -> Self {
        Self {
            server_name: identity.name.clone(),
            enabled: true,
            cluster_address: String::new(),
            cluster_certificate: String::new(),
            server_address: String::new(),
        }
    }

    /// Join the cluster described by `token`, whose certificate has been verified.
    pub fn join(identity: &NodeIdentity, token: &JoinToken, cluster_certificate: &str) -> Self {
        Self {
            server_name: identity.name.clone(),
            enabled: true,
            cluster_address: token.cluster_address.clone(),
            cluster_certificate: cluster_certificate.to_string(),
            server_address: identity.network_address(),
        }
    }
}

/// Lifecycle of a server-side task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationStatus {
    Pending,
    Running,
    Success,
    Failed(String),
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed(_))
    }
}

/// Handle to a long-running remote task.
#[derive(Debug, Clone)]
pub struct AsyncOperation {
    pub id: String,
    pub status: OperationStatus,
    /// Result payload; meaningful once the task succeeded.
    pub metadata: serde_json::Value,
}

impl AsyncOperation {
    pub fn new(id: impl Into<String>, status: OperationStatus) -> Self {
        Self {
            id: id.into(),
            status,
            metadata: serde_json::Value::Null,
        }
    }
}

/// Capability set of the cluster's administrative service.
pub trait RemoteOperationClient: Send + Sync {
    /// Current clustering status and its entity tag.
    fn cluster_state(&self) -> BoxFuture<'_, ClusterResult<(ClusterState, Etag)>>;

    /// Request a membership change.
    ///
    /// `expected_version` makes the update conditional on the cluster
    /// state not having changed since it was read; `None` means no
    /// precondition.
    fn update_membership<'a>(
        &'a self,
        config: &'a ClusterMembershipConfig,
        expected_version: Option<&'a Etag>,
    ) -> BoxFuture<'a, ClusterResult<AsyncOperation>>;

    /// Reserve a member name and mint its join token.
    fn create_member<'a>(&'a self, server_name: &'a str)
    -> BoxFuture<'a, ClusterResult<AsyncOperation>>;

    /// Resolve once the operation is terminal or `timeout` has passed,
    /// returning its latest known state.
    fn wait<'a>(
        &'a self,
        operation: &'a AsyncOperation,
        timeout: Duration,
    ) -> BoxFuture<'a, ClusterResult<AsyncOperation>>;
}

/// Wait for `operation` to succeed.
///
/// A `Failed` terminal state becomes [`ClusterError::OperationFailed`]
/// with the server's reason untouched. Hitting the deadline, locally or
/// on the server side, is [`ClusterError::Timeout`]; remote side effects
/// are not rolled back in that case.
pub async fn await_operation(
    client: &dyn RemoteOperationClient,
    operation: &AsyncOperation,
    timeout: Duration,
) -> ClusterResult<AsyncOperation> {
    let finished = match tokio::time::timeout(timeout, client.wait(operation, timeout)).await {
        Ok(result) => result?,
        Err(_) => return Err(ClusterError::Timeout(timeout)),
    };

    debug!(id = %finished.id, status = ?finished.status, "operation resolved");

    match finished.status {
        OperationStatus::Success => Ok(finished),
        OperationStatus::Failed(reason) => Err(ClusterError::OperationFailed(reason)),
        OperationStatus::Pending | OperationStatus::Running => Err(ClusterError::Timeout(timeout)),
    }
}
