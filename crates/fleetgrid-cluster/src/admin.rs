//! HTTP admin client for the local compute daemon.
//!
//! Speaks the daemon's JSON API over its unix socket (or TCP, mostly for
//! tests):
//!
//! ```text
//! GET  /1.0/cluster                         → sync, ETag header
//! PUT  /1.0/cluster          (If-Match)     → async operation
//! POST /1.0/cluster/members                 → async operation
//! GET  /1.0/operations/{id}/wait?timeout=N  → sync, operation state
//! ```
//!
//! Waiting is a server-side long poll: one request that returns when the
//! operation finishes or the timeout elapses.

use std::path::PathBuf;
use std::time::Duration;

use http::{Method, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::error::{ClusterError, ClusterResult};
use crate::remote::{
    AsyncOperation, BoxFuture, ClusterMembershipConfig, ClusterState, Etag, OperationStatus,
    RemoteOperationClient,
};
use crate::wire::{self, Envelope, HttpReply, status_error};

/// Where the admin API listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminEndpoint {
    #[cfg(unix)]
    Unix(PathBuf),
    Tcp(String),
}

/// [`RemoteOperationClient`] over the daemon's HTTP API.
#[derive(Debug, Clone)]
pub struct AdminClient {
    endpoint: AdminEndpoint,
}

impl AdminClient {
    pub fn new(endpoint: AdminEndpoint) -> Self {
        Self { endpoint }
    }

    #[cfg(unix)]
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self::new(AdminEndpoint::Unix(path.into()))
    }

    pub fn tcp(address: impl Into<String>) -> Self {
        Self::new(AdminEndpoint::Tcp(address.into()))
    }

    pub fn endpoint(&self) -> &AdminEndpoint {
        &self.endpoint
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        headers: &[(&str, String)],
        body: Option<Vec<u8>>,
    ) -> ClusterResult<HttpReply> {
        match &self.endpoint {
            #[cfg(unix)]
            AdminEndpoint::Unix(socket) => {
                let stream = tokio::net::UnixStream::connect(socket)
                    .await
                    .map_err(|e| ClusterError::Network(format!("{}: {e}", socket.display())))?;
                wire::send(stream, method, "localhost", path, headers, body).await
            }
            AdminEndpoint::Tcp(address) => {
                let stream = TcpStream::connect(address.as_str())
                    .await
                    .map_err(|e| ClusterError::Network(format!("{address}: {e}")))?;
                wire::send(stream, method, address, path, headers, body).await
            }
        }
    }

    /// Issue a request and unwrap the envelope of a successful reply.
    async fn call(
        &self,
        method: Method,
        path: &str,
        headers: &[(&str, String)],
        body: Option<serde_json::Value>,
    ) -> ClusterResult<(Envelope, Option<String>)> {
        let body = body
            .map(|b| serde_json::to_vec(&b))
            .transpose()
            .map_err(|e| ClusterError::Network(format!("encode request: {e}")))?;
        let reply = self.request(method, path, headers, body).await?;
        let envelope = Envelope::parse(&reply.body);

        if !reply.status.is_success() || envelope.kind == "error" {
            let status = if reply.status.is_success() {
                StatusCode::INTERNAL_SERVER_ERROR
            } else {
                reply.status
            };
            let message = if envelope.error.is_empty() {
                status.to_string()
            } else {
                envelope.error
            };
            return Err(status_error(status, message));
        }

        Ok((envelope, reply.etag))
    }

    /// Turn an `async` envelope into an operation handle.
    fn operation(envelope: Envelope) -> ClusterResult<AsyncOperation> {
        if envelope.kind != "async" {
            return Err(ClusterError::Remote {
                status: 200,
                message: format!("expected async response, got {:?}", envelope.kind),
            });
        }
        let mut op = parse_operation(envelope.metadata)?;
        if op.id.is_empty() {
            op.id = envelope
                .operation
                .rsplit('/')
                .next()
                .unwrap_or_default()
                .to_string();
        }
        if op.id.is_empty() {
            return Err(ClusterError::Remote {
                status: 200,
                message: "async response without operation id".to_string(),
            });
        }
        Ok(op)
    }
}

impl RemoteOperationClient for AdminClient {
    fn cluster_state(&self) -> BoxFuture<'_, ClusterResult<(ClusterState, Etag)>> {
        Box::pin(async move {
            let (envelope, etag) = self.call(Method::GET, "/1.0/cluster", &[], None).await?;
            let state: ClusterState = serde_json::from_value(envelope.metadata)
                .map_err(|e| ClusterError::Network(format!("decode cluster state: {e}")))?;
            debug!(server_name = %state.server_name, enabled = state.enabled, "fetched cluster state");
            Ok((state, Etag::new(etag.unwrap_or_default())))
        })
    }

    fn update_membership<'a>(
        &'a self,
        config: &'a ClusterMembershipConfig,
        expected_version: Option<&'a Etag>,
    ) -> BoxFuture<'a, ClusterResult<AsyncOperation>> {
        Box::pin(async move {
            let mut headers = Vec::new();
            if let Some(etag) = expected_version.filter(|e| !e.is_empty()) {
                headers.push(("if-match", format!("\"{etag}\"")));
            }
            let body = serde_json::to_value(config)
                .map_err(|e| ClusterError::Network(format!("encode membership: {e}")))?;
            let (envelope, _) = self
                .call(Method::PUT, "/1.0/cluster", &headers, Some(body))
                .await?;
            let op = Self::operation(envelope)?;
            info!(server_name = %config.server_name, op = %op.id, "membership update submitted");
            Ok(op)
        })
    }

    fn create_member<'a>(
        &'a self,
        server_name: &'a str,
    ) -> BoxFuture<'a, ClusterResult<AsyncOperation>> {
        Box::pin(async move {
            let body = json!({ "server_name": server_name });
            let (envelope, _) = self
                .call(Method::POST, "/1.0/cluster/members", &[], Some(body))
                .await?;
            let op = Self::operation(envelope)?;
            info!(%server_name, op = %op.id, "member creation submitted");
            Ok(op)
        })
    }

    fn wait<'a>(
        &'a self,
        operation: &'a AsyncOperation,
        timeout: Duration,
    ) -> BoxFuture<'a, ClusterResult<AsyncOperation>> {
        Box::pin(async move {
            let path = format!(
                "/1.0/operations/{}/wait?timeout={}",
                operation.id,
                timeout.as_secs().max(1)
            );
            let (envelope, _) = self.call(Method::GET, &path, &[], None).await?;
            parse_operation(envelope.metadata)
        })
    }
}

#[derive(Deserialize)]
struct WireOperation {
    #[serde(default)]
    id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    err: String,
    #[serde(default)]
    metadata: serde_json::Value,
}

fn parse_operation(value: serde_json::Value) -> ClusterResult<AsyncOperation> {
    let wire: WireOperation = serde_json::from_value(value)
        .map_err(|e| ClusterError::Network(format!("decode operation: {e}")))?;
    let status = match wire.status.to_ascii_lowercase().as_str() {
        "pending" => OperationStatus::Pending,
        "running" => OperationStatus::Running,
        "success" => OperationStatus::Success,
        "failure" | "failed" | "cancelled" => OperationStatus::Failed(wire.err),
        "" => OperationStatus::Pending,
        other => {
            return Err(ClusterError::Remote {
                status: 200,
                message: format!("unknown operation status {other:?}"),
            });
        }
    };
    Ok(AsyncOperation {
        id: wire.id,
        status,
        metadata: wire.metadata,
    })
}
