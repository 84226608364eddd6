//! Minimal JSON-over-HTTP/1 plumbing shared by the admin client and the
//! trust transport.
//!
//! Each request runs on its own connection; the stream can be a unix
//! socket, a TCP stream or a TLS session.

use bytes::Bytes;
use http::header::{CONTENT_TYPE, ETAG, HOST, USER_AGENT};
use http::{Method, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::error::{ClusterError, ClusterResult};

const AGENT: &str = concat!("fleetgrid/", env!("CARGO_PKG_VERSION"));

/// Response status, entity tag and raw body.
#[derive(Debug)]
pub(crate) struct HttpReply {
    pub status: StatusCode,
    pub etag: Option<String>,
    pub body: Bytes,
}

/// Send one request over `io` and read the full response.
pub(crate) async fn send<S>(
    io: S,
    method: Method,
    authority: &str,
    path: &str,
    headers: &[(&str, String)],
    body: Option<Vec<u8>>,
) -> ClusterResult<HttpReply>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io))
        .await
        .map_err(network)?;

    // Drive the connection in the background.
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "http connection closed with error");
        }
    });

    let mut builder = http::Request::builder()
        .method(method.clone())
        .uri(path)
        .header(HOST, authority)
        .header(USER_AGENT, AGENT);
    if body.is_some() {
        builder = builder.header(CONTENT_TYPE, "application/json");
    }
    for (name, value) in headers {
        builder = builder.header(*name, value.as_str());
    }
    let req = builder
        .body(Full::new(Bytes::from(body.unwrap_or_default())))
        .map_err(|e| ClusterError::Network(format!("invalid request: {e}")))?;

    let resp = sender.send_request(req).await.map_err(network)?;
    let status = resp.status();
    let etag = resp
        .headers()
        .get(ETAG)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_matches('"').to_string());
    let body = resp.into_body().collect().await.map_err(network)?.to_bytes();

    debug!(%method, %path, %status, bytes = body.len(), "http request completed");

    Ok(HttpReply { status, etag, body })
}

/// Standard response envelope of the administrative API.
///
/// `type` is one of `sync`, `async` or `error`.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct Envelope {
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Operation URL for `async` responses.
    #[serde(default)]
    pub operation: String,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Envelope {
    /// Parse a body, tolerating non-JSON error pages.
    pub fn parse(body: &[u8]) -> Self {
        serde_json::from_slice(body).unwrap_or_else(|_| Self {
            kind: "error".to_string(),
            error: String::from_utf8_lossy(body).trim().to_string(),
            ..Self::default()
        })
    }
}

/// Classify a non-success reply.
pub(crate) fn status_error(status: StatusCode, message: String) -> ClusterError {
    match status {
        StatusCode::CONFLICT => ClusterError::Conflict(message),
        StatusCode::PRECONDITION_FAILED => ClusterError::VersionMismatch(message),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ClusterError::AuthRejected(message),
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
            ClusterError::Network(message)
        }
        other => ClusterError::Remote {
            status: other.as_u16(),
            message,
        },
    }
}

pub(crate) fn network(e: impl std::fmt::Display) -> ClusterError {
    ClusterError::Network(e.to_string())
}
