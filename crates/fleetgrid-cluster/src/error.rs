//! Error taxonomy for cluster formation.
//!
//! [`ClusterError`] classifies what went wrong; [`StageError`] pins it to
//! the protocol step the coordinator was executing when it happened.

use std::fmt;
use std::time::Duration;

use fleetgrid_state::StateError;
use thiserror::Error;

/// Result type alias for cluster operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors produced while forming, joining or growing a cluster.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The node already belongs to a cluster. Retrying cannot fix this.
    #[error("this server is already clustered")]
    AlreadyClustered,

    /// An operation that requires cluster membership ran on an unclustered node.
    #[error("this server is not clustered")]
    NotClustered,

    /// Another bootstrap/join/issue call is in flight on this node.
    #[error("a cluster membership transition is already in progress")]
    TransitionInProgress,

    #[error("malformed join token: {0}")]
    MalformedToken(String),

    #[error("join token expired at {expires_at}")]
    TokenExpired { expires_at: u64 },

    #[error("join token has already been redeemed")]
    TokenRedeemed,

    /// The token names a different server than the one using it.
    #[error("join token is for {found:?}, expected {expected:?}")]
    TokenMismatch { expected: String, found: String },

    /// The certificate presented by the peer does not match the pinned fingerprint.
    #[error("certificate fingerprint mismatch: expected {expected}, got {actual}")]
    FingerprintMismatch { expected: String, actual: String },

    /// The trust handshake was refused by the peer.
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    #[error("network error: {0}")]
    Network(String),

    /// The requested member name is already taken.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The optimistic-concurrency precondition did not hold.
    #[error("version mismatch: {0}")]
    VersionMismatch(String),

    /// A remote operation reached its `Failure` terminal state.
    #[error("operation failed: {0}")]
    OperationFailed(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The remote answered with a status this client does not classify.
    #[error("unexpected response ({status}): {message}")]
    Remote { status: u16, message: String },

    #[error("local certificate not found")]
    CertificateNotFound,

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("local daemon is already initialized")]
    AlreadyInitialized,

    #[error("local initialization failed: {0}")]
    LocalInit(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

impl ClusterError {
    /// Whether the same call may succeed if simply repeated later.
    ///
    /// Auth rejections are retryable only with a fresh token.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_)
                | Self::Timeout(_)
                | Self::VersionMismatch(_)
                | Self::AuthRejected(_)
                | Self::TransitionInProgress
        )
    }
}

/// A protocol step of the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Precondition,
    LocalInit,
    TokenDecode,
    TrustNegotiation,
    MembershipUpdate,
    MemberCreate,
    OperationWait,
    TokenConversion,
    TrustPersist,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Precondition => "precondition check",
            Self::LocalInit => "local initialization",
            Self::TokenDecode => "token decoding",
            Self::TrustNegotiation => "trust negotiation",
            Self::MembershipUpdate => "membership update",
            Self::MemberCreate => "member creation",
            Self::OperationWait => "operation wait",
            Self::TokenConversion => "token conversion",
            Self::TrustPersist => "trust persistence",
        };
        f.write_str(s)
    }
}

/// A [`ClusterError`] annotated with the step it occurred in.
#[derive(Debug, Error)]
#[error("during {stage}: {source}")]
pub struct StageError {
    pub stage: Stage,
    pub source: ClusterError,
}

impl StageError {
    pub fn new(stage: Stage, source: ClusterError) -> Self {
        Self { stage, source }
    }

    /// The underlying classification.
    pub fn kind(&self) -> &ClusterError {
        &self.source
    }

    pub fn is_retryable(&self) -> bool {
        self.source.is_retryable()
    }
}

/// Attach a [`Stage`] to a fallible result.
pub(crate) trait AtStage<T> {
    fn at(self, stage: Stage) -> Result<T, StageError>;
}

impl<T> AtStage<T> for ClusterResult<T> {
    fn at(self, stage: Stage) -> Result<T, StageError> {
        self.map_err(|e| StageError::new(stage, e))
    }
}
