//! Cluster coordinator: drives bootstrap and join, issues join tokens.
//!
//! ```text
//! Uninitialized ─▶ LocalReady ─┬─▶ Bootstrapping ─┬─▶ Clustered
//!                              └─▶ Joining ───────┘
//!        any step after the precondition check ──▶ Failed { stage, reason }
//! ```
//!
//! Each public method is one sequential call chain on the caller's task.
//! Overlapping transitions on the same coordinator are refused with
//! [`ClusterError::TransitionInProgress`]. Nothing is rolled back on
//! failure; a node left `Failed` can retry, or call [`ClusterCoordinator::sync`]
//! to pick up a transition that completed remotely after a timeout.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard, watch};
use tracing::{debug, info, warn};

use crate::error::{AtStage, ClusterError, Stage, StageError};
use crate::identity::{NodeIdentity, ServiceDescriptor};
use crate::negotiator::TrustNegotiator;
use crate::preseed::{LocalInitializer, Preseed};
use crate::remote::{ClusterMembershipConfig, ClusterState, RemoteOperationClient, await_operation};
use crate::token::{JoinToken, epoch_secs};

/// Tunables of the coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Deadline for each awaited remote operation.
    pub operation_timeout: Duration,
    /// Storage pool created during local initialization.
    pub storage_pool: String,
    pub storage_driver: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(60),
            storage_pool: "local".to_string(),
            storage_driver: "dir".to_string(),
        }
    }
}

/// Where the node is in its cluster lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CoordinatorState {
    Uninitialized,
    LocalReady,
    Bootstrapping,
    Joining,
    Clustered,
    Failed { stage: Stage, reason: String },
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => f.write_str("uninitialized"),
            Self::LocalReady => f.write_str("local-ready"),
            Self::Bootstrapping => f.write_str("bootstrapping"),
            Self::Joining => f.write_str("joining"),
            Self::Clustered => f.write_str("clustered"),
            Self::Failed { stage, reason } => write!(f, "failed during {stage}: {reason}"),
        }
    }
}

/// Orchestrates cluster formation for one node.
pub struct ClusterCoordinator {
    identity: NodeIdentity,
    remote: Arc<dyn RemoteOperationClient>,
    local_init: Arc<dyn LocalInitializer>,
    negotiator: TrustNegotiator,
    config: CoordinatorConfig,
    state: watch::Sender<CoordinatorState>,
    transition: Mutex<()>,
}

impl ClusterCoordinator {
    pub fn new(
        identity: NodeIdentity,
        remote: Arc<dyn RemoteOperationClient>,
        local_init: Arc<dyn LocalInitializer>,
        negotiator: TrustNegotiator,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            identity,
            remote,
            local_init,
            negotiator,
            config,
            state: watch::Sender::new(CoordinatorState::Uninitialized),
            transition: Mutex::new(()),
        }
    }

    pub fn state(&self) -> CoordinatorState {
        self.state.borrow().clone()
    }

    /// Observe state changes.
    pub fn subscribe(&self) -> watch::Receiver<CoordinatorState> {
        self.state.subscribe()
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn descriptor(&self) -> ServiceDescriptor {
        self.identity.descriptor()
    }

    /// Form a new cluster with this node as its first member.
    pub async fn bootstrap(&self) -> Result<(), StageError> {
        let _guard = self.begin()?;

        let (current, _) = self.remote.cluster_state().await.at(Stage::Precondition)?;
        if current.enabled {
            return Err(StageError::new(Stage::Precondition, ClusterError::AlreadyClustered));
        }

        info!(server_name = %self.identity.name, address = %self.identity.network_address(), "bootstrapping cluster");
        self.initialize_local().await?;
        self.set(CoordinatorState::Bootstrapping);

        // Re-read after local init so the precondition covers its effects.
        let (_, etag) = self
            .remote
            .cluster_state()
            .await
            .at(Stage::MembershipUpdate)
            .map_err(|e| self.fail(e))?;
        let config = ClusterMembershipConfig::bootstrap(&self.identity);
        let op = self
            .remote
            .update_membership(&config, Some(&etag))
            .await
            .at(Stage::MembershipUpdate)
            .map_err(|e| self.fail(e))?;

        await_operation(self.remote.as_ref(), &op, self.config.operation_timeout)
            .await
            .at(Stage::OperationWait)
            .map_err(|e| self.fail(e))?;

        self.set(CoordinatorState::Clustered);
        info!(server_name = %self.identity.name, "cluster bootstrapped");
        Ok(())
    }

    /// Join the cluster described by an encoded join token.
    pub async fn join(&self, token_text: &str) -> Result<(), StageError> {
        let _guard = self.begin()?;

        let (current, _) = self.remote.cluster_state().await.at(Stage::Precondition)?;
        if current.enabled {
            return Err(StageError::new(Stage::Precondition, ClusterError::AlreadyClustered));
        }

        let token = self.decode_token(token_text).map_err(|e| self.fail(e))?;
        info!(
            server_name = %self.identity.name,
            cluster = %token.cluster_name,
            address = %token.cluster_address,
            "joining cluster"
        );

        self.initialize_local().await?;
        self.set(CoordinatorState::Joining);

        // Trust strictly precedes any membership mutation.
        let negotiated = self
            .negotiator
            .negotiate_join(&token, &self.identity)
            .await
            .at(Stage::TrustNegotiation)
            .map_err(|e| self.fail(e))?;

        let config =
            ClusterMembershipConfig::join(&self.identity, &token, &negotiated.cluster_certificate);
        let op = self
            .remote
            .update_membership(&config, None)
            .await
            .at(Stage::MembershipUpdate)
            .map_err(|e| self.fail(e))?;

        await_operation(self.remote.as_ref(), &op, self.config.operation_timeout)
            .await
            .at(Stage::OperationWait)
            .map_err(|e| self.fail(e))?;

        self.negotiator
            .trust_store()
            .accept_peer(
                &token.cluster_name,
                &token.cluster_address,
                &negotiated.cluster_certificate,
            )
            .at(Stage::TrustPersist)
            .map_err(|e| self.fail(e))?;
        // Only a completed join uses up the token.
        self.negotiator
            .redeem(&token)
            .at(Stage::TrustPersist)
            .map_err(|e| self.fail(e))?;

        self.set(CoordinatorState::Clustered);
        info!(server_name = %self.identity.name, cluster = %token.cluster_name, "joined cluster");
        Ok(())
    }

    /// Reserve `peer` as a member name and return its encoded join token.
    ///
    /// Only valid on a clustered node. Failures leave the coordinator
    /// state untouched.
    pub async fn issue_token(&self, peer: &str) -> Result<String, StageError> {
        let _guard = self.begin()?;

        if self.state() != CoordinatorState::Clustered {
            return Err(StageError::new(Stage::Precondition, ClusterError::NotClustered));
        }

        let op = self.remote.create_member(peer).await.at(Stage::MemberCreate)?;
        let done = await_operation(self.remote.as_ref(), &op, self.config.operation_timeout)
            .await
            .at(Stage::OperationWait)?;

        let token = JoinToken::from_operation_metadata(&done.metadata).at(Stage::TokenConversion)?;
        if token.server_name != peer {
            return Err(StageError::new(
                Stage::TokenConversion,
                ClusterError::TokenMismatch {
                    expected: peer.to_string(),
                    found: token.server_name,
                },
            ));
        }

        info!(%peer, cluster = %token.cluster_name, "join token issued");
        Ok(token.encode())
    }

    /// Refresh the lifecycle state from the remote cluster state.
    pub async fn sync(&self) -> Result<ClusterState, StageError> {
        let _guard = self.begin()?;

        let (current, etag) = self.remote.cluster_state().await.at(Stage::Precondition)?;
        if current.enabled {
            self.set(CoordinatorState::Clustered);
        }
        debug!(enabled = current.enabled, %etag, state = %self.state(), "cluster state synced");
        Ok(current)
    }

    fn begin(&self) -> Result<MutexGuard<'_, ()>, StageError> {
        self.transition
            .try_lock()
            .map_err(|_| StageError::new(Stage::Precondition, ClusterError::TransitionInProgress))
    }

    fn set(&self, next: CoordinatorState) {
        let prev = self.state.send_replace(next.clone());
        if prev != next {
            debug!(from = %prev, to = %next, "coordinator state changed");
        }
    }

    /// Record a failed transition and hand the error back.
    fn fail(&self, err: StageError) -> StageError {
        warn!(stage = %err.stage, error = %err.source, "cluster transition failed");
        self.set(CoordinatorState::Failed {
            stage: err.stage,
            reason: err.source.to_string(),
        });
        err
    }

    fn decode_token(&self, text: &str) -> Result<JoinToken, StageError> {
        let token = JoinToken::decode(text).at(Stage::TokenDecode)?;
        if token.server_name != self.identity.name {
            return Err(StageError::new(
                Stage::TokenDecode,
                ClusterError::TokenMismatch {
                    expected: self.identity.name.clone(),
                    found: token.server_name,
                },
            ));
        }
        token.ensure_fresh(epoch_secs()).at(Stage::TokenDecode)?;
        Ok(token)
    }

    /// Apply the default topology locally. An already initialized daemon
    /// counts as ready so a failed transition can be retried.
    async fn initialize_local(&self) -> Result<(), StageError> {
        let preseed = Preseed::default_topology(
            &self.identity,
            &self.config.storage_pool,
            &self.config.storage_driver,
        );
        match self.local_init.initialize(&preseed).await {
            Ok(()) => {}
            Err(ClusterError::AlreadyInitialized) => {
                debug!("local daemon already initialized");
            }
            Err(e) => return Err(self.fail(StageError::new(Stage::LocalInit, e))),
        }
        self.set(CoordinatorState::LocalReady);
        Ok(())
    }
}

impl fmt::Debug for ClusterCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterCoordinator")
            .field("identity", &self.identity.name)
            .field("state", &self.state())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_display() {
        assert_eq!(CoordinatorState::Clustered.to_string(), "clustered");
        let failed = CoordinatorState::Failed {
            stage: Stage::OperationWait,
            reason: "operation failed: quorum unreachable".to_string(),
        };
        assert_eq!(
            failed.to_string(),
            "failed during operation wait: operation failed: quorum unreachable"
        );
    }

    #[test]
    fn state_serializes_tagged() {
        let failed = CoordinatorState::Failed {
            stage: Stage::TrustNegotiation,
            reason: "nope".to_string(),
        };
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["state"], "failed");
        assert_eq!(json["stage"], "trust_negotiation");
    }

    #[test]
    fn default_config() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.operation_timeout, Duration::from_secs(60));
        assert_eq!(config.storage_pool, "local");
    }
}
