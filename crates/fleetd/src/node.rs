//! Wiring of the concrete collaborators into a coordinator.

use std::sync::Arc;

use anyhow::Context;
use fleetgrid_cluster::{
    AdminClient, ClusterCoordinator, ClusterState, CommandInitializer, CoordinatorState,
    HttpsTrustTransport, ServiceDescriptor, TrustNegotiator, TrustStore,
};
use fleetgrid_state::StateStore;
use serde::Serialize;
use tracing::info;

use crate::config::FleetConfig;

/// A node ready to run one cluster command.
pub struct Node {
    pub coordinator: ClusterCoordinator,
    pub trust: TrustStore,
}

/// What `fleetd identity` prints.
#[derive(Debug, Serialize)]
pub struct IdentityReport {
    pub descriptor: ServiceDescriptor,
    pub network_address: String,
    pub fingerprint: String,
}

/// What `fleetd status` prints.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub descriptor: ServiceDescriptor,
    pub state: CoordinatorState,
    pub cluster: ClusterState,
    pub trusted_peers: Vec<PeerSummary>,
}

#[derive(Debug, Serialize)]
pub struct PeerSummary {
    pub name: String,
    pub address: String,
    pub fingerprint: String,
}

impl Node {
    /// Open the state store, load or create the identity and connect the
    /// coordinator to the local daemon. Nothing touches the network yet.
    pub fn open(config: &FleetConfig) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.state_dir)
            .with_context(|| format!("create state dir {}", config.state_dir.display()))?;

        let db_path = config.database_path();
        let state = StateStore::open(&db_path)
            .with_context(|| format!("open state store {}", db_path.display()))?;
        info!(path = ?db_path, "state store opened");

        let trust = TrustStore::new(state, Arc::new(HttpsTrustTransport::new()));
        let identity = trust
            .load_or_create_identity(&config.node_name()?, &config.node_address()?, config.port)
            .context("load node identity")?;

        let admin_socket = config.admin_socket();
        info!(socket = ?admin_socket, "using local admin socket");

        let coordinator = ClusterCoordinator::new(
            identity,
            Arc::new(AdminClient::unix(admin_socket)),
            Arc::new(CommandInitializer::new(&config.init_program)),
            TrustNegotiator::new(trust.clone()),
            config.coordinator(),
        );

        Ok(Self { coordinator, trust })
    }

    pub fn identity_report(&self) -> anyhow::Result<IdentityReport> {
        let identity = self.coordinator.identity();
        Ok(IdentityReport {
            descriptor: self.coordinator.descriptor(),
            network_address: identity.network_address(),
            fingerprint: identity.certificate.fingerprint()?.to_hex(),
        })
    }

    pub async fn status_report(&self) -> anyhow::Result<StatusReport> {
        let cluster = self.coordinator.sync().await?;
        let trusted_peers = self
            .trust
            .trusted_peers()?
            .into_iter()
            .map(|peer| PeerSummary {
                name: peer.name,
                address: peer.address,
                fingerprint: peer.fingerprint,
            })
            .collect();
        Ok(StatusReport {
            descriptor: self.coordinator.descriptor(),
            state: self.coordinator.state(),
            cluster,
            trusted_peers,
        })
    }
}
