//! fleetd.toml configuration.
//!
//! ```toml
//! name = "node1"
//! address = "10.0.0.5"
//! port = 8443
//! state_dir = "/var/lib/fleetgrid"
//! init_program = "lxd"
//! operation_timeout_secs = 60
//!
//! [storage]
//! pool = "local"
//! driver = "dir"
//! ```
//!
//! Every key is optional. Command-line flags override the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use fleetgrid_cluster::CoordinatorConfig;
use fleetgrid_cluster::identity::DEFAULT_PORT;
use serde::{Deserialize, Serialize};

pub const DEFAULT_STATE_DIR: &str = "/var/lib/fleetgrid";
pub const DEFAULT_INIT_PROGRAM: &str = "lxd";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Server name; falls back to the host name.
    pub name: Option<String>,
    /// Advertised host of this node.
    pub address: Option<String>,
    pub port: u16,
    pub state_dir: PathBuf,
    /// Admin socket of the compute daemon; `<state_dir>/unix.socket` when unset.
    pub admin_socket: Option<PathBuf>,
    pub init_program: String,
    pub operation_timeout_secs: u64,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub pool: String,
    pub driver: String,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            name: None,
            address: None,
            port: DEFAULT_PORT,
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            admin_socket: None,
            init_program: DEFAULT_INIT_PROGRAM.to_string(),
            operation_timeout_secs: 60,
            storage: StorageConfig::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            pool: "local".to_string(),
            driver: "dir".to_string(),
        }
    }
}

/// Values given on the command line.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub name: Option<String>,
    pub address: Option<String>,
    pub port: Option<u16>,
    pub state_dir: Option<PathBuf>,
    pub admin_socket: Option<PathBuf>,
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let config: FleetConfig =
            toml::from_str(&content).with_context(|| format!("parse config {}", path.display()))?;
        Ok(config)
    }

    /// Read `path` if given, then apply the command-line overrides.
    pub fn load(path: Option<&Path>, overrides: Overrides) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply(overrides);
        Ok(config)
    }

    pub fn apply(&mut self, overrides: Overrides) {
        if overrides.name.is_some() {
            self.name = overrides.name;
        }
        if overrides.address.is_some() {
            self.address = overrides.address;
        }
        if let Some(port) = overrides.port {
            self.port = port;
        }
        if let Some(state_dir) = overrides.state_dir {
            self.state_dir = state_dir;
        }
        if overrides.admin_socket.is_some() {
            self.admin_socket = overrides.admin_socket;
        }
    }

    pub fn node_name(&self) -> anyhow::Result<String> {
        if let Some(name) = self.name.as_deref().filter(|n| !n.is_empty()) {
            return Ok(name.to_string());
        }
        let host = std::fs::read_to_string("/etc/hostname")
            .context("no node name configured and /etc/hostname is unreadable")?;
        let host = host.trim();
        anyhow::ensure!(!host.is_empty(), "no node name configured and the host name is empty");
        Ok(host.to_string())
    }

    pub fn node_address(&self) -> anyhow::Result<String> {
        self.address
            .clone()
            .filter(|a| !a.is_empty())
            .context("no advertised address; pass --address or set `address` in the config file")
    }

    pub fn admin_socket(&self) -> PathBuf {
        self.admin_socket
            .clone()
            .unwrap_or_else(|| self.state_dir.join("unix.socket"))
    }

    pub fn database_path(&self) -> PathBuf {
        self.state_dir.join("fleetgrid.redb")
    }

    pub fn coordinator(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            operation_timeout: Duration::from_secs(self.operation_timeout_secs),
            storage_pool: self.storage.pool.clone(),
            storage_driver: self.storage.driver.clone(),
        }
    }
}
