//! Preseed configuration and local node initialization.
//!
//! A [`Preseed`] describes the desired local configuration of a node
//! (listen addresses, storage pools, profiles). It is handed to a
//! [`LocalInitializer`], which in production is the compute daemon's own
//! `init --preseed` command fed YAML on stdin.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{ClusterError, ClusterResult};
use crate::identity::NodeIdentity;
use crate::remote::BoxFuture;

pub const CORE_HTTPS_ADDRESS: &str = "core.https_address";
pub const CLUSTER_HTTPS_ADDRESS: &str = "cluster.https_address";

/// A storage pool to create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoragePool {
    pub name: String,
    pub driver: String,
}

/// A profile and its devices. Device options are free-form strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    #[serde(default)]
    pub devices: BTreeMap<String, BTreeMap<String, String>>,
}

/// Desired local configuration of a node.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Preseed {
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    #[serde(default)]
    pub storage_pools: Vec<StoragePool>,
    #[serde(default)]
    pub profiles: Vec<Profile>,
}

impl Preseed {
    /// Default topology for a node about to form or join a cluster: both
    /// listeners on the node's address, one storage pool and a `default`
    /// profile with a root disk on that pool.
    pub fn default_topology(identity: &NodeIdentity, pool: &str, driver: &str) -> Self {
        let address = identity.network_address();
        let config = BTreeMap::from([
            (CORE_HTTPS_ADDRESS.to_string(), address.clone()),
            (CLUSTER_HTTPS_ADDRESS.to_string(), address),
        ]);

        let root = BTreeMap::from([
            ("path".to_string(), "/".to_string()),
            ("pool".to_string(), pool.to_string()),
            ("type".to_string(), "disk".to_string()),
        ]);

        Self {
            config,
            storage_pools: vec![StoragePool {
                name: pool.to_string(),
                driver: driver.to_string(),
            }],
            profiles: vec![Profile {
                name: "default".to_string(),
                devices: BTreeMap::from([("root".to_string(), root)]),
            }],
        }
    }

    pub fn https_address(&self) -> Option<&str> {
        self.config.get(CORE_HTTPS_ADDRESS).map(String::as_str)
    }

    pub fn to_yaml(&self) -> ClusterResult<String> {
        serde_yaml::to_string(self).map_err(|e| ClusterError::LocalInit(format!("encode preseed: {e}")))
    }

    pub fn from_yaml(text: &str) -> ClusterResult<Self> {
        serde_yaml::from_str(text).map_err(|e| ClusterError::LocalInit(format!("decode preseed: {e}")))
    }
}

/// Applies a preseed to the local node.
pub trait LocalInitializer: Send + Sync {
    /// Fails with [`ClusterError::AlreadyInitialized`] if the node was
    /// initialized before.
    fn initialize<'a>(&'a self, preseed: &'a Preseed) -> BoxFuture<'a, ClusterResult<()>>;
}

/// Runs `<program> init --preseed` with the preseed YAML on stdin.
#[derive(Debug, Clone)]
pub struct CommandInitializer {
    program: PathBuf,
}

impl CommandInitializer {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &std::path::Path {
        &self.program
    }

    async fn run(&self, preseed: &Preseed) -> ClusterResult<()> {
        let yaml = preseed.to_yaml()?;
        debug!(program = %self.program.display(), "running local init");

        let mut child = Command::new(&self.program)
            .args(["init", "--preseed"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            // A daemon that refuses early may exit without reading its
            // input; its exit status and stderr decide the outcome.
            let written = match stdin.write_all(yaml.as_bytes()).await {
                Ok(()) => stdin.shutdown().await,
                Err(e) => Err(e),
            };
            match written {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    debug!(program = %self.program.display(), "init closed stdin early");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let output = child.wait_with_output().await?;
        if output.status.success() {
            info!(address = preseed.https_address().unwrap_or_default(), "local node initialized");
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.to_ascii_lowercase().contains("already") {
            return Err(ClusterError::AlreadyInitialized);
        }
        Err(ClusterError::LocalInit(format!(
            "{} init exited with {}: {stderr}",
            self.program.display(),
            output.status
        )))
    }
}

impl LocalInitializer for CommandInitializer {
    fn initialize<'a>(&'a self, preseed: &'a Preseed) -> BoxFuture<'a, ClusterResult<()>> {
        Box::pin(self.run(preseed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::generate_node_cert;

    fn identity() -> NodeIdentity {
        NodeIdentity {
            name: "node1".to_string(),
            address: "10.0.0.5".to_string(),
            port: 8443,
            certificate: generate_node_cert("node1", &[]).unwrap(),
        }
    }

    #[test]
    fn default_topology_layout() {
        let preseed = Preseed::default_topology(&identity(), "local", "dir");
        assert_eq!(preseed.https_address(), Some("10.0.0.5:8443"));
        assert_eq!(preseed.config[CLUSTER_HTTPS_ADDRESS], "10.0.0.5:8443");
        assert_eq!(preseed.storage_pools.len(), 1);
        assert_eq!(preseed.storage_pools[0].driver, "dir");

        let root = &preseed.profiles[0].devices["root"];
        assert_eq!(root["pool"], "local");
        assert_eq!(root["type"], "disk");
        assert_eq!(root["path"], "/");
    }

    #[test]
    fn yaml_layout() {
        let yaml = Preseed::default_topology(&identity(), "local", "dir").to_yaml().unwrap();
        assert!(yaml.contains("core.https_address:"));
        assert!(yaml.contains("10.0.0.5:8443"));
        assert!(yaml.contains("storage_pools:"));
        assert!(yaml.contains("profiles:"));

        let back = Preseed::from_yaml(&yaml).unwrap();
        assert_eq!(back.https_address(), Some("10.0.0.5:8443"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_reports_already_initialized() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-daemon");
        std::fs::write(&script, "#!/bin/sh\ncat >/dev/null\necho 'Error: already initialized' >&2\nexit 1\n")
            .unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let init = CommandInitializer::new(&script);
        let err = init
            .initialize(&Preseed::default_topology(&identity(), "local", "dir"))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::AlreadyInitialized));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_exiting_without_reading_stdin_is_classified() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-daemon");
        std::fs::write(
            &script,
            "#!/bin/sh\nexec 0<&-\necho 'Error: already initialized' >&2\nexit 1\n",
        )
        .unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        // Large enough to overflow the pipe buffer once the reader is gone.
        let mut preseed = Preseed::default_topology(&identity(), "local", "dir");
        for i in 0..4096 {
            preseed
                .config
                .insert(format!("user.padding.{i}"), "x".repeat(64));
        }

        let err = CommandInitializer::new(&script)
            .initialize(&preseed)
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::AlreadyInitialized));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_receives_yaml_on_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-daemon");
        let captured = dir.path().join("preseed.yaml");
        std::fs::write(
            &script,
            format!("#!/bin/sh\n[ \"$1 $2\" = \"init --preseed\" ] || exit 2\ncat > {}\n", captured.display()),
        )
        .unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        CommandInitializer::new(&script)
            .initialize(&Preseed::default_topology(&identity(), "local", "dir"))
            .await
            .unwrap();

        let written = std::fs::read_to_string(&captured).unwrap();
        assert_eq!(
            Preseed::from_yaml(&written).unwrap().https_address(),
            Some("10.0.0.5:8443")
        );
    }
}
