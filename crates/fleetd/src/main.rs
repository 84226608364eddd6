//! fleetd — the fleetgrid daemon.
//!
//! Forms and grows a cluster of compute nodes:
//! - `bootstrap` turns this node into the first member of a new cluster
//! - `issue-token <PEER>` (on a member) mints a single-use join token
//! - `join --token <TOKEN>` (on the new node) redeems it
//!
//! # Usage
//!
//! ```text
//! fleetd --name node1 --address 10.0.0.5 bootstrap
//! fleetd --name node1 --address 10.0.0.5 issue-token node2
//! fleetd --name node2 --address 10.0.0.6 join --token <TOKEN>
//! ```

mod config;
mod node;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::{FleetConfig, Overrides};
use crate::node::Node;

#[derive(Parser)]
#[command(name = "fleetd", about = "fleetgrid daemon")]
struct Cli {
    /// Path to fleetd.toml.
    #[arg(long, global = true, env = "FLEETD_CONFIG")]
    config: Option<PathBuf>,

    /// Server name of this node (defaults to the host name).
    #[arg(long, global = true)]
    name: Option<String>,

    /// Address this node advertises to the cluster.
    #[arg(long, global = true)]
    address: Option<String>,

    /// HTTPS port of the compute daemon.
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Directory for certificates and the state database.
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Admin socket of the local compute daemon.
    #[arg(long, global = true)]
    admin_socket: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Initialize this node and form a new cluster with it.
    Bootstrap,

    /// Join an existing cluster.
    Join {
        /// Join token issued by a cluster member.
        #[arg(long, env = "FLEETD_JOIN_TOKEN", hide_env_values = true)]
        token: String,
    },

    /// Reserve a member name and print its join token.
    IssueToken {
        /// Server name of the node that will join.
        peer: String,
    },

    /// Show the node's cluster status.
    Status,

    /// Show this node's identity and certificate fingerprint.
    Identity,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = FleetConfig::load(
        cli.config.as_deref(),
        Overrides {
            name: cli.name,
            address: cli.address,
            port: cli.port,
            state_dir: cli.state_dir,
            admin_socket: cli.admin_socket,
        },
    )?;

    let node = Node::open(&config)?;

    match cli.command {
        Command::Bootstrap => {
            node.coordinator.bootstrap().await?;
            print_json(&node.identity_report()?)?;
        }
        Command::Join { token } => {
            node.coordinator.join(&token).await?;
            print_json(&node.identity_report()?)?;
        }
        Command::IssueToken { peer } => {
            node.coordinator.sync().await?;
            let token = node.coordinator.issue_token(&peer).await?;
            println!("{token}");
        }
        Command::Status => {
            print_json(&node.status_report().await?)?;
        }
        Command::Identity => {
            print_json(&node.identity_report()?)?;
        }
    }

    info!(state = %node.coordinator.state(), "done");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,fleetd=debug,fleetgrid_cluster=debug"));
    // Logs go to stderr so stdout stays machine-readable.
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_flags_follow_subcommand() {
        let cli = Cli::try_parse_from([
            "fleetd",
            "issue-token",
            "node2",
            "--name",
            "node1",
            "--port",
            "9443",
        ])
        .unwrap();
        assert_eq!(cli.name.as_deref(), Some("node1"));
        assert_eq!(cli.port, Some(9443));
        assert!(matches!(cli.command, Command::IssueToken { ref peer } if peer == "node2"));
    }

    #[test]
    fn join_takes_token_flag() {
        let cli = Cli::try_parse_from(["fleetd", "join", "--token", "abc"]).unwrap();
        assert!(matches!(cli.command, Command::Join { ref token } if token == "abc"));
    }
}
