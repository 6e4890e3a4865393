//! gantryd — the Gantry daemon.
//!
//! Single binary with two roles:
//! - `control-plane`: node registry, placement, health monitor, autoscaler,
//!   REST API, and the agent/observer bus endpoints.
//! - `agent`: per-host process supervision, resource reporting, backups.
//!
//! # Usage
//!
//! ```text
//! gantryd control-plane --bind 0.0.0.0:7070 --data-dir /var/lib/gantry
//! gantryd agent --node-id node-1 --control-plane ws://cp:7070/ws/agent
//! ```

mod agent_mode;
mod config;
mod control_plane;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};

use config::GantryConfig;

#[derive(Parser)]
#[command(name = "gantryd", about = "Gantry daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane (registry, placement, health, REST API, bus).
    ControlPlane {
        /// Path to a TOML config file.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Address to bind REST and bus endpoints on.
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Data directory for persistent state.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Shared bearer token agents must present.
        #[arg(long, env = "GANTRY_TOKEN")]
        token: Option<String>,

        /// Health sweep interval in seconds.
        #[arg(long)]
        health_interval: Option<u64>,

        /// Autoscaler check interval in seconds.
        #[arg(long)]
        autoscale_interval: Option<u64>,
    },

    /// Run a node agent that joins the control plane.
    Agent {
        /// Path to a TOML config file.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Stable node identifier.
        #[arg(long, env = "GANTRY_NODE_ID")]
        node_id: String,

        /// Display name shown in the cluster view. Defaults to the node id.
        #[arg(long, env = "GANTRY_NODE_NAME")]
        name: Option<String>,

        /// Placement zone, e.g. a region or rack label.
        #[arg(long, env = "GANTRY_LOCATION")]
        location: Option<String>,

        /// WebSocket URL of the control plane's agent endpoint.
        #[arg(long, env = "GANTRY_CONTROL_PLANE")]
        control_plane: String,

        /// Bearer token presented during registration.
        #[arg(long, env = "GANTRY_TOKEN")]
        token: Option<String>,

        /// Data directory for server files and backup archives.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Loopback address for the local health endpoint.
        #[arg(long)]
        health_addr: Option<SocketAddr>,

        /// Resource report interval in seconds.
        #[arg(long)]
        report_interval: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,gantryd=debug,gantry=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::ControlPlane {
            config,
            bind,
            data_dir,
            token,
            health_interval,
            autoscale_interval,
        } => {
            let mut cfg = load_config(config.as_deref())?;
            if let Some(bind) = bind {
                cfg.bind_addr = bind;
            }
            if let Some(dir) = data_dir {
                cfg.data_dir = dir;
            }
            if let Some(token) = token {
                cfg.agent_token = token;
            }
            if let Some(secs) = health_interval {
                cfg.health_interval_secs = secs;
            }
            if let Some(secs) = autoscale_interval {
                cfg.autoscale_interval_secs = secs;
            }
            control_plane::run_control_plane(cfg).await
        }
        Command::Agent {
            config,
            node_id,
            name,
            location,
            control_plane,
            token,
            data_dir,
            health_addr,
            report_interval,
        } => {
            let file = load_config(config.as_deref())?;
            let dir = data_dir.unwrap_or(file.data_dir);

            let mut agent = gantry_agent::AgentConfig::new(&node_id, &control_plane, &dir);
            agent.token = token.unwrap_or(file.agent_token);
            agent.stop_grace = Duration::from_secs(file.stop_grace_secs);
            if let Some(name) = name {
                agent.name = name;
            }
            if let Some(location) = location {
                agent.location = location;
            }
            if let Some(addr) = health_addr {
                agent.health_addr = addr;
            }
            if let Some(secs) = report_interval {
                agent.report_interval = Duration::from_secs(secs);
            }
            agent_mode::run_agent(agent).await
        }
    }
}

/// Config file if given, defaults otherwise.
fn load_config(path: Option<&Path>) -> anyhow::Result<GantryConfig> {
    match path {
        Some(path) => GantryConfig::from_file(path),
        None => Ok(GantryConfig::default()),
    }
}
