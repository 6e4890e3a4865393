//! gantry-agent — the node-side daemon.
//!
//! One agent runs per host. It dials out to the control plane, registers
//! with its probed capabilities, reports host and per-process resource
//! usage on an interval, and executes deploy / lifecycle / backup commands
//! against local process supervisors. The connection retries with capped
//! doubling backoff and re-registers on every reconnect; a small loopback
//! HTTP endpoint answers local liveness checks.

pub mod capabilities;
pub mod connection;
pub mod error;
pub mod executor;
pub mod health;
pub mod sampler;

pub use connection::AgentConnection;
pub use error::{AgentError, AgentResult};
pub use executor::CommandExecutor;
pub use sampler::ResourceSampler;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

/// Everything an agent needs to come up on a host.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub node_id: String,
    /// Human-readable name shown in the cluster view.
    pub name: String,
    /// Placement zone, e.g. a region or rack label.
    pub location: String,
    /// WebSocket URL of the control plane's agent endpoint.
    pub control_plane_url: String,
    /// Bearer token presented during registration.
    pub token: String,
    /// Root for server working directories and backup archives.
    pub data_dir: PathBuf,
    pub health_addr: SocketAddr,
    pub report_interval: Duration,
    /// How long a stopping server gets before it is force-killed.
    pub stop_grace: Duration,
}

impl AgentConfig {
    pub fn new(node_id: &str, control_plane_url: &str, data_dir: &Path) -> Self {
        Self {
            node_id: node_id.to_string(),
            name: node_id.to_string(),
            location: "default".to_string(),
            control_plane_url: control_plane_url.to_string(),
            token: String::new(),
            data_dir: data_dir.to_path_buf(),
            health_addr: SocketAddr::from(([127, 0, 0, 1], 8911)),
            report_interval: Duration::from_secs(5),
            stop_grace: Duration::from_secs(10),
        }
    }
}

/// Run the agent until `shutdown` flips to true.
pub async fn run_agent(config: AgentConfig, shutdown: watch::Receiver<bool>) -> AgentResult<()> {
    let capabilities = capabilities::probe();
    info!(
        node_id = %config.node_id,
        capabilities = ?capabilities,
        data_dir = %config.data_dir.display(),
        "agent starting"
    );

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (resources_tx, resources_rx) = watch::channel(None);
    let executor = CommandExecutor::new(config.clone(), outbound_tx);

    let health = tokio::spawn(health::serve(
        config.health_addr,
        config.node_id.clone(),
        resources_rx,
        shutdown.clone(),
    ));

    let connection = AgentConnection::new(config, capabilities, executor, resources_tx);
    let result = connection.run(outbound_rx, shutdown).await;

    match health.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "health endpoint exited with error"),
        Err(e) => warn!(error = %e, "health task panicked"),
    }
    result
}
