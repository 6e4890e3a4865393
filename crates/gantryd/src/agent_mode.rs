//! Agent mode — runs on worker nodes, supervises local game servers.
//!
//! Thin wrapper over [`gantry_agent::run_agent`]: the agent crate owns the
//! connection, sampling, and command execution; this module only hands it
//! a ctrl-c-driven shutdown signal.

use tokio::sync::watch;
use tracing::info;

use gantry_agent::AgentConfig;

/// Run the node agent until ctrl-c.
pub async fn run_agent(config: AgentConfig) -> anyhow::Result<()> {
    info!(node_id = %config.node_id, "Gantry daemon starting in agent mode");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let agent = tokio::spawn(gantry_agent::run_agent(config, shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .expect("failed to install CTRL+C handler");
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    match agent.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(e.into()),
        Err(e) => return Err(anyhow::anyhow!("agent task panicked: {e}")),
    }

    info!("agent stopped");
    Ok(())
}
