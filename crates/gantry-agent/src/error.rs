//! Agent errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("control-plane connection failed: {0}")]
    Connection(#[from] tokio_tungstenite::tungstenite::Error),

    /// The deploy spec names an artifact the agent cannot stage.
    #[error("artifact staging failed: {0}")]
    Artifact(String),

    #[error("artifact fetch failed: {0}")]
    Fetch(#[from] reqwest::Error),

    #[error("bus codec error: {0}")]
    Bus(#[from] gantry_bus::BusError),

    #[error(transparent)]
    Supervisor(#[from] gantry_supervisor::SupervisorError),

    #[error(transparent)]
    Backup(#[from] gantry_backup::BackupError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for agent operations.
pub type AgentResult<T> = Result<T, AgentError>;
