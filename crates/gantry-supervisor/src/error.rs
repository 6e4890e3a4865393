//! Supervisor errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SupervisorError {
    /// `start()` while the process is live. No second process is spawned.
    #[error("server process is already running")]
    AlreadyRunning,

    /// `stop()` or `send_command()` with no live process.
    #[error("server process is not running")]
    NotRunning,

    /// The executable could not be launched.
    #[error("failed to spawn server process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("process I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

pub type SupervisorResult<T> = Result<T, SupervisorError>;
