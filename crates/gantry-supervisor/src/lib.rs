//! gantry-supervisor — owns exactly one game-server OS process.
//!
//! A supervisor starts its process with piped stdio, streams every output
//! line to a rolling console log and to an event channel, classifies the
//! exit (status 0 is a clean stop, anything else a crash), and re-starts
//! crashed processes after a grace delay when auto-restart is on.
//!
//! `stop`, `restart` and `send_command` serialize through one control
//! mutex per supervisor, so a manual stop can never race an auto-restart
//! of the same process.

pub mod console;
pub mod error;
pub mod supervisor;

pub use console::RollingLog;
pub use error::{SupervisorError, SupervisorResult};
pub use supervisor::{ConsoleStream, Supervisor, SupervisorConfig, SupervisorEvent};
