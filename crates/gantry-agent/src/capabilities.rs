//! Host capability probing.
//!
//! Capabilities are advertised in the registration handshake and drive
//! placement: a server that requires `java-runtime` only lands on nodes
//! that probed it successfully.

use std::collections::BTreeSet;
use std::process::Command;

use tracing::debug;

/// Probe the host for runtimes Gantry knows how to drive.
///
/// `java` on PATH advertises `java-runtime`; `docker` or `podman`
/// advertises `container-runtime`.
pub fn probe() -> BTreeSet<String> {
    let mut capabilities = BTreeSet::new();
    if command_exists("java") {
        capabilities.insert("java-runtime".to_string());
    }
    if command_exists("docker") || command_exists("podman") {
        capabilities.insert("container-runtime".to_string());
    }
    debug!(?capabilities, "probed host capabilities");
    capabilities
}

/// Check whether a command resolves on PATH.
fn command_exists(command: &str) -> bool {
    let probe = if cfg!(target_os = "windows") {
        Command::new("where").arg(command).output()
    } else {
        Command::new("which").arg(command).output()
    };
    match probe {
        Ok(output) => output.status.success(),
        Err(_) => false,
    }
}
