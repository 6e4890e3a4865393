//! Daemon configuration file.
//!
//! Optional TOML file shared by both modes; every field has a default, so
//! an empty file is valid, and CLI flags override whatever the file says.
//!
//! ```toml
//! bind_addr = "0.0.0.0:7070"
//! data_dir = "/var/lib/gantry"
//! agent_token = "hunter2"
//! health_interval_secs = 30
//! backup_exclude = ["logs/", ".lock"]
//!
//! [autoscale]
//! cpu_percent = 75.0
//! max_nodes = 20
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

use gantry_autoscale::ScaleTargets;

/// Everything tunable about the daemon.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GantryConfig {
    /// Address the control plane binds REST and bus endpoints on.
    pub bind_addr: SocketAddr,
    /// Data directory for persistent state, server files, and archives.
    pub data_dir: PathBuf,
    /// Shared bearer token agents must present. Empty accepts any agent.
    pub agent_token: String,
    /// Health sweep interval in seconds.
    pub health_interval_secs: u64,
    /// Autoscaler evaluation interval in seconds.
    pub autoscale_interval_secs: u64,
    pub autoscale: AutoscaleConfig,
    /// Exclude patterns applied to backup requests that name none.
    pub backup_exclude: Vec<String>,
    /// Grace period before a stopping server is force-killed, in seconds.
    pub stop_grace_secs: u64,
}

impl Default for GantryConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 7070)),
            data_dir: PathBuf::from("/var/lib/gantry"),
            agent_token: String::new(),
            health_interval_secs: 30,
            autoscale_interval_secs: 60,
            autoscale: AutoscaleConfig::default(),
            backup_exclude: Vec::new(),
            stop_grace_secs: 10,
        }
    }
}

impl GantryConfig {
    /// Read and parse a TOML config file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let config =
            toml::from_str(&raw).with_context(|| format!("parse config {}", path.display()))?;
        Ok(config)
    }
}

/// `[autoscale]` table. Mirrors [`ScaleTargets`] so a partial table keeps
/// the remaining defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AutoscaleConfig {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub min_nodes: usize,
    pub max_nodes: usize,
    pub cooldown_secs: u64,
}

impl Default for AutoscaleConfig {
    fn default() -> Self {
        let targets = ScaleTargets::default();
        Self {
            cpu_percent: targets.cpu_percent,
            memory_percent: targets.memory_percent,
            min_nodes: targets.min_nodes,
            max_nodes: targets.max_nodes,
            cooldown_secs: targets.cooldown_secs,
        }
    }
}

impl AutoscaleConfig {
    pub fn scale_targets(&self) -> ScaleTargets {
        ScaleTargets {
            cpu_percent: self.cpu_percent,
            memory_percent: self.memory_percent,
            min_nodes: self.min_nodes,
            max_nodes: self.max_nodes,
            cooldown_secs: self.cooldown_secs,
        }
    }
}
