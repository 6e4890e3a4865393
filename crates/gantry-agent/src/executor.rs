//! Inbound command dispatch.
//!
//! One `CommandExecutor` per agent. It owns the map of local process
//! supervisors, executes control-plane commands against them, and pumps
//! supervisor events back out as bus envelopes. Every command runs on its
//! own task so a slow stop or artifact fetch never stalls the connection
//! loop.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use gantry_bus::envelope::{
    BackupReport, BackupRequest, CommandPayload, ConsoleLine, DeploySpec, Envelope, MessageType,
    RestoreRequest, StatusUpdate,
};
use gantry_state::ServerStatus;
use gantry_supervisor::{Supervisor, SupervisorConfig, SupervisorEvent};

use crate::AgentConfig;
use crate::error::{AgentError, AgentResult};

pub struct CommandExecutor {
    config: AgentConfig,
    supervisors: Mutex<HashMap<String, Supervisor>>,
    /// Shared event channel handed to every supervisor this agent starts.
    events: mpsc::UnboundedSender<SupervisorEvent>,
    outbound: mpsc::UnboundedSender<Envelope>,
    http: reqwest::Client,
}

impl CommandExecutor {
    /// Build the executor and start its event pump.
    pub fn new(config: AgentConfig, outbound: mpsc::UnboundedSender<Envelope>) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(pump_events(
            config.node_id.clone(),
            events_rx,
            outbound.clone(),
        ));
        Arc::new(Self {
            config,
            supervisors: Mutex::new(HashMap::new()),
            events: events_tx,
            outbound,
            http: reqwest::Client::new(),
        })
    }

    /// Route one inbound envelope. Commands run on their own tasks;
    /// only the keepalive reply happens inline.
    pub fn dispatch(self: &Arc<Self>, envelope: Envelope) {
        match envelope.kind {
            MessageType::Ping => {
                self.send(Envelope::bare(MessageType::Pong).with_node(&self.config.node_id));
            }
            MessageType::DeployServer => {
                let this = self.clone();
                tokio::spawn(async move { this.handle_deploy(envelope).await });
            }
            MessageType::StopServer => {
                let this = self.clone();
                tokio::spawn(async move { this.handle_stop(envelope).await });
            }
            MessageType::RestartServer => {
                let this = self.clone();
                tokio::spawn(async move { this.handle_restart(envelope).await });
            }
            MessageType::SendCommand => {
                let this = self.clone();
                tokio::spawn(async move { this.handle_command(envelope).await });
            }
            MessageType::BackupServer => {
                let this = self.clone();
                tokio::spawn(async move { this.handle_backup(envelope).await });
            }
            MessageType::RestoreBackup => {
                let this = self.clone();
                tokio::spawn(async move { this.handle_restore(envelope).await });
            }
            MessageType::Pong => {}
            other => debug!(kind = ?other, "message is not an agent command, ignoring"),
        }
    }

    /// Servers with a live process right now, as `(server_id, pid)`.
    pub fn live_servers(&self) -> Vec<(String, u32)> {
        let supervisors = self.supervisors.lock().unwrap();
        supervisors
            .iter()
            .filter_map(|(id, s)| s.pid().map(|pid| (id.clone(), pid)))
            .collect()
    }

    // ── Command handlers ───────────────────────────────────────────

    async fn handle_deploy(self: Arc<Self>, envelope: Envelope) {
        let spec: DeploySpec = match envelope.payload() {
            Ok(spec) => spec,
            Err(e) => {
                self.report_error(envelope.server_id.as_deref(), format!("bad deploy spec: {e}"));
                return;
            }
        };
        if let Err(e) = self.deploy(&spec).await {
            warn!(server_id = %spec.server_id, error = %e, "deploy failed");
            self.report_error(Some(&spec.server_id), format!("deploy failed: {e}"));
        }
    }

    async fn deploy(&self, spec: &DeploySpec) -> AgentResult<()> {
        if self.is_live(&spec.server_id) {
            return Err(AgentError::Supervisor(
                gantry_supervisor::SupervisorError::AlreadyRunning,
            ));
        }

        let dir = self.server_dir(&spec.server_id);
        tokio::fs::create_dir_all(&dir).await?;
        if let Some(artifact) = &spec.artifact {
            self.stage_artifact(artifact, &dir).await?;
        }

        let mut config = SupervisorConfig::new(&spec.server_id, &spec.executable, &dir);
        config.args = spec.args.clone();
        config.auto_restart = spec.auto_restart;
        config.stop_grace = self.config.stop_grace;
        if let Some(line) = &spec.stop_line {
            config.stop_line = line.clone();
        }

        let supervisor = Supervisor::new(config, self.events.clone());
        let pid = supervisor.start().await?;
        self.supervisors
            .lock()
            .unwrap()
            .insert(spec.server_id.clone(), supervisor);

        let report = serde_json::json!({
            "server_id": spec.server_id,
            "pid": pid,
            "port": spec.port,
        });
        match Envelope::new(MessageType::ServerDeployed, &report) {
            Ok(env) => self.send(
                env.with_server(&spec.server_id)
                    .with_node(&self.config.node_id),
            ),
            Err(e) => debug!(error = %e, "deploy report encode failed"),
        }
        info!(server_id = %spec.server_id, pid, "server deployed");
        Ok(())
    }

    async fn handle_stop(self: Arc<Self>, envelope: Envelope) {
        let Some((server_id, supervisor)) = self.addressed_supervisor(&envelope) else {
            return;
        };
        match supervisor.stop().await {
            Ok(()) => {
                // Explicit ack; the status stream already carried the
                // transition itself.
                self.send(
                    Envelope::bare(MessageType::ServerStopped)
                        .with_server(&server_id)
                        .with_node(&self.config.node_id),
                );
            }
            Err(e) => {
                warn!(%server_id, error = %e, "stop failed");
                self.report_error(Some(&server_id), format!("stop failed: {e}"));
            }
        }
    }

    async fn handle_restart(self: Arc<Self>, envelope: Envelope) {
        let Some((server_id, supervisor)) = self.addressed_supervisor(&envelope) else {
            return;
        };
        if let Err(e) = supervisor.restart().await {
            warn!(%server_id, error = %e, "restart failed");
            self.report_error(Some(&server_id), format!("restart failed: {e}"));
        }
    }

    async fn handle_command(self: Arc<Self>, envelope: Envelope) {
        let Some((server_id, supervisor)) = self.addressed_supervisor(&envelope) else {
            return;
        };
        let payload: CommandPayload = match envelope.payload() {
            Ok(p) => p,
            Err(e) => {
                self.report_error(Some(&server_id), format!("bad command payload: {e}"));
                return;
            }
        };
        if let Err(e) = supervisor.send_command(&payload.command).await {
            self.report_error(Some(&server_id), format!("command failed: {e}"));
        }
    }

    async fn handle_backup(self: Arc<Self>, envelope: Envelope) {
        let Some(server_id) = envelope.server_id.clone() else {
            self.report_error(None, "backup_server without server_id");
            return;
        };
        let req: BackupRequest = match envelope.payload() {
            Ok(r) => r,
            Err(e) => {
                self.report_error(Some(&server_id), format!("bad backup request: {e}"));
                return;
            }
        };

        let source = self.server_dir(&server_id);
        let archive = self
            .config
            .data_dir
            .join("backups")
            .join(format!("{}.tar.gz", req.backup_id));
        let patterns = req.exclude_patterns.clone();
        info!(%server_id, backup_id = %req.backup_id, "backup starting");

        let result = tokio::task::spawn_blocking(move || {
            gantry_backup::create_backup(&source, &archive, &patterns)
        })
        .await;

        let report = match result {
            Ok(Ok(outcome)) => BackupReport {
                backup_id: req.backup_id.clone(),
                archive_path: Some(outcome.archive_path.display().to_string()),
                size_bytes: outcome.size_bytes,
                sha256: Some(outcome.sha256),
                error: None,
            },
            Ok(Err(e)) => failed_report(&req.backup_id, e.to_string()),
            Err(e) => failed_report(&req.backup_id, format!("backup task failed: {e}")),
        };
        self.send_backup_report(&server_id, report);
    }

    async fn handle_restore(self: Arc<Self>, envelope: Envelope) {
        let Some(server_id) = envelope.server_id.clone() else {
            self.report_error(None, "restore_backup without server_id");
            return;
        };
        let req: RestoreRequest = match envelope.payload() {
            Ok(r) => r,
            Err(e) => {
                self.report_error(Some(&server_id), format!("bad restore request: {e}"));
                return;
            }
        };
        // A live process would have its files replaced out from under it.
        if self.is_live(&server_id) {
            self.send_backup_report(
                &server_id,
                failed_report(&req.backup_id, "server is running; stop it before restoring"),
            );
            return;
        }

        let archive = PathBuf::from(&req.archive_path);
        let target = self.server_dir(&server_id);
        let sha256 = req.sha256.clone();
        info!(%server_id, backup_id = %req.backup_id, "restore starting");

        let result = tokio::task::spawn_blocking(move || {
            gantry_backup::restore_backup(&archive, &target, sha256.as_deref())
        })
        .await;

        let report = match result {
            Ok(Ok(outcome)) => {
                if let Some(safety) = outcome.safety_copy {
                    // Restore succeeded; the previous contents can go.
                    if let Err(e) = tokio::fs::remove_dir_all(&safety).await {
                        warn!(
                            safety_copy = %safety.display(),
                            error = %e,
                            "could not remove pre-restore copy"
                        );
                    }
                }
                BackupReport {
                    backup_id: req.backup_id.clone(),
                    archive_path: Some(req.archive_path.clone()),
                    size_bytes: 0,
                    sha256: req.sha256.clone(),
                    error: None,
                }
            }
            Ok(Err(e)) => failed_report(&req.backup_id, e.to_string()),
            Err(e) => failed_report(&req.backup_id, format!("restore task failed: {e}")),
        };
        self.send_backup_report(&server_id, report);
    }

    // ── Artifact staging ───────────────────────────────────────────

    /// Place the runnable artifact into the server's working directory.
    ///
    /// `file://` paths are copied; `http(s)://` URLs are fetched and
    /// written via a `.partial` rename so a dropped transfer never leaves
    /// a truncated artifact under the real name.
    async fn stage_artifact(&self, source: &str, dir: &Path) -> AgentResult<()> {
        if let Some(path) = source.strip_prefix("file://") {
            let src = Path::new(path);
            let name = src
                .file_name()
                .ok_or_else(|| AgentError::Artifact(format!("no file name in {source}")))?;
            tokio::fs::copy(src, dir.join(name)).await?;
            debug!(%source, "artifact copied");
            return Ok(());
        }
        if source.starts_with("http://") || source.starts_with("https://") {
            let name = source
                .rsplit('/')
                .next()
                .filter(|n| !n.is_empty())
                .unwrap_or("artifact.bin");
            let bytes = self
                .http
                .get(source)
                .send()
                .await?
                .error_for_status()?
                .bytes()
                .await?;
            let target = dir.join(name);
            let partial = PathBuf::from(format!("{}.partial", target.display()));
            tokio::fs::write(&partial, &bytes).await?;
            tokio::fs::rename(&partial, &target).await?;
            debug!(%source, size = bytes.len(), "artifact fetched");
            return Ok(());
        }
        Err(AgentError::Artifact(format!(
            "unsupported artifact scheme: {source}"
        )))
    }

    // ── Helpers ────────────────────────────────────────────────────

    fn server_dir(&self, server_id: &str) -> PathBuf {
        self.config.data_dir.join("servers").join(server_id)
    }

    fn supervisor(&self, server_id: &str) -> Option<Supervisor> {
        self.supervisors.lock().unwrap().get(server_id).cloned()
    }

    fn is_live(&self, server_id: &str) -> bool {
        self.supervisor(server_id)
            .map(|s| {
                matches!(
                    s.status(),
                    ServerStatus::Starting | ServerStatus::Running | ServerStatus::Stopping
                )
            })
            .unwrap_or(false)
    }

    /// Resolve the supervisor an envelope addresses, reporting an error
    /// envelope when the id is missing or unknown.
    fn addressed_supervisor(&self, envelope: &Envelope) -> Option<(String, Supervisor)> {
        let Some(server_id) = envelope.server_id.clone() else {
            self.report_error(None, format!("{:?} without server_id", envelope.kind));
            return None;
        };
        match self.supervisor(&server_id) {
            Some(supervisor) => Some((server_id, supervisor)),
            None => {
                self.report_error(Some(&server_id), format!("unknown server {server_id}"));
                None
            }
        }
    }

    fn send(&self, envelope: Envelope) {
        if self.outbound.send(envelope).is_err() {
            debug!("outbound channel closed, dropping message");
        }
    }

    fn send_backup_report(&self, server_id: &str, report: BackupReport) {
        let kind = if report.error.is_none() {
            MessageType::BackupCompleted
        } else {
            MessageType::BackupFailed
        };
        if let Some(error) = &report.error {
            warn!(%server_id, backup_id = %report.backup_id, %error, "backup operation failed");
        } else {
            info!(%server_id, backup_id = %report.backup_id, "backup operation completed");
        }
        match Envelope::new(kind, &report) {
            Ok(env) => self.send(env.with_server(server_id).with_node(&self.config.node_id)),
            Err(e) => debug!(error = %e, "backup report encode failed"),
        }
    }

    /// Faults go back to the control plane instead of crashing the agent.
    fn report_error(&self, server_id: Option<&str>, message: impl Into<String>) {
        let mut envelope = Envelope::error(message).with_node(&self.config.node_id);
        if let Some(id) = server_id {
            envelope = envelope.with_server(id);
        }
        self.send(envelope);
    }
}

fn failed_report(backup_id: &str, error: impl Into<String>) -> BackupReport {
    BackupReport {
        backup_id: backup_id.to_string(),
        archive_path: None,
        size_bytes: 0,
        sha256: None,
        error: Some(error.into()),
    }
}

/// Translate supervisor events into bus envelopes until the agent exits.
async fn pump_events(
    node_id: String,
    mut events: mpsc::UnboundedReceiver<SupervisorEvent>,
    outbound: mpsc::UnboundedSender<Envelope>,
) {
    while let Some(event) = events.recv().await {
        let envelope = match event {
            SupervisorEvent::Status {
                server_id,
                status,
                pid,
                reason,
            } => Envelope::new(MessageType::ServerStatus, &StatusUpdate { status, pid, reason })
                .map(|e| e.with_server(server_id).with_node(&node_id)),
            SupervisorEvent::Console {
                server_id,
                stream,
                line,
            } => Envelope::new(
                MessageType::ConsoleLog,
                &ConsoleLine {
                    stream: stream.as_str().to_string(),
                    line,
                },
            )
            .map(|e| e.with_server(server_id).with_node(&node_id)),
        };
        match envelope {
            Ok(env) => {
                if outbound.send(env).is_err() {
                    break;
                }
            }
            Err(e) => debug!(error = %e, "supervisor event encode failed"),
        }
    }
}
