//! Process lifecycle — spawn, stream, classify exit, auto-restart.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use gantry_state::ServerStatus;

use crate::console::RollingLog;
use crate::error::{SupervisorError, SupervisorResult};

const DEFAULT_STOP_LINE: &str = "stop";
const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);
const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(5);
const DEFAULT_LOG_MAX_BYTES: u64 = 5 * 1024 * 1024;

/// Launch parameters for one supervised server process.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub server_id: String,
    pub executable: String,
    pub args: Vec<String>,
    /// Working directory of the process; the console log lives here too.
    pub working_dir: PathBuf,
    /// Re-start after a crash (never after a manual stop).
    pub auto_restart: bool,
    /// Line written to stdin to request a graceful shutdown.
    pub stop_line: String,
    /// How long `stop()` waits after the stop line before force-killing.
    pub stop_grace: Duration,
    /// Delay between a crash and the automatic re-start.
    pub restart_delay: Duration,
    pub log_max_bytes: u64,
}

impl SupervisorConfig {
    pub fn new(server_id: &str, executable: &str, working_dir: &Path) -> Self {
        Self {
            server_id: server_id.to_string(),
            executable: executable.to_string(),
            args: Vec::new(),
            working_dir: working_dir.to_path_buf(),
            auto_restart: false,
            stop_line: DEFAULT_STOP_LINE.to_string(),
            stop_grace: DEFAULT_STOP_GRACE,
            restart_delay: DEFAULT_RESTART_DELAY,
            log_max_bytes: DEFAULT_LOG_MAX_BYTES,
        }
    }
}

/// Which pipe a console line arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleStream {
    Stdout,
    Stderr,
}

impl ConsoleStream {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// Everything a supervisor reports while its process runs.
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    /// A lifecycle transition. `reason` is set for every crash.
    Status {
        server_id: String,
        status: ServerStatus,
        pid: Option<u32>,
        reason: Option<String>,
    },
    /// One line of process output.
    Console {
        server_id: String,
        stream: ConsoleStream,
        line: String,
    },
}

struct Inner {
    config: SupervisorConfig,
    status: Mutex<ServerStatus>,
    pid: Mutex<Option<u32>>,
    /// Stdin pipe of the current process generation.
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    /// Force-kill request for the current generation. Taken by `stop()`.
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    /// Exit flag of the current generation; flips to true exactly once.
    exit_rx: Mutex<Option<watch::Receiver<bool>>>,
    /// Set by `stop()`; suppresses the auto-restart path.
    manual_stop: AtomicBool,
    restart_count: AtomicU32,
    /// Serializes stop/restart/send_command (and start) per supervisor.
    control: tokio::sync::Mutex<()>,
    events: mpsc::UnboundedSender<SupervisorEvent>,
}

impl Inner {
    fn set_status(&self, status: ServerStatus, pid: Option<u32>, reason: Option<String>) {
        *self.status.lock().unwrap() = status;
        let _ = self.events.send(SupervisorEvent::Status {
            server_id: self.config.server_id.clone(),
            status,
            pid,
            reason,
        });
    }
}

/// Owns one game-server OS process.
///
/// Cheap to clone; all clones drive the same process.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, events: mpsc::UnboundedSender<SupervisorEvent>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                status: Mutex::new(ServerStatus::Stopped),
                pid: Mutex::new(None),
                stdin: tokio::sync::Mutex::new(None),
                kill_tx: Mutex::new(None),
                exit_rx: Mutex::new(None),
                manual_stop: AtomicBool::new(false),
                restart_count: AtomicU32::new(0),
                control: tokio::sync::Mutex::new(()),
                events,
            }),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.inner.config.server_id
    }

    pub fn status(&self) -> ServerStatus {
        *self.inner.status.lock().unwrap()
    }

    pub fn pid(&self) -> Option<u32> {
        *self.inner.pid.lock().unwrap()
    }

    /// How many times the crash path has re-started this process.
    pub fn restart_count(&self) -> u32 {
        self.inner.restart_count.load(Ordering::SeqCst)
    }

    /// Launch the process. Fails with `AlreadyRunning` if it is live.
    pub async fn start(&self) -> SupervisorResult<u32> {
        let _guard = self.inner.control.lock().await;
        spawn_locked(&self.inner).await
    }

    /// Graceful stop: write the stop line, wait out the grace period,
    /// force-kill if still alive. Always leaves the record `stopped`.
    pub async fn stop(&self) -> SupervisorResult<()> {
        let _guard = self.inner.control.lock().await;
        stop_locked(&self.inner).await
    }

    /// `stop()` then `start()`. Also starts a server that was not running.
    pub async fn restart(&self) -> SupervisorResult<u32> {
        let _guard = self.inner.control.lock().await;
        match stop_locked(&self.inner).await {
            Ok(()) | Err(SupervisorError::NotRunning) => {}
            Err(e) => return Err(e),
        }
        spawn_locked(&self.inner).await
    }

    /// Write one newline-terminated line to the process stdin.
    pub async fn send_command(&self, line: &str) -> SupervisorResult<()> {
        let _guard = self.inner.control.lock().await;
        if *self.inner.status.lock().unwrap() != ServerStatus::Running {
            return Err(SupervisorError::NotRunning);
        }
        let mut stdin = self.inner.stdin.lock().await;
        let pipe = stdin.as_mut().ok_or(SupervisorError::NotRunning)?;
        pipe.write_all(format!("{line}\n").as_bytes()).await?;
        pipe.flush().await?;
        Ok(())
    }
}

/// Spawn the process and wire up readers and the exit waiter.
/// Caller holds the control lock.
///
/// Boxed future: the fn is indirectly recursive (`wait_for_exit`'s
/// auto-restart task awaits it), which an `async fn` cannot express.
fn spawn_locked<'a>(
    inner: &'a Arc<Inner>,
) -> Pin<Box<dyn Future<Output = SupervisorResult<u32>> + Send + 'a>> {
    Box::pin(async move {
        {
            let status = inner.status.lock().unwrap();
            if matches!(
                *status,
                ServerStatus::Starting | ServerStatus::Running | ServerStatus::Stopping
            ) {
                return Err(SupervisorError::AlreadyRunning);
            }
        }

        inner.manual_stop.store(false, Ordering::SeqCst);
        inner.set_status(ServerStatus::Starting, None, None);

        let mut cmd = Command::new(&inner.config.executable);
        cmd.args(&inner.config.args)
            .current_dir(&inner.config.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                inner.set_status(
                    ServerStatus::Stopped,
                    None,
                    Some(format!("spawn failed: {e}")),
                );
                return Err(SupervisorError::Spawn(e));
            }
        };
        let pid = child.id().unwrap_or(0);

        *inner.stdin.lock().await = child.stdin.take();

        let log_path = inner.config.working_dir.join("console.log");
        let log = Arc::new(tokio::sync::Mutex::new(
            RollingLog::open(log_path, inner.config.log_max_bytes).await,
        ));
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(inner.clone(), stdout, ConsoleStream::Stdout, log.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(inner.clone(), stderr, ConsoleStream::Stderr, log);
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(false);
        *inner.kill_tx.lock().unwrap() = Some(kill_tx);
        *inner.exit_rx.lock().unwrap() = Some(exit_rx);
        *inner.pid.lock().unwrap() = Some(pid);

        inner.set_status(ServerStatus::Running, Some(pid), None);
        info!(
            server_id = %inner.config.server_id,
            pid,
            executable = %inner.config.executable,
            "server process started"
        );

        tokio::spawn(wait_for_exit(inner.clone(), child, kill_rx, exit_tx));
        Ok(pid)
    })
}

/// Caller holds the control lock.
async fn stop_locked(inner: &Arc<Inner>) -> SupervisorResult<()> {
    // Set before the liveness check: a stop on a crashed server must still
    // cancel its pending auto-restart.
    inner.manual_stop.store(true, Ordering::SeqCst);

    let mut exit_rx = {
        let guard = inner.exit_rx.lock().unwrap();
        match guard.as_ref() {
            Some(rx) if !*rx.borrow() => rx.clone(),
            _ => return Err(SupervisorError::NotRunning),
        }
    };

    let pid = *inner.pid.lock().unwrap();
    inner.set_status(ServerStatus::Stopping, pid, None);

    {
        let mut stdin = inner.stdin.lock().await;
        if let Some(pipe) = stdin.as_mut() {
            let line = format!("{}\n", inner.config.stop_line);
            match pipe.write_all(line.as_bytes()).await {
                Ok(()) => {
                    let _ = pipe.flush().await;
                }
                Err(e) => debug!(
                    server_id = %inner.config.server_id,
                    error = %e,
                    "stop line not delivered"
                ),
            }
        }
    }

    let graceful = tokio::time::timeout(inner.config.stop_grace, exit_rx.wait_for(|e| *e))
        .await
        .is_ok();
    if !graceful {
        warn!(
            server_id = %inner.config.server_id,
            grace_secs = inner.config.stop_grace.as_secs(),
            "grace period expired, force-killing"
        );
        if let Some(tx) = inner.kill_tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
        let _ = exit_rx.wait_for(|e| *e).await;
    }
    Ok(())
}

fn spawn_reader<R>(
    inner: Arc<Inner>,
    stream: R,
    kind: ConsoleStream,
    log: Arc<tokio::sync::Mutex<RollingLog>>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            {
                let mut log = log.lock().await;
                if let Err(e) = log.append(kind.as_str(), &line).await {
                    debug!(
                        server_id = %inner.config.server_id,
                        error = %e,
                        "console log write failed"
                    );
                }
            }
            let _ = inner.events.send(SupervisorEvent::Console {
                server_id: inner.config.server_id.clone(),
                stream: kind,
                line,
            });
        }
    });
}

/// Owns the child until it exits; classifies the exit and drives the
/// auto-restart path.
async fn wait_for_exit(
    inner: Arc<Inner>,
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<bool>,
) {
    let mut forced = false;
    let result = tokio::select! {
        status = child.wait() => status,
        _ = kill_rx => {
            forced = true;
            if let Err(e) = child.kill().await {
                warn!(server_id = %inner.config.server_id, error = %e, "force kill failed");
            }
            child.wait().await
        }
    };

    *inner.pid.lock().unwrap() = None;
    *inner.stdin.lock().await = None;
    inner.kill_tx.lock().unwrap().take();

    let manual = inner.manual_stop.load(Ordering::SeqCst);
    let clean = matches!(&result, Ok(es) if es.success());
    let (next, reason) = if clean || manual || forced {
        (ServerStatus::Stopped, None)
    } else {
        let why = match &result {
            Ok(es) => match es.code() {
                Some(code) => format!("exit code {code}"),
                None => "terminated by signal".to_string(),
            },
            Err(e) => format!("wait failed: {e}"),
        };
        (ServerStatus::Crashed, Some(why))
    };

    match &reason {
        Some(why) => warn!(
            server_id = %inner.config.server_id,
            reason = %why,
            "server process crashed"
        ),
        None => info!(server_id = %inner.config.server_id, "server process stopped"),
    }
    inner.set_status(next, None, reason);
    let _ = exit_tx.send(true);

    if next == ServerStatus::Crashed && inner.config.auto_restart {
        tokio::spawn(async move {
            tokio::time::sleep(inner.config.restart_delay).await;
            let _guard = inner.control.lock().await;
            if inner.manual_stop.load(Ordering::SeqCst) {
                debug!(server_id = %inner.config.server_id, "auto-restart cancelled by stop");
                return;
            }
            if *inner.status.lock().unwrap() != ServerStatus::Crashed {
                return;
            }
            let attempt = inner.restart_count.fetch_add(1, Ordering::SeqCst) + 1;
            info!(
                server_id = %inner.config.server_id,
                attempt,
                "auto-restarting crashed server"
            );
            if let Err(e) = spawn_locked(&inner).await {
                warn!(
                    server_id = %inner.config.server_id,
                    error = %e,
                    "auto-restart failed"
                );
            }
        });
    }
}
