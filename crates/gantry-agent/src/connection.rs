//! Outbound control-plane link.
//!
//! The agent dials the control plane, sends a `node_registration` envelope
//! as the first frame, then multiplexes three flows over the socket:
//! periodic resource reports, queued outbound envelopes from the executor,
//! and inbound commands. A lost link is retried with doubling backoff
//! (capped), and every reconnect re-sends the registration. Outbound
//! envelopes queue in the channel while the link is down.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use gantry_bus::envelope::{
    Envelope, MessageType, ProcessStats, RegistrationPayload, resource_update,
};
use gantry_state::ResourceSnapshot;

use crate::AgentConfig;
use crate::error::AgentResult;
use crate::executor::CommandExecutor;
use crate::sampler::ResourceSampler;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Why one connection generation ended.
enum Disconnect {
    Shutdown,
    Lost(tokio_tungstenite::tungstenite::Error),
    Closed,
}

pub struct AgentConnection {
    config: AgentConfig,
    capabilities: BTreeSet<String>,
    executor: Arc<CommandExecutor>,
    /// Latest snapshot, shared with the local health endpoint.
    resources: watch::Sender<Option<ResourceSnapshot>>,
}

impl AgentConnection {
    pub fn new(
        config: AgentConfig,
        capabilities: BTreeSet<String>,
        executor: Arc<CommandExecutor>,
        resources: watch::Sender<Option<ResourceSnapshot>>,
    ) -> Self {
        Self {
            config,
            capabilities,
            executor,
            resources,
        }
    }

    /// Dial-and-serve loop; returns only on shutdown.
    pub async fn run(
        &self,
        mut outbound: mpsc::UnboundedReceiver<Envelope>,
        mut shutdown: watch::Receiver<bool>,
    ) -> AgentResult<()> {
        let mut sampler = ResourceSampler::new(&self.config.data_dir);
        let mut backoff = INITIAL_BACKOFF;
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            match connect_async(&self.config.control_plane_url).await {
                Ok((ws, _response)) => {
                    info!(url = %self.config.control_plane_url, "control plane connected");
                    backoff = INITIAL_BACKOFF;
                    match self
                        .serve(ws, &mut sampler, &mut outbound, &mut shutdown)
                        .await
                    {
                        Disconnect::Shutdown => return Ok(()),
                        Disconnect::Lost(e) => warn!(error = %e, "control plane link lost"),
                        Disconnect::Closed => warn!("control plane closed the connection"),
                    }
                }
                Err(e) => {
                    warn!(error = %e, retry_in = ?backoff, "control plane unreachable");
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.changed() => return Ok(()),
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// Serve one connection generation until it drops or shutdown.
    async fn serve(
        &self,
        ws: WsStream,
        sampler: &mut ResourceSampler,
        outbound: &mut mpsc::UnboundedReceiver<Envelope>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Disconnect {
        let (mut sink, mut source) = ws.split();

        // Registration is the first frame of every generation.
        let registration = RegistrationPayload {
            node_id: self.config.node_id.clone(),
            name: self.config.name.clone(),
            location: self.config.location.clone(),
            capabilities: self.capabilities.clone(),
            token: self.config.token.clone(),
        };
        let handshake = match Envelope::new(MessageType::NodeRegistration, &registration) {
            Ok(env) => env.with_node(&self.config.node_id),
            Err(e) => {
                debug!(error = %e, "registration encode failed");
                return Disconnect::Closed;
            }
        };
        if let Err(e) = send_envelope(&mut sink, &handshake).await {
            return Disconnect::Lost(e);
        }

        // First tick fires immediately, so a fresh connect reports at once.
        let mut report = tokio::time::interval(self.config.report_interval);
        loop {
            tokio::select! {
                _ = report.tick() => {
                    let snapshot = sampler.sample();
                    let _ = self.resources.send(Some(snapshot.clone()));
                    match resource_update(&self.config.node_id, &snapshot) {
                        Ok(env) => {
                            if let Err(e) = send_envelope(&mut sink, &env).await {
                                return Disconnect::Lost(e);
                            }
                        }
                        Err(e) => debug!(error = %e, "resource report encode failed"),
                    }
                    if let Err(e) = self.report_process_stats(sampler, &mut sink).await {
                        return Disconnect::Lost(e);
                    }
                }
                queued = outbound.recv() => {
                    match queued {
                        Some(env) => {
                            if let Err(e) = send_envelope(&mut sink, &env).await {
                                return Disconnect::Lost(e);
                            }
                        }
                        None => return Disconnect::Closed,
                    }
                }
                frame = source.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            match Envelope::from_json(text.as_str()) {
                                Ok(env) => self.executor.dispatch(env),
                                Err(e) => warn!(error = %e, "undecodable control message"),
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            if let Err(e) = sink.send(Message::Pong(payload)).await {
                                return Disconnect::Lost(e);
                            }
                        }
                        Some(Ok(Message::Close(_))) => return Disconnect::Closed,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Disconnect::Lost(e),
                        None => return Disconnect::Closed,
                    }
                }
                _ = shutdown.changed() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Disconnect::Shutdown;
                }
            }
        }
    }

    /// Per-process usage for every live server, piggybacked on the
    /// resource report tick.
    async fn report_process_stats(
        &self,
        sampler: &mut ResourceSampler,
        sink: &mut WsSink,
    ) -> Result<(), tokio_tungstenite::tungstenite::Error> {
        for (server_id, pid) in self.executor.live_servers() {
            let Some((cpu_percent, memory_bytes)) = sampler.process_stats(pid) else {
                continue;
            };
            let stats = ProcessStats {
                cpu_percent,
                memory_bytes,
            };
            match Envelope::new(MessageType::ServerStats, &stats) {
                Ok(env) => {
                    let env = env.with_server(server_id).with_node(&self.config.node_id);
                    send_envelope(sink, &env).await?;
                }
                Err(e) => debug!(error = %e, "stats encode failed"),
            }
        }
        Ok(())
    }
}

/// Envelopes that fail to encode are dropped, not fatal to the link.
async fn send_envelope(
    sink: &mut WsSink,
    envelope: &Envelope,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    match envelope.to_json() {
        Ok(json) => sink.send(Message::text(json)).await,
        Err(e) => {
            debug!(error = %e, kind = ?envelope.kind, "envelope encode failed, dropping");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn expect_envelope(
        ws: &mut WebSocketStream<TcpStream>,
        kind: MessageType,
    ) -> Envelope {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let frame = ws
                    .next()
                    .await
                    .expect("socket closed early")
                    .expect("frame error");
                if let Message::Text(text) = frame {
                    let env = Envelope::from_json(text.as_str()).expect("bad envelope");
                    if env.kind == kind {
                        return env;
                    }
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {kind:?}"))
    }

    #[tokio::test]
    async fn registers_reports_and_reconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dir = tempfile::tempdir().unwrap();

        let mut config =
            AgentConfig::new("node-9", &format!("ws://{addr}/ws/agent"), dir.path());
        config.report_interval = Duration::from_millis(200);

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (resources_tx, resources_rx) = watch::channel(None);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let executor = CommandExecutor::new(config.clone(), outbound_tx);
        let connection = AgentConnection::new(
            config,
            BTreeSet::from(["java-runtime".to_string()]),
            executor,
            resources_tx,
        );
        let agent = tokio::spawn(async move { connection.run(outbound_rx, shutdown_rx).await });

        // First generation: registration frame, then resource reports.
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let reg = expect_envelope(&mut ws, MessageType::NodeRegistration).await;
        let payload: RegistrationPayload = reg.payload().unwrap();
        assert_eq!(payload.node_id, "node-9");
        assert!(payload.capabilities.contains("java-runtime"));

        expect_envelope(&mut ws, MessageType::ResourceUpdate).await;
        assert!(resources_rx.borrow().is_some());

        // The control plane's keepalive is answered in kind.
        let ping = Envelope::bare(MessageType::Ping).to_json().unwrap();
        ws.send(Message::text(ping)).await.unwrap();
        let pong = expect_envelope(&mut ws, MessageType::Pong).await;
        assert_eq!(pong.node_id.as_deref(), Some("node-9"));

        // Kill the link; the agent must come back and register again.
        drop(ws);
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        expect_envelope(&mut ws, MessageType::NodeRegistration).await;

        shutdown_tx.send(true).unwrap();
        agent.await.unwrap().unwrap();
    }
}
