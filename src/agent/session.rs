//! # Agent Session
//!
//! WebSocket client to the coordinator: registers, heartbeats, receives
//! dispatch commands and returns results. A single writer task owns the sink;
//! job execution runs in spawned workers gated by a semaphore. On any
//! transport failure the session reconnects with jittered exponential
//! backoff, forever, re-registering under the same agent id.

use anyhow::{anyhow, Context, Result};
use base64::Engine;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{executor, inventory};
use crate::protocol::{unix_time, Frame};

const REGISTER_DEADLINE: Duration = Duration::from_secs(10);
const WRITER_QUEUE: usize = 64;

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);
const BACKOFF_FACTOR: f64 = 2.0;
const BACKOFF_JITTER: f64 = 0.2;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub coordinator_url: String,
    pub agent_id: String,
    pub hostname: String,
    pub agent_version: String,
    pub max_in_flight: usize,
    pub heartbeat_interval: Duration,
    /// Report these addresses instead of scanning interfaces
    pub advertise_addresses: Option<Vec<String>>,
}

enum SessionEnd {
    /// Local shutdown requested
    Shutdown,
    /// Coordinator drained us; do not reconnect
    Drained,
    /// Transport died; reconnect
    Transport(String),
}

/// Jittered exponential backoff for the reconnect loop
struct Backoff {
    attempt: u32,
}

impl Backoff {
    fn new() -> Self {
        Self { attempt: 0 }
    }

    fn next_delay(&mut self) -> Duration {
        let exp = BACKOFF_BASE.as_secs_f64() * BACKOFF_FACTOR.powi(self.attempt as i32);
        self.attempt = self.attempt.saturating_add(1);
        let capped = exp.min(BACKOFF_CAP.as_secs_f64());
        let jitter = 1.0 + BACKOFF_JITTER * (rand::random::<f64>() * 2.0 - 1.0);
        Duration::from_secs_f64(capped * jitter)
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Resolve the control-plane endpoint from the configured coordinator URL
fn ws_endpoint(coordinator_url: &str) -> Result<url::Url> {
    let mut endpoint = url::Url::parse(coordinator_url)
        .with_context(|| format!("invalid coordinator url {coordinator_url}"))?
        .join("/ws/agent")
        .context("cannot derive /ws/agent endpoint")?;
    let scheme = match endpoint.scheme() {
        "ws" | "wss" => return Ok(endpoint),
        "http" => "ws",
        "https" => "wss",
        other => return Err(anyhow!("unsupported coordinator url scheme {other}")),
    };
    endpoint
        .set_scheme(scheme)
        .map_err(|_| anyhow!("cannot rewrite scheme"))?;
    Ok(endpoint)
}

fn current_addresses(config: &SessionConfig) -> Vec<String> {
    match &config.advertise_addresses {
        Some(addresses) => addresses.clone(),
        None => inventory::scan(),
    }
}

/// Run the session until shutdown or drain; reconnects on transport failure
pub async fn run(config: SessionConfig, shutdown: CancellationToken) -> Result<()> {
    let endpoint = ws_endpoint(&config.coordinator_url)?;
    let mut backoff = Backoff::new();

    loop {
        match run_session(&config, &endpoint, &shutdown, &mut backoff).await {
            Ok(SessionEnd::Shutdown) => return Ok(()),
            Ok(SessionEnd::Drained) => {
                info!("drained by coordinator, exiting");
                return Ok(());
            }
            Ok(SessionEnd::Transport(reason)) => {
                warn!(reason, "coordinator connection lost");
            }
            Err(err) => {
                warn!(error = %err, "coordinator connection failed");
            }
        }

        if shutdown.is_cancelled() {
            return Ok(());
        }
        let delay = backoff.next_delay();
        info!(delay_ms = delay.as_millis() as u64, "reconnecting");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.cancelled() => return Ok(()),
        }
    }
}

async fn run_session(
    config: &SessionConfig,
    endpoint: &url::Url,
    shutdown: &CancellationToken,
    backoff: &mut Backoff,
) -> Result<SessionEnd> {
    let (socket, _) = connect_async(endpoint.as_str())
        .await
        .with_context(|| format!("connect {endpoint}"))?;
    let (mut sink, mut stream) = socket.split();

    // single writer; workers and the heartbeat share the channel
    let (writer_tx, mut writer_rx) = mpsc::channel::<Frame>(WRITER_QUEUE);
    let writer = tokio::spawn(async move {
        while let Some(frame) = writer_rx.recv().await {
            let text = match frame.encode() {
                Ok(text) => text,
                Err(err) => {
                    warn!(error = %err, "dropping unencodable frame");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let register = Frame::Register {
        agent_id: config.agent_id.clone(),
        hostname: config.hostname.clone(),
        addresses: current_addresses(config),
        agent_version: config.agent_version.clone(),
    };
    writer_tx
        .send(register)
        .await
        .map_err(|_| anyhow!("writer closed before register"))?;

    // wait for the coordinator's ack before doing anything else
    let assigned = tokio::time::timeout(REGISTER_DEADLINE, async {
        while let Some(message) = stream.next().await {
            let Ok(Message::Text(text)) = message else {
                continue;
            };
            if let Some(Frame::Registered {
                assigned_agent_id, ..
            }) = Frame::decode(&text)
            {
                return Some(assigned_agent_id);
            }
        }
        None
    })
    .await
    .context("no registered ack before deadline")?
    .ok_or_else(|| anyhow!("socket closed during registration"))?;

    if assigned != config.agent_id {
        warn!(assigned, "coordinator assigned a different agent id");
    }
    info!(agent_id = %assigned, "registered with coordinator");
    backoff.reset();

    let semaphore = Arc::new(Semaphore::new(config.max_in_flight));
    let mut heartbeat = tokio::time::interval_at(
        tokio::time::Instant::now() + config.heartbeat_interval,
        config.heartbeat_interval,
    );

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                // workers may still hold writer clones; abort so the socket
                // closes now rather than when they finish
                drop(writer_tx);
                writer.abort();
                return Ok(SessionEnd::Shutdown);
            }
            _ = heartbeat.tick() => {
                let frame = Frame::Heartbeat {
                    addresses: current_addresses(config),
                    ts: unix_time(),
                };
                if writer_tx.send(frame).await.is_err() {
                    return Ok(SessionEnd::Transport("writer closed".to_string()));
                }
            }
            message = stream.next() => {
                let message = match message {
                    Some(Ok(message)) => message,
                    Some(Err(err)) => return Ok(SessionEnd::Transport(err.to_string())),
                    None => return Ok(SessionEnd::Transport("socket closed".to_string())),
                };
                match message {
                    Message::Text(text) => {
                        let Some(frame) = Frame::decode(&text) else { continue };
                        match frame {
                            Frame::Dispatch { job_id, source_ip, method, url, headers, body, timeout_sec } => {
                                let spec = executor::ExecuteSpec { method, url, headers, body, timeout_sec };
                                spawn_worker(
                                    job_id,
                                    source_ip,
                                    spec,
                                    Arc::clone(&semaphore),
                                    writer_tx.clone(),
                                );
                            }
                            Frame::AckHeartbeat { .. } => {
                                debug!("heartbeat acked");
                            }
                            Frame::Drain => {
                                info!("coordinator asked us to drain");
                                break;
                            }
                            other => {
                                debug!(?other, "unexpected frame ignored");
                            }
                        }
                    }
                    Message::Close(_) => return Ok(SessionEnd::Transport("server closed".to_string())),
                    _ => {}
                }
            }
        }
    }

    // draining: no new work accepted; wait for in-flight jobs to finish
    let _all_idle = semaphore
        .acquire_many_owned(config.max_in_flight as u32)
        .await;
    let _ = writer_tx.send(Frame::Drained).await;
    drop(writer_tx);
    let _ = writer.await;
    Ok(SessionEnd::Drained)
}

/// Execute one dispatched job and report the outcome through the writer
fn spawn_worker(
    job_id: uuid::Uuid,
    source_ip: String,
    spec: executor::ExecuteSpec,
    semaphore: Arc<Semaphore>,
    writer_tx: mpsc::Sender<Frame>,
) {
    tokio::spawn(async move {
        let Ok(_permit) = semaphore.acquire_owned().await else {
            return;
        };
        debug!(%job_id, source_ip, url = %spec.url, "executing dispatch");
        let frame = match executor::execute(&source_ip, &spec).await {
            Ok(response) => Frame::JobResult {
                job_id,
                status: response.status,
                response_headers: response.headers,
                response_body_b64: base64::engine::general_purpose::STANDARD
                    .encode(&response.body),
                elapsed_sec: response.elapsed_sec,
            },
            Err(err) => {
                debug!(%job_id, kind = %err.kind, "dispatch failed");
                Frame::JobError {
                    job_id,
                    kind: err.kind,
                    message: err.message,
                }
            }
        };
        if writer_tx.send(frame).await.is_err() {
            warn!(%job_id, "result lost, session writer gone");
        }
    });
}
