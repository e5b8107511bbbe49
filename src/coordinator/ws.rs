//! # Agent Control Plane (`/ws/agent`)
//!
//! One WebSocket per agent session. The first frame must be `register`; after
//! that the socket carries heartbeats and job traffic. All outbound frames go
//! through a single writer task fed by an mpsc channel; readers and the
//! dispatcher never touch the sink directly.

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::coordinator::CoordinatorState;
use crate::protocol::{unix_time, Frame};
use crate::types::ErrorKind;

/// How long a fresh socket may stay silent before it must have registered
const REGISTER_DEADLINE: Duration = Duration::from_secs(10);

/// Outbound frames buffered per session before backpressure hits the sender
const WRITER_QUEUE: usize = 64;

pub async fn ws_handler(
    State(state): State<Arc<CoordinatorState>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_session(state, socket))
}

async fn handle_session(state: Arc<CoordinatorState>, socket: WebSocket) {
    state.registry.socket_opened();
    run_session(&state, socket).await;
    state.registry.socket_closed();
}

async fn run_session(state: &Arc<CoordinatorState>, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();

    // registration handshake
    let registration = tokio::time::timeout(REGISTER_DEADLINE, async {
        while let Some(Ok(message)) = stream.next().await {
            if let Message::Text(text) = message {
                match Frame::decode(&text) {
                    Some(Frame::Register {
                        agent_id,
                        hostname,
                        addresses,
                        agent_version,
                    }) => return Some((agent_id, hostname, addresses, agent_version)),
                    Some(other) => {
                        debug!(?other, "frame before register, ignoring");
                    }
                    None => {}
                }
            }
        }
        None
    })
    .await;

    let Ok(Some((agent_id, hostname, addresses, agent_version))) = registration else {
        debug!("socket closed before registration");
        let _ = sink
            .send(Message::Close(Some(close_frame("registration required"))))
            .await;
        return;
    };

    let (writer_tx, mut writer_rx) = mpsc::channel::<Frame>(WRITER_QUEUE);
    let session_token = state.shutdown.child_token();
    let epoch = match state.registry.register(
        &agent_id,
        hostname,
        agent_version,
        addresses,
        writer_tx.clone(),
        session_token.clone(),
    ) {
        Ok((epoch, replaced)) => {
            if replaced {
                // the displaced session's jobs die with it; the new session
                // starts clean
                state.pending.fail_agent(
                    &agent_id,
                    Some(epoch),
                    ErrorKind::AgentReplaced,
                    "agent re-registered from a new connection",
                );
            }
            epoch
        }
        Err(err) => {
            warn!(agent_id, error = %err, "registration rejected");
            let _ = sink
                .send(Message::Close(Some(close_frame(&err.to_string()))))
                .await;
            return;
        }
    };

    // single writer per socket
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

    let registered = Frame::Registered {
        assigned_agent_id: agent_id.clone(),
        server_time: unix_time(),
    };
    if writer_tx.send(registered).await.is_err() {
        state.registry.disconnect(&agent_id, epoch);
        return;
    }

    // receive loop: frames from one agent are processed in receipt order
    loop {
        let message = tokio::select! {
            message = stream.next() => message,
            _ = session_token.cancelled() => {
                debug!(agent_id, "session cancelled, closing socket");
                break;
            }
        };
        let Some(message) = message else { break };
        let message = match message {
            Ok(message) => message,
            Err(err) => {
                debug!(agent_id, error = %err, "socket error");
                break;
            }
        };
        match message {
            Message::Text(text) => {
                let Some(frame) = Frame::decode(&text) else {
                    continue;
                };
                if handle_frame(state, &agent_id, epoch, &writer_tx, frame).await {
                    break;
                }
            }
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => break,
            Message::Binary(_) => {
                debug!(agent_id, "ignoring binary frame");
            }
        }
    }

    // the writer ends once the last sender is dropped (registry cleanup
    // removes its clone)
    if state.registry.disconnect(&agent_id, epoch) {
        // only this session's jobs; a concurrently registered replacement
        // session keeps its own
        state.pending.fail_agent(
            &agent_id,
            Some(epoch + 1),
            ErrorKind::AgentLost,
            "agent disconnected while job pending",
        );
    }
    drop(writer_tx);
    let _ = writer.await;
}

/// Returns true when the session should end
async fn handle_frame(
    state: &Arc<CoordinatorState>,
    agent_id: &str,
    epoch: u64,
    writer_tx: &mpsc::Sender<Frame>,
    frame: Frame,
) -> bool {
    match frame {
        Frame::Heartbeat { addresses, ts } => {
            if !state.registry.heartbeat(agent_id, epoch, addresses) {
                info!(agent_id, "heartbeat from displaced session, closing");
                return true;
            }
            let _ = writer_tx.send(Frame::AckHeartbeat { ts }).await;
            false
        }
        Frame::JobResult {
            job_id,
            status,
            response_headers,
            response_body_b64,
            elapsed_sec,
        } => {
            use base64::Engine;
            let body = base64::engine::general_purpose::STANDARD
                .decode(response_body_b64.as_bytes())
                .unwrap_or_default();
            state.pending.complete(
                job_id,
                Ok(crate::types::AgentResponse {
                    status,
                    headers: response_headers,
                    body,
                    elapsed_sec,
                }),
            );
            false
        }
        Frame::JobError {
            job_id,
            kind,
            message,
        } => {
            state
                .pending
                .complete(job_id, Err(crate::types::JobError::new(kind, message)));
            false
        }
        Frame::Drained => {
            info!(agent_id, "agent drained, closing session");
            true
        }
        Frame::Register { .. } => {
            debug!(agent_id, "duplicate register frame ignored");
            false
        }
        other => {
            debug!(agent_id, ?other, "unexpected frame ignored");
            false
        }
    }
}

fn close_frame(reason: &str) -> CloseFrame<'static> {
    CloseFrame {
        code: axum::extract::ws::close_code::POLICY,
        reason: reason.to_string().into(),
    }
}
