//! # WebSocket Control-Plane Frames
//!
//! JSON text frames exchanged between coordinator and agent, one message per
//! frame, discriminated by a `type` field. Unknown frame types are tolerated
//! by the decoder so newer peers can talk to older ones.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::types::ErrorKind;

/// A control frame on the agent WebSocket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// First frame from agent after connecting
    Register {
        agent_id: String,
        hostname: String,
        addresses: Vec<String>,
        agent_version: String,
    },
    /// Coordinator reply to `register`
    Registered {
        assigned_agent_id: String,
        server_time: f64,
    },
    /// Coordinator hands a job to the agent
    Dispatch {
        job_id: Uuid,
        source_ip: String,
        method: String,
        url: String,
        #[serde(default)]
        headers: IndexMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<serde_json::Value>,
        timeout_sec: f64,
    },
    /// Agent reports a completed request
    #[serde(rename = "result")]
    JobResult {
        job_id: Uuid,
        status: u16,
        response_headers: IndexMap<String, String>,
        response_body_b64: String,
        elapsed_sec: f64,
    },
    /// Agent reports a failed request
    #[serde(rename = "error")]
    JobError {
        job_id: Uuid,
        kind: ErrorKind,
        message: String,
    },
    /// Periodic liveness frame, carrying the agent's current inventory
    Heartbeat { addresses: Vec<String>, ts: f64 },
    AckHeartbeat { ts: f64 },
    /// Coordinator asks the agent to finish in-flight work and disconnect
    Drain,
    Drained,
}

impl Frame {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode one text frame. Returns `None` for malformed JSON or an
    /// unknown `type` tag; both are logged and skipped (forward compat).
    pub fn decode(text: &str) -> Option<Frame> {
        match serde_json::from_str::<Frame>(text) {
            Ok(frame) => Some(frame),
            Err(err) => {
                let kind = serde_json::from_str::<serde_json::Value>(text)
                    .ok()
                    .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(String::from));
                debug!(frame_type = ?kind, error = %err, "ignoring undecodable control frame");
                None
            }
        }
    }
}

/// Current unix time as fractional seconds, for `server_time` / heartbeat `ts`
pub fn unix_time() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
