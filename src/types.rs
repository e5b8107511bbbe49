//! # Core Types and Data Structures
//!
//! Shared types for both coordinator and agent: the job model and its
//! lifecycle, the source-IP pool entries, the stored request template, and
//! the error taxonomy surfaced to API callers.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier for a connected agent
pub type AgentId = String;

/// Ordered request/response header map
pub type HeaderMap = IndexMap<String, String>;

/// Default job timeout in seconds
pub const DEFAULT_TIMEOUT_SECS: f64 = 30.0;

/// Largest accepted job timeout in seconds. Bounds caller-supplied values
/// before they reach `Duration::from_secs_f64`, which panics on overflow.
pub const MAX_TIMEOUT_SECS: f64 = 3600.0;

/// Lifecycle states of a connected agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentState {
    Connecting,
    Registered,
    Live,
    Draining,
    Dead,
}

/// Address family of a pool entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    pub fn of(ip: &std::net::IpAddr) -> Self {
        match ip {
            std::net::IpAddr::V4(_) => IpFamily::V4,
            std::net::IpAddr::V6(_) => IpFamily::V6,
        }
    }
}

/// Lifecycle states of a dispatch job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Queued,
    Assigned,
    InFlight,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

/// The caller-supplied portion of a dispatch job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: HeaderMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    #[serde(default = "default_timeout")]
    pub timeout_sec: f64,
}

fn default_timeout() -> f64 {
    DEFAULT_TIMEOUT_SECS
}

/// One dispatch request lifecycle, from submit to a terminal state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: Uuid,
    pub request: JobRequest,
    pub state: JobState,
    pub submitted_at: DateTime<Utc>,
    pub assigned_agent: Option<AgentId>,
    pub assigned_ip: Option<String>,
}

impl Job {
    pub fn new(request: JobRequest) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            request,
            state: JobState::Queued,
            submitted_at: Utc::now(),
            assigned_agent: None,
            assigned_ip: None,
        }
    }
}

/// Successful outcome of an executed job, as reported by the agent
#[derive(Debug, Clone, PartialEq)]
pub struct AgentResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub elapsed_sec: f64,
}

/// Resolution of a job: the agent's response or a classified failure
pub type JobOutcome = Result<AgentResponse, JobError>;

/// Legacy single stored request template, kept in memory only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestConfig {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HeaderMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    #[serde(default = "default_timeout")]
    pub timeout_sec: f64,
}

fn default_method() -> String {
    "GET".to_string()
}

impl From<RequestConfig> for JobRequest {
    fn from(config: RequestConfig) -> Self {
        JobRequest {
            method: config.method,
            url: config.url,
            headers: config.headers,
            body: config.body,
            timeout_sec: config.timeout_sec,
        }
    }
}

/// Error taxonomy surfaced verbatim to API callers and over the wire.
///
/// Wire names are contract-stable; `DNSError` and `TLSError` keep their
/// historical capitalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    NoAgentsAvailable,
    AgentsSaturated,
    CoordinatorOverloaded,
    AgentLost,
    AgentReplaced,
    Timeout,
    Cancelled,
    BindError,
    #[serde(rename = "DNSError")]
    DnsError,
    ConnectError,
    #[serde(rename = "TLSError")]
    TlsError,
    ReadError,
    TooManyRedirects,
    InvalidRequest,
    Other,
}

impl ErrorKind {
    /// Stable wire/label name for this kind
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NoAgentsAvailable => "NoAgentsAvailable",
            ErrorKind::AgentsSaturated => "AgentsSaturated",
            ErrorKind::CoordinatorOverloaded => "CoordinatorOverloaded",
            ErrorKind::AgentLost => "AgentLost",
            ErrorKind::AgentReplaced => "AgentReplaced",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::BindError => "BindError",
            ErrorKind::DnsError => "DNSError",
            ErrorKind::ConnectError => "ConnectError",
            ErrorKind::TlsError => "TLSError",
            ErrorKind::ReadError => "ReadError",
            ErrorKind::TooManyRedirects => "TooManyRedirects",
            ErrorKind::InvalidRequest => "InvalidRequest",
            ErrorKind::Other => "Other",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified job failure with a human-readable message
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl JobError {
    pub fn new<M: Into<String>>(kind: ErrorKind, message: M) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_request<M: Into<String>>(message: M) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }
}

/// Terminal job state implied by an outcome
pub fn terminal_state(outcome: &JobOutcome) -> JobState {
    match outcome {
        Ok(_) => JobState::Completed,
        Err(err) => match err.kind {
            ErrorKind::Timeout => JobState::TimedOut,
            ErrorKind::Cancelled => JobState::Cancelled,
            _ => JobState::Failed,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_wire_names() {
        let json = serde_json::to_string(&ErrorKind::DnsError).unwrap();
        assert_eq!(json, "\"DNSError\"");
        let json = serde_json::to_string(&ErrorKind::TlsError).unwrap();
        assert_eq!(json, "\"TLSError\"");
        let kind: ErrorKind = serde_json::from_str("\"TooManyRedirects\"").unwrap();
        assert_eq!(kind, ErrorKind::TooManyRedirects);
    }

    #[test]
    fn test_error_kind_display_matches_serde() {
        for kind in [
            ErrorKind::NoAgentsAvailable,
            ErrorKind::DnsError,
            ErrorKind::TlsError,
            ErrorKind::Other,
        ] {
            let via_serde = serde_json::to_string(&kind).unwrap();
            assert_eq!(via_serde, format!("\"{}\"", kind));
        }
    }

    #[test]
    fn test_request_config_roundtrip_is_idempotent() {
        let config = RequestConfig {
            url: "https://example.com/probe".to_string(),
            method: "POST".to_string(),
            headers: HeaderMap::from_iter([("x-trace".to_string(), "abc".to_string())]),
            body: Some(serde_json::json!({"ping": true})),
            timeout_sec: 12.5,
        };

        let encoded = serde_json::to_string(&config).unwrap();
        let decoded: RequestConfig = serde_json::from_str(&encoded).unwrap();
        let re_encoded = serde_json::to_string(&decoded).unwrap();

        assert_eq!(decoded, config);
        assert_eq!(re_encoded, encoded);
    }

    #[test]
    fn test_job_starts_queued() {
        let job = Job::new(JobRequest {
            method: "GET".to_string(),
            url: "http://127.0.0.1:18001/echo".to_string(),
            headers: HeaderMap::new(),
            body: None,
            timeout_sec: 5.0,
        });

        assert_eq!(job.state, JobState::Queued);
        assert!(job.assigned_agent.is_none());
        assert!(job.assigned_ip.is_none());
    }

    #[test]
    fn test_terminal_state_mapping() {
        let ok: JobOutcome = Ok(AgentResponse {
            status: 200,
            headers: HeaderMap::new(),
            body: Vec::new(),
            elapsed_sec: 0.1,
        });
        assert_eq!(terminal_state(&ok), JobState::Completed);

        let timeout: JobOutcome = Err(JobError::new(ErrorKind::Timeout, "deadline"));
        assert_eq!(terminal_state(&timeout), JobState::TimedOut);

        let cancelled: JobOutcome = Err(JobError::new(ErrorKind::Cancelled, "caller gone"));
        assert_eq!(terminal_state(&cancelled), JobState::Cancelled);

        let lost: JobOutcome = Err(JobError::new(ErrorKind::AgentLost, "disconnected"));
        assert_eq!(terminal_state(&lost), JobState::Failed);
    }
}
