//! Bounded in-memory history of resolved jobs, for diagnostics. Oldest
//! entries are evicted silently; stored bodies are truncated.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

use crate::types::{AgentId, ErrorKind, Job, JobOutcome, JobState};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub job_id: Uuid,
    pub method: String,
    pub url: String,
    pub state: JobState,
    pub agent_id: Option<AgentId>,
    pub source_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub latency_sec: f64,
    pub submitted_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    /// First `body_cap` bytes of the response, lossily decoded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    pub body_truncated: bool,
}

pub struct HistoryRing {
    entries: Mutex<VecDeque<HistoryEntry>>,
    capacity: usize,
    body_cap: usize,
}

impl HistoryRing {
    pub fn new(capacity: usize, body_cap: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            body_cap,
        }
    }

    /// Record a resolved job. Evicts the oldest entry when full.
    pub fn record(&self, job: &Job, outcome: &JobOutcome, completed_at: DateTime<Utc>) {
        let latency = (completed_at - job.submitted_at)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        let entry = match outcome {
            Ok(response) => {
                let truncated = response.body.len() > self.body_cap;
                let stored = &response.body[..response.body.len().min(self.body_cap)];
                HistoryEntry {
                    job_id: job.job_id,
                    method: job.request.method.clone(),
                    url: job.request.url.clone(),
                    state: JobState::Completed,
                    agent_id: job.assigned_agent.clone(),
                    source_ip: job.assigned_ip.clone(),
                    status: Some(response.status),
                    error: None,
                    error_message: None,
                    latency_sec: latency,
                    submitted_at: job.submitted_at,
                    completed_at,
                    body: Some(String::from_utf8_lossy(stored).into_owned()),
                    body_truncated: truncated,
                }
            }
            Err(err) => HistoryEntry {
                job_id: job.job_id,
                method: job.request.method.clone(),
                url: job.request.url.clone(),
                state: crate::types::terminal_state(outcome),
                agent_id: job.assigned_agent.clone(),
                source_ip: job.assigned_ip.clone(),
                status: None,
                error: Some(err.kind),
                error_message: Some(err.message.clone()),
                latency_sec: latency,
                submitted_at: job.submitted_at,
                completed_at,
                body: None,
                body_truncated: false,
            },
        };

        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Newest-first snapshot, at most `limit` entries
    pub fn snapshot(&self, limit: usize) -> Vec<HistoryEntry> {
        let entries = self.entries.lock();
        entries.iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
