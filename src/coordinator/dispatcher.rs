//! # Dispatcher
//!
//! The dispatch path: submit a job, pick an `(agent, source ip)`, hand the
//! job to the owning agent, and correlate the eventual reply through the
//! pending table. A job is resolved exactly once, by whichever of the
//! agent's reply, the coordinator deadline, caller cancellation, or agent
//! loss comes first; every other resolution attempt for the same id is
//! discarded.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::coordinator::history::HistoryRing;
use crate::coordinator::pool::IpPool;
use crate::coordinator::registry::{AgentRegistry, InFlightSlot};
use crate::metrics::MetricsSink;
use crate::protocol::Frame;
use crate::types::{
    terminal_state, AgentId, ErrorKind, Job, JobError, JobOutcome, JobRequest, JobState,
    MAX_TIMEOUT_SECS,
};

/// Label used in metrics/history when a job never reached an agent
const UNASSIGNED: &str = "none";

struct PendingJob {
    job: Job,
    tx: oneshot::Sender<JobOutcome>,
    agent_epoch: u64,
    /// Released when the entry is resolved (drop order)
    _slot: InFlightSlot,
}

/// In-memory map of jobs awaiting an agent reply or deadline. An entry exists
/// iff the job is `Assigned` or `InFlight`; removing the entry is the single
/// resolution point that writes history and metrics.
pub struct PendingTable {
    jobs: Mutex<HashMap<Uuid, PendingJob>>,
    history: Arc<HistoryRing>,
    metrics: Arc<dyn MetricsSink>,
}

impl PendingTable {
    pub fn new(history: Arc<HistoryRing>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            history,
            metrics,
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }

    fn insert(&self, job: Job, tx: oneshot::Sender<JobOutcome>, agent_epoch: u64, slot: InFlightSlot) {
        let mut jobs = self.jobs.lock();
        jobs.insert(
            job.job_id,
            PendingJob {
                job,
                tx,
                agent_epoch,
                _slot: slot,
            },
        );
    }

    fn mark_in_flight(&self, job_id: Uuid) {
        if let Some(entry) = self.jobs.lock().get_mut(&job_id) {
            entry.job.state = JobState::InFlight;
        }
    }

    /// Resolve a job. Returns false when the id is unknown, i.e. a late reply
    /// for an already-resolved job; those are logged and otherwise ignored.
    pub fn complete(&self, job_id: Uuid, outcome: JobOutcome) -> bool {
        let entry = self.jobs.lock().remove(&job_id);
        match entry {
            Some(entry) => {
                self.resolve(entry, outcome);
                true
            }
            None => {
                debug!(%job_id, "discarding reply for already-resolved job");
                false
            }
        }
    }

    /// Fail every pending job assigned to `agent_id`. When `before_epoch` is
    /// given, only jobs dispatched to an older session are failed (used on
    /// replacement so the new session's jobs survive).
    pub fn fail_agent(
        &self,
        agent_id: &str,
        before_epoch: Option<u64>,
        kind: ErrorKind,
        message: &str,
    ) -> usize {
        let drained: Vec<PendingJob> = {
            let mut jobs = self.jobs.lock();
            let ids: Vec<Uuid> = jobs
                .iter()
                .filter(|(_, entry)| {
                    entry.job.assigned_agent.as_deref() == Some(agent_id)
                        && before_epoch.map_or(true, |epoch| entry.agent_epoch < epoch)
                })
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| jobs.remove(&id)).collect()
        };

        let count = drained.len();
        for entry in drained {
            self.resolve(entry, Err(JobError::new(kind, message)));
        }
        if count > 0 {
            warn!(agent_id, count, kind = %kind, "failed pending jobs");
        }
        count
    }

    /// Single resolution point: terminal state, history, metrics, wakeup
    fn resolve(&self, mut entry: PendingJob, outcome: JobOutcome) {
        let completed_at = Utc::now();
        entry.job.state = terminal_state(&outcome);
        self.history.record(&entry.job, &outcome, completed_at);

        let agent = entry.job.assigned_agent.as_deref().unwrap_or(UNASSIGNED);
        let method = entry.job.request.method.as_str();
        let latency = (completed_at - entry.job.submitted_at)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        match &outcome {
            Ok(response) => {
                self.metrics
                    .record_job(agent, method, response.status, latency, response.body.len());
            }
            Err(err) => {
                self.metrics.record_job_error(agent, method, err.kind, latency);
            }
        }

        // the submitter may be gone (cancelled); that is fine
        let _ = entry.tx.send(outcome);
    }
}

/// Outcome of one submit, with the assignment that produced it
#[derive(Debug)]
pub struct CompletedJob {
    pub job_id: Uuid,
    pub agent_id: Option<AgentId>,
    pub source_ip: Option<String>,
    pub outcome: JobOutcome,
}

/// Removes the pending entry when the submitter's future is dropped before
/// resolution (REST caller went away).
struct CancelGuard {
    pending: Arc<PendingTable>,
    job_id: Uuid,
    armed: bool,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if self.armed {
            self.pending.complete(
                self.job_id,
                Err(JobError::new(ErrorKind::Cancelled, "caller aborted")),
            );
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    pool: IpPool,
    registry: AgentRegistry,
    pending: Arc<PendingTable>,
    history: Arc<HistoryRing>,
    metrics: Arc<dyn MetricsSink>,
    max_total_in_flight: usize,
}

impl Dispatcher {
    pub fn new(
        pool: IpPool,
        registry: AgentRegistry,
        pending: Arc<PendingTable>,
        history: Arc<HistoryRing>,
        metrics: Arc<dyn MetricsSink>,
        max_total_in_flight: usize,
    ) -> Self {
        Self {
            pool,
            registry,
            pending,
            history,
            metrics,
            max_total_in_flight,
        }
    }

    pub fn pending(&self) -> Arc<PendingTable> {
        Arc::clone(&self.pending)
    }

    /// Submit one job and wait for its terminal state.
    ///
    /// Never retries a failed outbound request; every failure is surfaced.
    /// Dropping the returned future cancels the job.
    pub async fn execute(&self, request: JobRequest) -> CompletedJob {
        if let Err(err) = validate_request(&request) {
            // rejected synchronously, before any pool pick; not recorded
            return CompletedJob {
                job_id: Uuid::new_v4(),
                agent_id: None,
                source_ip: None,
                outcome: Err(err),
            };
        }

        let mut job = Job::new(request);

        if self.pending.len() >= self.max_total_in_flight {
            return self.fail_unassigned(
                job,
                ErrorKind::CoordinatorOverloaded,
                "coordinator-wide in-flight cap reached",
            );
        }

        // pick an entry whose agent is still live and has capacity; one full
        // rotation over the pool is enough to prove saturation
        let mut picked = None;
        let attempts = self.pool.size().max(1);
        let mut pool_was_empty = false;
        for _ in 0..attempts {
            let entry = match self.pool.pick() {
                Ok(entry) => entry,
                Err(_) => {
                    pool_was_empty = true;
                    break;
                }
            };
            if let Some((sender, epoch)) = self.registry.sender_for(&entry.agent_id) {
                if let Some(slot) = self.registry.try_acquire_slot(&entry.agent_id, epoch) {
                    picked = Some((entry, sender, epoch, slot));
                    break;
                }
            }
        }

        let (entry, sender, epoch, slot) = match picked {
            Some(picked) => picked,
            None if pool_was_empty => {
                return self.fail_unassigned(
                    job,
                    ErrorKind::NoAgentsAvailable,
                    "source-IP pool is empty",
                );
            }
            None => {
                return self.fail_unassigned(
                    job,
                    ErrorKind::AgentsSaturated,
                    "all candidate agents at capacity",
                );
            }
        };

        job.state = JobState::Assigned;
        job.assigned_agent = Some(entry.agent_id.clone());
        job.assigned_ip = Some(entry.ip.clone());
        let job_id = job.job_id;
        let agent_id = entry.agent_id.clone();
        let source_ip = entry.ip.clone();
        let timeout = Duration::from_secs_f64(job.request.timeout_sec);

        let frame = Frame::Dispatch {
            job_id,
            source_ip: source_ip.clone(),
            method: job.request.method.clone(),
            url: job.request.url.clone(),
            headers: job.request.headers.clone(),
            body: job.request.body.clone(),
            timeout_sec: job.request.timeout_sec,
        };

        let (tx, mut rx) = oneshot::channel();
        self.pending.insert(job, tx, epoch, slot);

        // from here on, dropping this future resolves the job as Cancelled
        let mut guard = CancelGuard {
            pending: Arc::clone(&self.pending),
            job_id,
            armed: true,
        };

        if sender.send(frame).await.is_err() {
            self.pending.complete(
                job_id,
                Err(JobError::new(
                    ErrorKind::AgentLost,
                    "agent connection closed before dispatch",
                )),
            );
        } else {
            self.pending.mark_in_flight(job_id);
        }

        // the coordinator's own clock is the authoritative deadline; the
        // agent's timeout is only a secondary bound
        let outcome = match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(JobError::new(
                ErrorKind::Other,
                "completion channel closed unexpectedly",
            )),
            Err(_) => {
                self.pending.complete(
                    job_id,
                    Err(JobError::new(ErrorKind::Timeout, "deadline expired")),
                );
                // a reply may have raced the deadline; take whichever won
                rx.await.unwrap_or_else(|_| {
                    Err(JobError::new(ErrorKind::Timeout, "deadline expired"))
                })
            }
        };
        guard.armed = false;

        CompletedJob {
            job_id,
            agent_id: Some(agent_id),
            source_ip: Some(source_ip),
            outcome,
        }
    }

    /// Resolve a job that never reached an agent
    fn fail_unassigned(&self, mut job: Job, kind: ErrorKind, message: &str) -> CompletedJob {
        let err = JobError::new(kind, message);
        let outcome: JobOutcome = Err(err);
        job.state = terminal_state(&outcome);
        self.history.record(&job, &outcome, Utc::now());
        self.metrics
            .record_job_error(UNASSIGNED, &job.request.method, kind, 0.0);
        CompletedJob {
            job_id: job.job_id,
            agent_id: None,
            source_ip: None,
            outcome,
        }
    }
}

/// Reject malformed submissions before they touch the pool
pub fn validate_request(request: &JobRequest) -> Result<(), JobError> {
    let url = reqwest::Url::parse(&request.url)
        .map_err(|e| JobError::invalid_request(format!("invalid url: {e}")))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(JobError::invalid_request(format!(
            "unsupported scheme {}",
            url.scheme()
        )));
    }
    axum::http::Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
        .map_err(|_| JobError::invalid_request(format!("unsupported method {}", request.method)))?;
    if !request.timeout_sec.is_finite() || request.timeout_sec <= 0.0 {
        return Err(JobError::invalid_request("timeout must be positive"));
    }
    if request.timeout_sec > MAX_TIMEOUT_SECS {
        return Err(JobError::invalid_request(format!(
            "timeout must be at most {MAX_TIMEOUT_SECS} seconds"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NullSink;
    use crate::types::{AgentResponse, HeaderMap};
    use tokio::sync::mpsc;

    struct Harness {
        dispatcher: Dispatcher,
        registry: AgentRegistry,
        history: Arc<HistoryRing>,
    }

    fn harness(max_per_agent: usize, max_total: usize) -> Harness {
        let metrics: Arc<dyn MetricsSink> = Arc::new(NullSink);
        let pool = IpPool::new(Arc::clone(&metrics));
        let registry = AgentRegistry::new(pool.clone(), Arc::clone(&metrics), max_per_agent);
        let history = Arc::new(HistoryRing::new(100, 1024));
        let pending = Arc::new(PendingTable::new(Arc::clone(&history), Arc::clone(&metrics)));
        let dispatcher = Dispatcher::new(
            pool.clone(),
            registry.clone(),
            pending,
            Arc::clone(&history),
            metrics,
            max_total,
        );
        Harness {
            dispatcher,
            registry,
            history,
        }
    }

    fn request(timeout_sec: f64) -> JobRequest {
        JobRequest {
            method: "GET".to_string(),
            url: "http://127.0.0.1:18001/echo".to_string(),
            headers: HeaderMap::new(),
            body: None,
            timeout_sec,
        }
    }

    fn response() -> AgentResponse {
        AgentResponse {
            status: 200,
            headers: HeaderMap::new(),
            body: b"ok".to_vec(),
            elapsed_sec: 0.01,
        }
    }

    fn connect_agent(h: &Harness, id: &str, ips: &[&str]) -> mpsc::Receiver<Frame> {
        let (tx, rx) = mpsc::channel(16);
        h.registry
            .register(
                id,
                "host".into(),
                "0.1.0".into(),
                ips.iter().map(|s| s.to_string()).collect(),
                tx,
                tokio_util::sync::CancellationToken::new(),
            )
            .unwrap();
        rx
    }

    /// Replies to every dispatch frame with a 200 result
    fn spawn_echo_agent(h: &Harness, mut rx: mpsc::Receiver<Frame>) {
        let pending = h.dispatcher.pending();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Frame::Dispatch { job_id, .. } = frame {
                    pending.complete(job_id, Ok(response()));
                }
            }
        });
    }

    #[tokio::test]
    async fn test_empty_pool_fails_fast() {
        let h = harness(4, 100);
        let done = h.dispatcher.execute(request(1.0)).await;
        let err = done.outcome.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoAgentsAvailable);
        assert!(h.dispatcher.pending.is_empty());
        assert_eq!(h.history.len(), 1, "unassigned failures still land in history");
    }

    #[tokio::test]
    async fn test_invalid_request_rejected_before_pick() {
        let h = harness(4, 100);
        let mut bad = request(1.0);
        bad.url = "not a url".to_string();
        let done = h.dispatcher.execute(bad).await;
        assert_eq!(done.outcome.unwrap_err().kind, ErrorKind::InvalidRequest);
        assert!(h.history.is_empty(), "synchronous rejects skip history");

        let mut bad_scheme = request(1.0);
        bad_scheme.url = "ftp://example.com/x".to_string();
        let done = h.dispatcher.execute(bad_scheme).await;
        assert_eq!(done.outcome.unwrap_err().kind, ErrorKind::InvalidRequest);

        let mut bad_timeout = request(0.0);
        bad_timeout.timeout_sec = 0.0;
        let done = h.dispatcher.execute(bad_timeout).await;
        assert_eq!(done.outcome.unwrap_err().kind, ErrorKind::InvalidRequest);

        // a huge timeout must be rejected, not overflow Duration
        let done = h.dispatcher.execute(request(1e30)).await;
        assert_eq!(done.outcome.unwrap_err().kind, ErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn test_happy_path_resolves_and_clears_pending() {
        let h = harness(4, 100);
        let rx = connect_agent(&h, "a1", &["10.0.0.1"]);
        spawn_echo_agent(&h, rx);

        let done = h.dispatcher.execute(request(5.0)).await;
        assert_eq!(done.agent_id.as_deref(), Some("a1"));
        assert_eq!(done.source_ip.as_deref(), Some("10.0.0.1"));
        assert_eq!(done.outcome.unwrap().status, 200);
        assert!(h.dispatcher.pending.is_empty());
        assert_eq!(h.history.len(), 1);
    }

    #[tokio::test]
    async fn test_round_robin_across_submits() {
        let h = harness(4, 100);
        let rx = connect_agent(&h, "a1", &["10.0.0.1", "10.0.0.2"]);
        spawn_echo_agent(&h, rx);

        let mut ips = Vec::new();
        for _ in 0..4 {
            let done = h.dispatcher.execute(request(5.0)).await;
            ips.push(done.source_ip.unwrap());
        }
        assert_eq!(ips, vec!["10.0.0.1", "10.0.0.2", "10.0.0.1", "10.0.0.2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_resolves_job() {
        let h = harness(4, 100);
        let _rx = connect_agent(&h, "a1", &["10.0.0.1"]); // never replies

        let done = h.dispatcher.execute(request(1.0)).await;
        assert_eq!(done.outcome.unwrap_err().kind, ErrorKind::Timeout);
        assert!(h.dispatcher.pending.is_empty());

        // late reply after resolution is discarded
        assert!(!h.dispatcher.pending.complete(done.job_id, Ok(response())));
        assert_eq!(h.history.len(), 1, "late reply must not duplicate history");
    }

    #[tokio::test]
    async fn test_saturated_agent() {
        let h = harness(1, 100);
        let mut rx = connect_agent(&h, "a1", &["10.0.0.1"]);

        // occupy the single slot with a job that never completes
        let dispatcher = h.dispatcher.clone();
        let first = tokio::spawn(async move { dispatcher.execute(request(5.0)).await });
        let frame = rx.recv().await.unwrap();
        let first_id = match frame {
            Frame::Dispatch { job_id, .. } => job_id,
            other => panic!("unexpected frame {other:?}"),
        };

        let done = h.dispatcher.execute(request(1.0)).await;
        assert_eq!(done.outcome.unwrap_err().kind, ErrorKind::AgentsSaturated);

        h.dispatcher.pending.complete(first_id, Ok(response()));
        let done = first.await.unwrap();
        assert!(done.outcome.is_ok());
    }

    #[tokio::test]
    async fn test_global_cap() {
        let h = harness(10, 1);
        let mut rx = connect_agent(&h, "a1", &["10.0.0.1"]);

        let dispatcher = h.dispatcher.clone();
        let first = tokio::spawn(async move { dispatcher.execute(request(5.0)).await });
        let Frame::Dispatch { job_id, .. } = rx.recv().await.unwrap() else {
            panic!("expected dispatch");
        };

        let done = h.dispatcher.execute(request(1.0)).await;
        assert_eq!(done.outcome.unwrap_err().kind, ErrorKind::CoordinatorOverloaded);

        h.dispatcher.pending.complete(job_id, Ok(response()));
        first.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancellation_clears_pending() {
        let h = harness(4, 100);
        let mut rx = connect_agent(&h, "a1", &["10.0.0.1"]);

        let dispatcher = h.dispatcher.clone();
        let task = tokio::spawn(async move { dispatcher.execute(request(30.0)).await });
        let Frame::Dispatch { job_id, .. } = rx.recv().await.unwrap() else {
            panic!("expected dispatch");
        };
        assert_eq!(h.dispatcher.pending.len(), 1);

        task.abort();
        let _ = task.await;
        assert!(h.dispatcher.pending.is_empty());

        // and a late reply for the cancelled job is discarded
        assert!(!h.dispatcher.pending.complete(job_id, Ok(response())));
    }

    #[tokio::test]
    async fn test_agent_lost_fails_pending() {
        let h = harness(4, 100);
        let mut rx = connect_agent(&h, "a1", &["10.0.0.1"]);

        let dispatcher = h.dispatcher.clone();
        let task = tokio::spawn(async move { dispatcher.execute(request(30.0)).await });
        let Frame::Dispatch { .. } = rx.recv().await.unwrap() else {
            panic!("expected dispatch");
        };

        let failed = h
            .dispatcher
            .pending
            .fail_agent("a1", None, ErrorKind::AgentLost, "agent disconnected");
        assert_eq!(failed, 1);

        let done = task.await.unwrap();
        assert_eq!(done.outcome.unwrap_err().kind, ErrorKind::AgentLost);
    }

    #[tokio::test]
    async fn test_fail_agent_epoch_filter_spares_new_session() {
        let h = harness(4, 100);
        let mut rx = connect_agent(&h, "a1", &["10.0.0.1"]);

        let dispatcher = h.dispatcher.clone();
        let task = tokio::spawn(async move { dispatcher.execute(request(30.0)).await });
        rx.recv().await.unwrap();

        // a "newer" session epoch excludes nothing below it
        let failed =
            h.dispatcher
                .pending
                .fail_agent("a1", Some(u64::MAX), ErrorKind::AgentReplaced, "replaced");
        assert_eq!(failed, 1);
        let done = task.await.unwrap();
        assert_eq!(done.outcome.unwrap_err().kind, ErrorKind::AgentReplaced);

        // epoch 0 spares everything
        let rx2 = connect_agent(&h, "a2", &["10.0.0.9"]);
        let dispatcher = h.dispatcher.clone();
        let task = tokio::spawn(async move { dispatcher.execute(request(30.0)).await });
        tokio::task::yield_now().await;
        let spared = h
            .dispatcher
            .pending
            .fail_agent("a2", Some(0), ErrorKind::AgentReplaced, "replaced");
        assert_eq!(spared, 0);
        drop(rx2);
        task.abort();
        let _ = task.await;
    }
}
