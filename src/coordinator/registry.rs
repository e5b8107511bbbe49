//! # Agent Registry
//!
//! Coordinator-side bookkeeping for every agent that has ever registered:
//! identity, connection state, reported addresses, liveness, and per-agent
//! in-flight capacity. The registry owns the writer channel of each live
//! session and is the only component allowed to mutate the IP pool.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::coordinator::pool::IpPool;
use crate::metrics::MetricsSink;
use crate::protocol::Frame;
use crate::types::{AgentId, AgentState};

pub const MAX_AGENT_ID_LEN: usize = 128;

/// Why a registration was refused
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegisterError {
    #[error("invalid agent id: {0}")]
    InvalidId(String),
    #[error("agent reported no usable addresses")]
    NoAddresses,
}

/// Everything the coordinator tracks about one agent
struct AgentRecord {
    hostname: String,
    agent_version: String,
    addresses: Vec<String>,
    state: AgentState,
    last_heartbeat: Instant,
    registered_at: DateTime<Utc>,
    /// Writer channel of the live session; `None` unless Live/Draining
    sender: Option<mpsc::Sender<Frame>>,
    /// Cancelled to force the session's socket loop to exit
    session: Option<CancellationToken>,
    /// Session generation; bumped on every (re-)registration so stale
    /// disconnects and stale pending jobs can be told apart from current ones
    epoch: u64,
    in_flight: usize,
}

struct RegistryInner {
    agents: HashMap<AgentId, AgentRecord>,
    next_epoch: u64,
    open_sockets: i64,
}

/// API-facing snapshot of one agent
#[derive(Debug, Clone, Serialize)]
pub struct AgentInfo {
    pub agent_id: AgentId,
    pub hostname: String,
    pub agent_version: String,
    pub addresses: Vec<String>,
    pub state: AgentState,
    pub last_seen_secs: f64,
    pub registered_at: DateTime<Utc>,
    pub in_flight: usize,
}

#[derive(Clone)]
pub struct AgentRegistry {
    inner: Arc<Mutex<RegistryInner>>,
    pool: IpPool,
    metrics: Arc<dyn MetricsSink>,
    max_in_flight_per_agent: usize,
}

impl AgentRegistry {
    pub fn new(
        pool: IpPool,
        metrics: Arc<dyn MetricsSink>,
        max_in_flight_per_agent: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                agents: HashMap::new(),
                next_epoch: 1,
                open_sockets: 0,
            })),
            pool,
            metrics,
            max_in_flight_per_agent,
        }
    }

    pub fn validate_agent_id(agent_id: &str) -> Result<(), RegisterError> {
        if agent_id.is_empty() {
            return Err(RegisterError::InvalidId("empty".to_string()));
        }
        if agent_id.len() > MAX_AGENT_ID_LEN {
            return Err(RegisterError::InvalidId(format!(
                "longer than {MAX_AGENT_ID_LEN} characters"
            )));
        }
        if !agent_id.chars().all(|c| c.is_ascii_graphic()) {
            return Err(RegisterError::InvalidId(
                "contains non-printable characters".to_string(),
            ));
        }
        Ok(())
    }

    /// Register a live WebSocket session. If the id is already Live, the
    /// previous session is displaced: its writer channel is dropped (which
    /// closes its socket) and the returned `replaced` flag tells the caller
    /// to fail that session's pending jobs with `AgentReplaced`.
    ///
    /// Returns the session epoch on success.
    pub fn register(
        &self,
        agent_id: &str,
        hostname: String,
        agent_version: String,
        addresses: Vec<String>,
        sender: mpsc::Sender<Frame>,
        session: CancellationToken,
    ) -> Result<(u64, bool), RegisterError> {
        Self::validate_agent_id(agent_id)?;
        if addresses.is_empty() {
            return Err(RegisterError::NoAddresses);
        }

        let mut addresses = addresses;
        addresses.sort();
        addresses.dedup();

        let (epoch, replaced) = {
            let mut inner = self.inner.lock();
            let epoch = inner.next_epoch;
            inner.next_epoch += 1;

            let replaced = match inner.agents.get_mut(agent_id) {
                Some(record) => {
                    let had_session = record.sender.take().is_some();
                    if let Some(old_session) = record.session.take() {
                        old_session.cancel();
                    }
                    if had_session {
                        warn!(agent_id, "displacing previous live session");
                    }
                    record.hostname = hostname;
                    record.agent_version = agent_version;
                    record.addresses = addresses.clone();
                    record.state = AgentState::Live;
                    record.last_heartbeat = Instant::now();
                    record.sender = Some(sender);
                    record.session = Some(session);
                    record.epoch = epoch;
                    record.in_flight = 0;
                    had_session
                }
                None => {
                    inner.agents.insert(
                        agent_id.to_string(),
                        AgentRecord {
                            hostname,
                            agent_version,
                            addresses: addresses.clone(),
                            state: AgentState::Live,
                            last_heartbeat: Instant::now(),
                            registered_at: Utc::now(),
                            sender: Some(sender),
                            session: Some(session),
                            epoch,
                            in_flight: 0,
                        },
                    );
                    false
                }
            };
            self.publish_counts(&inner);
            (epoch, replaced)
        };

        self.pool.set_addresses(agent_id, &addresses);
        self.publish_available();
        info!(agent_id, addresses = addresses.len(), "agent registered");
        Ok((epoch, replaced))
    }

    /// Reserve an id without a connection (HTTP pseudo-registration). The
    /// record never enters the pool until a WebSocket session registers it.
    pub fn reserve(&self, agent_id: Option<String>) -> Result<AgentId, RegisterError> {
        let agent_id = agent_id
            .unwrap_or_else(|| format!("agent-{}", uuid::Uuid::new_v4().as_simple()));
        Self::validate_agent_id(&agent_id)?;

        let mut inner = self.inner.lock();
        let epoch = inner.next_epoch;
        inner.next_epoch += 1;
        inner
            .agents
            .entry(agent_id.clone())
            .or_insert_with(|| AgentRecord {
                hostname: String::new(),
                agent_version: String::new(),
                addresses: Vec::new(),
                state: AgentState::Registered,
                last_heartbeat: Instant::now(),
                registered_at: Utc::now(),
                sender: None,
                session: None,
                epoch,
                in_flight: 0,
            });
        self.publish_counts(&inner);
        Ok(agent_id)
    }

    /// Apply a heartbeat: refresh liveness and diff the reported addresses
    /// into the pool. Returns false for unknown or non-live agents.
    pub fn heartbeat(&self, agent_id: &str, epoch: u64, addresses: Vec<String>) -> bool {
        let mut addresses = addresses;
        addresses.sort();
        addresses.dedup();

        let accepted = {
            let mut inner = self.inner.lock();
            match inner.agents.get_mut(agent_id) {
                Some(record)
                    if record.epoch == epoch
                        && matches!(record.state, AgentState::Live | AgentState::Draining) =>
                {
                    record.last_heartbeat = Instant::now();
                    if !addresses.is_empty() {
                        record.addresses = addresses.clone();
                    }
                    true
                }
                _ => false,
            }
        };

        if accepted && !addresses.is_empty() {
            self.pool.set_addresses(agent_id, &addresses);
            self.publish_available();
        }
        accepted
    }

    /// A live session's socket went away. Only acts if `epoch` still names
    /// the current session (a displaced session's late disconnect is a no-op).
    /// Returns true when the caller should fail the agent's pending jobs.
    pub fn disconnect(&self, agent_id: &str, epoch: u64) -> bool {
        let acted = {
            let mut inner = self.inner.lock();
            match inner.agents.get_mut(agent_id) {
                Some(record)
                    if record.epoch == epoch
                        && matches!(record.state, AgentState::Live | AgentState::Draining) =>
                {
                    record.state = AgentState::Dead;
                    record.sender = None;
                    if let Some(session) = record.session.take() {
                        session.cancel();
                    }
                    record.in_flight = 0;
                    self.metrics.set_queue_depth(agent_id, 0);
                    self.publish_counts(&inner);
                    true
                }
                _ => false,
            }
        };

        if acted {
            self.pool.remove(agent_id);
            self.publish_available();
            info!(agent_id, "agent disconnected");
        }
        acted
    }

    /// Declare agents dead after `timeout` without a heartbeat. Returns the
    /// affected `(agent_id, epoch)` pairs so the sweeper can fail their jobs.
    pub fn reap_stale(&self, timeout: Duration) -> Vec<(AgentId, u64)> {
        let stale: Vec<(AgentId, u64)> = {
            let mut inner = self.inner.lock();
            let stale: Vec<(AgentId, u64)> = inner
                .agents
                .iter()
                .filter(|(_, r)| {
                    matches!(r.state, AgentState::Live | AgentState::Draining)
                        && r.last_heartbeat.elapsed() > timeout
                })
                .map(|(id, r)| (id.clone(), r.epoch))
                .collect();
            for (id, _) in &stale {
                if let Some(record) = inner.agents.get_mut(id) {
                    record.state = AgentState::Dead;
                    record.sender = None;
                    if let Some(session) = record.session.take() {
                        session.cancel();
                    }
                    record.in_flight = 0;
                    self.metrics.set_queue_depth(id, 0);
                }
            }
            if !stale.is_empty() {
                self.publish_counts(&inner);
            }
            stale
        };

        for (id, _) in &stale {
            warn!(agent_id = %id, "no heartbeat, declaring agent dead");
            self.pool.remove(id);
        }
        if !stale.is_empty() {
            self.publish_available();
        }
        stale
    }

    /// Forcibly remove an agent record (`DELETE /api/agents/{id}`).
    /// Returns the epoch of the removed live session, if there was one.
    pub fn remove(&self, agent_id: &str) -> Option<Option<u64>> {
        let removed = {
            let mut inner = self.inner.lock();
            let record = inner.agents.remove(agent_id)?;
            if let Some(session) = record.session {
                session.cancel();
            }
            self.metrics.set_queue_depth(agent_id, 0);
            self.publish_counts(&inner);
            Some(match record.state {
                AgentState::Live | AgentState::Draining => Some(record.epoch),
                _ => None,
            })
        };
        self.pool.remove(agent_id);
        self.publish_available();
        removed
    }

    /// Writer channel and epoch of the agent's current live session
    pub fn sender_for(&self, agent_id: &str) -> Option<(mpsc::Sender<Frame>, u64)> {
        let inner = self.inner.lock();
        let record = inner.agents.get(agent_id)?;
        match (&record.sender, record.state) {
            (Some(sender), AgentState::Live) => Some((sender.clone(), record.epoch)),
            _ => None,
        }
    }

    /// Claim one unit of the agent's dispatch capacity. The returned guard
    /// releases the slot on drop.
    pub fn try_acquire_slot(&self, agent_id: &str, epoch: u64) -> Option<InFlightSlot> {
        {
            let mut inner = self.inner.lock();
            let record = inner.agents.get_mut(agent_id)?;
            if record.epoch != epoch || record.state != AgentState::Live {
                return None;
            }
            if record.in_flight >= self.max_in_flight_per_agent {
                return None;
            }
            record.in_flight += 1;
            self.metrics
                .set_queue_depth(agent_id, record.in_flight as i64);
        }
        self.publish_available();
        Some(InFlightSlot {
            registry: self.clone(),
            agent_id: agent_id.to_string(),
            epoch,
        })
    }

    /// Force every session socket loop to exit (coordinator shutdown)
    pub fn cancel_all_sessions(&self) {
        let mut inner = self.inner.lock();
        for record in inner.agents.values_mut() {
            if let Some(session) = record.session.take() {
                session.cancel();
            }
        }
    }

    /// Ask every live agent to drain (graceful coordinator shutdown)
    pub async fn drain_all(&self) {
        let senders: Vec<(AgentId, mpsc::Sender<Frame>)> = {
            let mut inner = self.inner.lock();
            let mut senders = Vec::new();
            for (id, record) in inner.agents.iter_mut() {
                if record.state == AgentState::Live {
                    record.state = AgentState::Draining;
                    if let Some(sender) = &record.sender {
                        senders.push((id.clone(), sender.clone()));
                    }
                }
            }
            senders
        };
        for (id, sender) in senders {
            if sender.send(Frame::Drain).await.is_err() {
                warn!(agent_id = %id, "drain frame not delivered");
            }
        }
    }

    pub fn snapshot(&self) -> Vec<AgentInfo> {
        let inner = self.inner.lock();
        let mut agents: Vec<AgentInfo> = inner
            .agents
            .iter()
            .map(|(id, r)| AgentInfo {
                agent_id: id.clone(),
                hostname: r.hostname.clone(),
                agent_version: r.agent_version.clone(),
                addresses: r.addresses.clone(),
                state: r.state,
                last_seen_secs: r.last_heartbeat.elapsed().as_secs_f64(),
                registered_at: r.registered_at,
                in_flight: r.in_flight,
            })
            .collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        agents
    }

    pub fn live_count(&self) -> usize {
        let inner = self.inner.lock();
        inner
            .agents
            .values()
            .filter(|r| r.state == AgentState::Live)
            .count()
    }

    pub fn socket_opened(&self) {
        let mut inner = self.inner.lock();
        inner.open_sockets += 1;
        self.metrics.set_ws_connections(inner.open_sockets);
    }

    pub fn socket_closed(&self) {
        let mut inner = self.inner.lock();
        inner.open_sockets -= 1;
        self.metrics.set_ws_connections(inner.open_sockets);
    }

    fn release_slot(&self, agent_id: &str, epoch: u64) {
        {
            let mut inner = self.inner.lock();
            if let Some(record) = inner.agents.get_mut(agent_id) {
                if record.epoch == epoch && record.in_flight > 0 {
                    record.in_flight -= 1;
                    self.metrics
                        .set_queue_depth(agent_id, record.in_flight as i64);
                }
            }
        }
        self.publish_available();
    }

    fn publish_counts(&self, inner: &RegistryInner) {
        let connected = inner
            .agents
            .values()
            .filter(|r| r.state == AgentState::Live)
            .count() as i64;
        self.metrics.set_agents(connected, inner.agents.len() as i64);
    }

    /// Pool entries owned by live agents that still have dispatch capacity
    fn publish_available(&self) {
        let inner = self.inner.lock();
        let available: usize = inner
            .agents
            .values()
            .filter(|r| {
                r.state == AgentState::Live && r.in_flight < self.max_in_flight_per_agent
            })
            .map(|r| r.addresses.len())
            .sum();
        self.metrics.set_pool_available(available as i64);
    }
}

/// RAII claim on one unit of an agent's in-flight capacity
pub struct InFlightSlot {
    registry: AgentRegistry,
    agent_id: AgentId,
    epoch: u64,
}

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        self.registry.release_slot(&self.agent_id, self.epoch);
    }
}
