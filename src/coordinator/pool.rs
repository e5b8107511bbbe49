//! # Source-IP Pool and Round-Robin Selector
//!
//! Membership is derived from live agents: the pool stores only
//! `(agent_id, ip)` pairs, never agent references. Selection walks a
//! deterministic sorted view with a monotone cursor; the cursor is a counter,
//! not an index, so pool churn never restarts rotation at a fixed element.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;

use crate::metrics::MetricsSink;
use crate::types::{AgentId, ErrorKind, IpFamily, JobError};

/// One selectable `(agent, source ip)` pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolEntry {
    pub agent_id: AgentId,
    pub ip: String,
}

impl PoolEntry {
    /// Address family, when the stored text parses as an IP literal
    pub fn family(&self) -> Option<IpFamily> {
        self.ip
            .parse::<std::net::IpAddr>()
            .ok()
            .map(|ip| IpFamily::of(&ip))
    }
}

struct PoolInner {
    /// Sorted by `(agent_id, ip)`; rebuilt on every membership change
    entries: Vec<PoolEntry>,
    /// Reverse index used for diffing on update/remove
    by_agent: HashMap<AgentId, BTreeSet<String>>,
    /// Monotone pick counter; `pick` uses `cursor % entries.len()`
    cursor: u64,
}

/// Shared source-IP pool; all mutations are atomic w.r.t. `pick`
#[derive(Clone)]
pub struct IpPool {
    inner: Arc<Mutex<PoolInner>>,
    metrics: Arc<dyn MetricsSink>,
}

impl IpPool {
    pub fn new(metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PoolInner {
                entries: Vec::new(),
                by_agent: HashMap::new(),
                cursor: 0,
            })),
            metrics,
        }
    }

    /// Replace (or create) the entry set for one agent
    pub fn set_addresses(&self, agent_id: &str, addresses: &[String]) {
        let mut inner = self.inner.lock();
        let set: BTreeSet<String> = addresses.iter().cloned().collect();
        if inner.by_agent.get(agent_id) == Some(&set) {
            return;
        }
        inner.by_agent.insert(agent_id.to_string(), set);
        Self::rebuild(&mut inner);
        self.publish_size(&inner);
    }

    /// Drop every entry owned by `agent_id`
    pub fn remove(&self, agent_id: &str) {
        let mut inner = self.inner.lock();
        if inner.by_agent.remove(agent_id).is_none() {
            return;
        }
        Self::rebuild(&mut inner);
        self.publish_size(&inner);
    }

    /// Round-robin pick over the sorted entry view
    pub fn pick(&self) -> Result<PoolEntry, JobError> {
        let mut inner = self.inner.lock();
        if inner.entries.is_empty() {
            return Err(JobError::new(
                ErrorKind::NoAgentsAvailable,
                "source-IP pool is empty",
            ));
        }
        let index = (inner.cursor % inner.entries.len() as u64) as usize;
        inner.cursor = inner.cursor.wrapping_add(1);
        Ok(inner.entries[index].clone())
    }

    pub fn size(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Sorted snapshot of the current entries
    pub fn entries(&self) -> Vec<PoolEntry> {
        self.inner.lock().entries.clone()
    }

    fn rebuild(inner: &mut PoolInner) {
        let mut entries: Vec<PoolEntry> = inner
            .by_agent
            .iter()
            .flat_map(|(agent_id, ips)| {
                ips.iter().map(move |ip| PoolEntry {
                    agent_id: agent_id.clone(),
                    ip: ip.clone(),
                })
            })
            .collect();
        entries.sort_by(|a, b| (&a.agent_id, &a.ip).cmp(&(&b.agent_id, &b.ip)));
        inner.entries = entries;
    }

    fn publish_size(&self, inner: &PoolInner) {
        // availability is published by the registry's capacity view
        self.metrics.set_pool_size(inner.entries.len() as i64);
    }
}
