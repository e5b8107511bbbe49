//! # Agent Runtime
//!
//! Wires the address inventory, the source-bound executor and the coordinator
//! session together. An agent is a thin process: everything interesting
//! happens in [`session`] once the identity is settled.

pub mod executor;
pub mod inventory;
pub mod session;

use anyhow::Result;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::AgentSettings;
use session::SessionConfig;

/// Run the agent until `shutdown` fires (or the coordinator drains us)
pub async fn run(settings: AgentSettings, shutdown: CancellationToken) -> Result<()> {
    let hostname = sysinfo::System::host_name().unwrap_or_else(|| "unknown".to_string());
    let agent_id = settings
        .agent_id
        .clone()
        .unwrap_or_else(|| default_agent_id(&hostname));

    info!(
        agent_id,
        coordinator = %settings.coordinator_url,
        "starting agent"
    );

    let config = SessionConfig {
        coordinator_url: settings.coordinator_url,
        agent_id,
        hostname,
        agent_version: env!("CARGO_PKG_VERSION").to_string(),
        max_in_flight: settings.max_in_flight,
        heartbeat_interval: Duration::from_secs(settings.heartbeat_interval_secs),
        advertise_addresses: settings.advertise_addresses,
    };
    session::run(config, shutdown).await
}

/// `agent-<hostname>-<unix_ts>`, used when no id is configured
fn default_agent_id(hostname: &str) -> String {
    let ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("agent-{hostname}-{ts}")
}
