//! # Coordinator Runtime
//!
//! Owns the shared state (registry, pool, pending table, history, metrics),
//! spawns the liveness sweeper, and serves the REST + WebSocket API on the
//! primary listener plus any additional `--bind` listeners.

pub mod api;
pub mod dispatcher;
pub mod history;
pub mod pool;
pub mod registry;
pub mod ws;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::CoordinatorSettings;
use crate::metrics::{MetricsSink, PrometheusMetrics};
use crate::types::{ErrorKind, RequestConfig};

use dispatcher::{Dispatcher, PendingTable};
use history::HistoryRing;
use pool::IpPool;
use registry::AgentRegistry;

/// Cadence of the agent liveness sweep
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Shared coordinator state handed to every API handler
pub struct CoordinatorState {
    pub registry: AgentRegistry,
    pub pool: IpPool,
    pub dispatcher: Dispatcher,
    pub pending: Arc<PendingTable>,
    pub history: Arc<HistoryRing>,
    pub metrics: Arc<PrometheusMetrics>,
    pub request_config: Mutex<Option<RequestConfig>>,
    pub default_timeout_secs: f64,
    pub started_at: Instant,
    pub shutdown: CancellationToken,
}

impl CoordinatorState {
    pub fn new(settings: &CoordinatorSettings, shutdown: CancellationToken) -> Result<Arc<Self>> {
        let metrics = Arc::new(PrometheusMetrics::new().context("metrics registry")?);
        let sink: Arc<dyn MetricsSink> = Arc::clone(&metrics) as Arc<dyn MetricsSink>;

        let pool = IpPool::new(Arc::clone(&sink));
        let registry = AgentRegistry::new(
            pool.clone(),
            Arc::clone(&sink),
            settings.max_in_flight_per_agent,
        );
        let history = Arc::new(HistoryRing::new(
            settings.history_capacity,
            settings.history_body_cap,
        ));
        let pending = Arc::new(PendingTable::new(Arc::clone(&history), Arc::clone(&sink)));
        let dispatcher = Dispatcher::new(
            pool.clone(),
            registry.clone(),
            Arc::clone(&pending),
            Arc::clone(&history),
            sink,
            settings.max_total_in_flight,
        );

        Ok(Arc::new(Self {
            registry,
            pool,
            dispatcher,
            pending,
            history,
            metrics,
            request_config: Mutex::new(None),
            default_timeout_secs: settings.default_timeout_secs,
            started_at: Instant::now(),
            shutdown,
        }))
    }
}

/// Run the coordinator until `shutdown` fires
pub async fn run(settings: CoordinatorSettings, shutdown: CancellationToken) -> Result<()> {
    let state = CoordinatorState::new(&settings, shutdown.clone())?;
    let app = api::router(Arc::clone(&state));

    let mut addresses: Vec<String> =
        vec![format!("{}:{}", settings.host, settings.port)];
    addresses.extend(settings.binds.iter().cloned());

    let mut servers = JoinSet::new();
    for address in &addresses {
        let listener = tokio::net::TcpListener::bind(address.as_str())
            .await
            .with_context(|| format!("cannot bind {address}"))?;
        let addr: SocketAddr = listener.local_addr().context("listener address")?;
        info!(%addr, "coordinator listening");

        let app = app.clone();
        let token = shutdown.clone();
        servers.spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await
        });
    }

    let sweeper = tokio::spawn(sweep_agents(
        Arc::clone(&state),
        Duration::from_secs(settings.heartbeat_timeout_secs),
        shutdown.clone(),
    ));

    shutdown.cancelled().await;
    info!("coordinator shutting down");

    // ask agents to drain, then force any remaining session loops closed
    state.registry.drain_all().await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    state.registry.cancel_all_sessions();

    while let Some(result) = servers.join_next().await {
        if let Ok(Err(err)) = result {
            warn!(error = %err, "listener exited with error");
        }
    }
    let _ = sweeper.await;
    Ok(())
}

/// Declare agents dead after `timeout` without a heartbeat and fail their
/// pending jobs.
async fn sweep_agents(
    state: Arc<CoordinatorState>,
    timeout: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.cancelled() => return,
        }
        for (agent_id, epoch) in state.registry.reap_stale(timeout) {
            state.pending.fail_agent(
                &agent_id,
                Some(epoch + 1),
                ErrorKind::AgentLost,
                "agent heartbeat timed out",
            );
        }
    }
}
