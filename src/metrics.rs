//! # Metrics
//!
//! Dispatch-path accounting. Components receive a [`MetricsSink`] rather than
//! touching a global registry, so tests can substitute an in-memory sink; the
//! Prometheus implementation owns its own `Registry` and renders the text
//! exposition for `/metrics`.
//!
//! Metric names are contract-stable for dashboard compatibility.

use once_cell::sync::Lazy;
use prometheus::{
    exponential_buckets, register_gauge_with_registry, register_histogram_vec_with_registry,
    register_int_counter_vec_with_registry, register_int_gauge_vec_with_registry,
    register_int_gauge_with_registry, Encoder, Gauge, HistogramVec, IntCounterVec, IntGauge,
    IntGaugeVec, Registry, TextEncoder,
};
use std::time::Instant;

use crate::types::ErrorKind;

/// Process start reference for the uptime gauge
static STARTED_AT: Lazy<Instant> = Lazy::new(Instant::now);

/// Sink for dispatch-path accounting, injected into Dispatcher, Registry and
/// Pool.
pub trait MetricsSink: Send + Sync + 'static {
    /// A job resolved with an HTTP response from the agent
    fn record_job(&self, agent: &str, method: &str, status: u16, duration_sec: f64, body_bytes: usize);
    /// A job resolved with a failure
    fn record_job_error(&self, agent: &str, method: &str, kind: ErrorKind, duration_sec: f64);
    fn set_queue_depth(&self, agent: &str, depth: i64);
    fn set_agents(&self, connected: i64, total: i64);
    fn set_ws_connections(&self, connections: i64);
    fn set_pool_size(&self, size: i64);
    fn set_pool_available(&self, available: i64);
}

/// Sink that drops everything; used where accounting is irrelevant
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl MetricsSink for NullSink {
    fn record_job(&self, _: &str, _: &str, _: u16, _: f64, _: usize) {}
    fn record_job_error(&self, _: &str, _: &str, _: ErrorKind, _: f64) {}
    fn set_queue_depth(&self, _: &str, _: i64) {}
    fn set_agents(&self, _: i64, _: i64) {}
    fn set_ws_connections(&self, _: i64) {}
    fn set_pool_size(&self, _: i64) {}
    fn set_pool_available(&self, _: i64) {}
}

/// Prometheus-backed sink with its own registry
pub struct PrometheusMetrics {
    registry: Registry,
    requests_total: IntCounterVec,
    request_errors_total: IntCounterVec,
    request_duration_seconds: HistogramVec,
    agents_connected: IntGauge,
    agents_total: IntGauge,
    ip_pool_size: IntGauge,
    ip_pool_available: IntGauge,
    websocket_connections: IntGauge,
    agent_requests_total: IntCounterVec,
    response_size_bytes: HistogramVec,
    queue_depth: IntGaugeVec,
    uptime_seconds: Gauge,
}

impl PrometheusMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests_total = register_int_counter_vec_with_registry!(
            "http_dispatcher_requests_total",
            "Total resolved dispatch jobs",
            &["agent", "status", "method"],
            registry
        )?;
        let request_errors_total = register_int_counter_vec_with_registry!(
            "http_dispatcher_request_errors_total",
            "Resolved dispatch jobs that failed",
            &["agent", "error_type"],
            registry
        )?;
        let request_duration_seconds = register_histogram_vec_with_registry!(
            "http_dispatcher_request_duration_seconds",
            "Job latency from submit to resolution",
            &["agent", "method"],
            registry
        )?;
        let agents_connected = register_int_gauge_with_registry!(
            "http_dispatcher_agents_connected",
            "Agents currently live",
            registry
        )?;
        let agents_total = register_int_gauge_with_registry!(
            "http_dispatcher_agents_total",
            "Agents known to the registry",
            registry
        )?;
        let ip_pool_size = register_int_gauge_with_registry!(
            "http_dispatcher_ip_pool_size",
            "Source IPs in the pool",
            registry
        )?;
        let ip_pool_available = register_int_gauge_with_registry!(
            "http_dispatcher_ip_pool_available",
            "Source IPs owned by agents with spare capacity",
            registry
        )?;
        let websocket_connections = register_int_gauge_with_registry!(
            "http_dispatcher_websocket_connections",
            "Open agent control-plane sockets",
            registry
        )?;
        let agent_requests_total = register_int_counter_vec_with_registry!(
            "http_dispatcher_agent_requests_total",
            "Jobs dispatched per agent",
            &["agent"],
            registry
        )?;
        let response_size_bytes = register_histogram_vec_with_registry!(
            "http_dispatcher_response_size_bytes",
            "Response body sizes returned by agents",
            &["agent"],
            exponential_buckets(64.0, 4.0, 10)?,
            registry
        )?;
        let queue_depth = register_int_gauge_vec_with_registry!(
            "http_dispatcher_queue_depth",
            "In-flight jobs per agent",
            &["agent"],
            registry
        )?;
        let uptime_seconds = register_gauge_with_registry!(
            "http_dispatcher_uptime_seconds",
            "Seconds since coordinator start",
            registry
        )?;

        // touch it so the first scrape measures from construction
        Lazy::force(&STARTED_AT);

        Ok(Self {
            registry,
            requests_total,
            request_errors_total,
            request_duration_seconds,
            agents_connected,
            agents_total,
            ip_pool_size,
            ip_pool_available,
            websocket_connections,
            agent_requests_total,
            response_size_bytes,
            queue_depth,
            uptime_seconds,
        })
    }

    /// Sum of one counter family across all label sets (stats snapshot)
    pub fn counter_total(&self, name: &str) -> f64 {
        self.registry
            .gather()
            .iter()
            .filter(|family| family.get_name() == name)
            .flat_map(|family| family.get_metric())
            .map(|metric| metric.get_counter().get_value())
            .sum()
    }

    /// Render the Prometheus text exposition
    pub fn render(&self) -> Result<String, prometheus::Error> {
        self.uptime_seconds.set(STARTED_AT.elapsed().as_secs_f64());
        let encoder = TextEncoder::new();
        let mut out = Vec::new();
        encoder.encode(&self.registry.gather(), &mut out)?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }
}

impl MetricsSink for PrometheusMetrics {
    fn record_job(&self, agent: &str, method: &str, status: u16, duration_sec: f64, body_bytes: usize) {
        self.requests_total
            .with_label_values(&[agent, &status.to_string(), method])
            .inc();
        self.request_duration_seconds
            .with_label_values(&[agent, method])
            .observe(duration_sec);
        self.agent_requests_total.with_label_values(&[agent]).inc();
        self.response_size_bytes
            .with_label_values(&[agent])
            .observe(body_bytes as f64);
    }

    fn record_job_error(&self, agent: &str, method: &str, kind: ErrorKind, duration_sec: f64) {
        self.requests_total
            .with_label_values(&[agent, "error", method])
            .inc();
        self.request_errors_total
            .with_label_values(&[agent, kind.as_str()])
            .inc();
        self.request_duration_seconds
            .with_label_values(&[agent, method])
            .observe(duration_sec);
        self.agent_requests_total.with_label_values(&[agent]).inc();
    }

    fn set_queue_depth(&self, agent: &str, depth: i64) {
        self.queue_depth.with_label_values(&[agent]).set(depth);
    }

    fn set_agents(&self, connected: i64, total: i64) {
        self.agents_connected.set(connected);
        self.agents_total.set(total);
    }

    fn set_ws_connections(&self, connections: i64) {
        self.websocket_connections.set(connections);
    }

    fn set_pool_size(&self, size: i64) {
        self.ip_pool_size.set(size);
    }

    fn set_pool_available(&self, available: i64) {
        self.ip_pool_available.set(available);
    }
}
