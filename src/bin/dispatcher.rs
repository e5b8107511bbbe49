//! Entry point for both roles: `--mode coordinator` serves the REST API and
//! the agent control plane, `--mode agent` connects outward and executes
//! dispatched requests, `--mode monitoring` tails a coordinator's stats.
//!
//! Exit codes: 0 normal, 1 usage error, 2 unrecoverable startup failure.

use anyhow::{Context, Result};
use clap::error::ErrorKind as ClapError;
use clap::{Parser, ValueEnum};
use dotenvy::dotenv;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use dispatcher_core::{agent, coordinator, DispatcherConfig};

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    Coordinator,
    Agent,
    Monitoring,
}

#[derive(Parser, Debug)]
#[command(name = "http-dispatcher", version, about = "Distributed HTTP egress dispatcher")]
struct Args {
    #[arg(long, value_enum, env = "DISPATCHER_MODE", default_value_t = Mode::Coordinator)]
    mode: Mode,

    /// Configuration file (TOML); flags below override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Coordinator: interface to listen on
    #[arg(long)]
    host: Option<String>,

    /// Coordinator: port for the primary listener
    #[arg(long)]
    port: Option<u16>,

    /// Coordinator: additional HOST:PORT listeners (repeatable)
    #[arg(long = "bind")]
    binds: Vec<String>,

    /// Agent/monitoring: coordinator base URL
    #[arg(long, env = "DISPATCHER_COORDINATOR_URL")]
    coordinator_url: Option<String>,

    /// Agent identity; auto-generated as agent-<hostname>-<unix_ts> if omitted
    #[arg(long, env = "DISPATCHER_AGENT_ID")]
    agent_id: Option<String>,

    /// Log filter (tracing env-filter syntax)
    #[arg(long, env = "DISPATCHER_LOG_LEVEL")]
    log_level: Option<String>,
}

fn main() {
    dotenv().ok();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let code = match err.kind() {
                ClapError::DisplayHelp | ClapError::DisplayVersion => 0,
                _ => 1,
            };
            let _ = err.print();
            std::process::exit(code);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to start runtime: {err}");
            std::process::exit(2);
        }
    };

    if let Err(err) = runtime.block_on(run(args)) {
        error!(error = ?err, "startup failed");
        eprintln!("error: {err:#}");
        std::process::exit(2);
    }
}

async fn run(args: Args) -> Result<()> {
    let mut config = DispatcherConfig::load_from_path(args.config.as_ref())?;

    // explicit flags (and their env fallbacks) win over the config file
    if let Some(host) = args.host {
        config.coordinator.host = host;
    }
    if let Some(port) = args.port {
        config.coordinator.port = port;
    }
    if !args.binds.is_empty() {
        config.coordinator.binds = args.binds.clone();
    }
    if let Some(url) = args.coordinator_url {
        config.agent.coordinator_url = url;
    }
    if let Some(agent_id) = args.agent_id {
        config.agent.agent_id = Some(agent_id);
    }
    if let Some(level) = args.log_level {
        config.observability.log_level = level;
    }

    tracing_subscriber::fmt()
        .with_env_filter(config.observability.log_level.as_str())
        .init();

    let shutdown = CancellationToken::new();
    let ctrl_c_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            ctrl_c_token.cancel();
        }
    });

    match args.mode {
        Mode::Coordinator => coordinator::run(config.coordinator, shutdown).await,
        Mode::Agent => agent::run(config.agent, shutdown).await,
        Mode::Monitoring => monitor(config.agent.coordinator_url, shutdown).await,
    }
}

/// Headless stats tail: one log line per poll. The full-screen terminal UI
/// ships separately; this is enough for operation checks over ssh.
async fn monitor(coordinator_url: String, shutdown: CancellationToken) -> Result<()> {
    let base = coordinator_url
        .replace("wss://", "https://")
        .replace("ws://", "http://");
    let base = base.trim_end_matches('/').to_string();
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .context("monitoring client")?;

    info!(coordinator = %base, "monitoring coordinator");
    let mut ticker = tokio::time::interval(Duration::from_secs(2));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
        }

        let stats: Result<serde_json::Value> = async {
            let response = client.get(format!("{base}/api/stats")).send().await?;
            Ok(response.error_for_status()?.json().await?)
        }
        .await;

        match stats {
            Ok(stats) => info!(
                agents = stats["agents_connected"].as_u64().unwrap_or(0),
                pool = stats["ip_pool_size"].as_u64().unwrap_or(0),
                in_flight = stats["in_flight"].as_u64().unwrap_or(0),
                requests = stats["requests_total"].as_f64().unwrap_or(0.0),
                errors = stats["request_errors_total"].as_f64().unwrap_or(0.0),
                "coordinator stats"
            ),
            Err(err) => warn!(error = %err, "stats poll failed"),
        }
    }
}
