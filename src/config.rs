//! # Configuration
//!
//! Layered configuration for both modes: built-in defaults, an optional TOML
//! file, then `DISPATCHER_*` environment variables (double-underscore
//! separator for nested keys, e.g. `DISPATCHER_COORDINATOR__PORT`).

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_PATH: &str = "configs/dispatcher.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub coordinator: CoordinatorSettings,
    pub agent: AgentSettings,
    pub observability: ObservabilitySettings,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            coordinator: CoordinatorSettings::default(),
            agent: AgentSettings::default(),
            observability: ObservabilitySettings::default(),
        }
    }
}

impl DispatcherConfig {
    pub fn load() -> Result<Self> {
        Self::load_from_path(None::<PathBuf>)
    }

    pub fn load_from_path<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        let mut builder = Config::builder().add_source(
            File::from(PathBuf::from(DEFAULT_CONFIG_PATH))
                .format(FileFormat::Toml)
                .required(false),
        );

        if let Some(path) = path {
            builder = builder.add_source(
                File::from(path.as_ref())
                    .format(FileFormat::Toml)
                    .required(true),
            );
        }

        builder = builder.add_source(Environment::with_prefix("DISPATCHER").separator("__"));

        let config: Self = builder
            .build()?
            .try_deserialize()
            .context("invalid dispatcher configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        match self.coordinator.fairness {
            Fairness::PerIp => {}
        }
        if self.coordinator.max_in_flight_per_agent == 0 {
            bail!("coordinator.max_in_flight_per_agent must be at least 1");
        }
        if self.coordinator.max_total_in_flight == 0 {
            bail!("coordinator.max_total_in_flight must be at least 1");
        }
        if self.coordinator.history_capacity == 0 {
            bail!("coordinator.history_capacity must be at least 1");
        }
        Ok(())
    }
}

/// Pool fairness policy. Only `per-ip` is implemented; `per-agent` rotation
/// (agents first, then that agent's addresses) is a known variant and is
/// rejected at deserialization until it exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Fairness {
    #[serde(rename = "per-ip")]
    PerIp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorSettings {
    pub host: String,
    pub port: u16,
    /// Additional HOST:PORT listeners serving the same API
    pub binds: Vec<String>,
    pub heartbeat_interval_secs: u64,
    /// Agents silent for this long are declared dead (3x heartbeat interval)
    pub heartbeat_timeout_secs: u64,
    pub max_in_flight_per_agent: usize,
    pub max_total_in_flight: usize,
    pub history_capacity: usize,
    /// Response bodies stored in history are truncated to this many bytes
    pub history_body_cap: usize,
    pub fairness: Fairness,
    pub default_timeout_secs: f64,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            binds: Vec::new(),
            heartbeat_interval_secs: 15,
            heartbeat_timeout_secs: 45,
            max_in_flight_per_agent: 64,
            max_total_in_flight: 4096,
            history_capacity: 1000,
            history_body_cap: 64 * 1024,
            fairness: Fairness::PerIp,
            default_timeout_secs: crate::types::DEFAULT_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub coordinator_url: String,
    /// Auto-generated as `agent-<hostname>-<unix_ts>` when unset
    pub agent_id: Option<String>,
    pub max_in_flight: usize,
    pub heartbeat_interval_secs: u64,
    /// Advertise these addresses instead of the scanned inventory
    /// (operator pinning; also what the integration tests use)
    pub advertise_addresses: Option<Vec<String>>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            coordinator_url: "ws://127.0.0.1:8000".to_string(),
            agent_id: None,
            max_in_flight: 64,
            heartbeat_interval_secs: 15,
            advertise_addresses: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilitySettings {
    pub log_level: String,
}

impl Default for ObservabilitySettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}
