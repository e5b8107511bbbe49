//! HTTP Dispatcher - distributed HTTP egress
//!
//! A central coordinator accepts HTTP request jobs over a REST API and hands
//! each one to a connected agent, which performs the outbound request with
//! its socket bound to a coordinator-chosen local source IP. The union of all
//! agent-reported addresses forms the source-IP pool; selection is
//! round-robin with a churn-proof cursor.

pub mod agent;
pub mod config;
pub mod coordinator;
pub mod metrics;
pub mod protocol;
pub mod types;

pub use config::DispatcherConfig;
pub use types::{ErrorKind, Job, JobError, JobRequest, JobState, RequestConfig};
