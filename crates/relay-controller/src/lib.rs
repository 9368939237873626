//! Relay mesh controller.
//!
//! One controller per mesh:
//!
//! - [`store`] holds the latest telemetry per agent behind a readers/writer
//!   lock
//! - [`solver`] turns the topology into per-source route directives via
//!   shortest-path search with a hysteresis gate
//! - [`api`] is the HTTP surface agents talk to
//! - [`cleaner`] evicts agents that stopped reporting

pub mod api;
pub mod cleaner;
pub mod solver;
pub mod store;

pub use api::{router, AppState};
pub use cleaner::StaleCleaner;
pub use solver::{has_loop, RouteSolver};
pub use store::{AgentRecord, LinkMetrics, TopologyStore};

use std::time::Duration;

/// Validated controller configuration. Assembled by the caller
/// (environment, deployment tooling); defaults match the documented
/// operator defaults.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub listen_address: String,
    pub port: u16,
    /// Cost weight of one unit of loss, in milliseconds of latency.
    pub penalty_factor: f64,
    /// Minimum relative cost improvement before a route is republished.
    pub hysteresis: f64,
    pub stale_threshold: Duration,
    pub clean_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0".into(),
            port: 8000,
            penalty_factor: 100.0,
            hysteresis: 0.15,
            stale_threshold: Duration::from_secs(60),
            clean_interval: Duration::from_secs(60),
        }
    }
}
