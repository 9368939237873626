//! Relay mesh agent.
//!
//! Runs on every node of the overlay:
//!
//! - [`prober`] samples pairwise link quality over ICMP
//! - [`client`] pushes telemetry and pulls route directives, with retries
//!   and a fallback latch for sustained controller loss
//! - [`executor`] applies host-route overrides inside the tunnel subnet
//! - [`agent`] supervises the periodic ticks and graceful shutdown
//! - [`health`] serves the agent-local `/health` endpoint

pub mod agent;
pub mod client;
pub mod executor;
pub mod health;
pub mod prober;

pub use agent::{Agent, AgentConfig};
pub use client::{ClientError, ControllerClient, RetryClient};
pub use executor::{calculate_diff, Executor, ExecutorError, IpRouteCli, KernelRoute, RouteOps};
pub use prober::{IcmpProbe, Measurement, Prober, SampleWindow, SurgeProbe};
