//! Shared data model for the relay mesh control plane.
//!
//! Everything that crosses the wire between agents and the controller lives
//! here:
//!
//! - Telemetry reports (agent → controller)
//! - Route directives (controller → agent)
//! - The component-health model used by both `/health` endpoints
//! - The tunnel subnet guard applied to every routing decision

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod health;
pub mod subnet;

pub use health::{ComponentHealth, HealthReport, HealthStatus};
pub use subnet::TunnelSubnet;

/// Next-hop sentinel meaning "withdraw the override, use tunnel default".
pub const NEXT_HOP_DIRECT: &str = "direct";

/// Validation errors for inbound telemetry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("agent_id cannot be empty")]
    EmptyAgentId,
    #[error("timestamp must be positive")]
    InvalidTimestamp,
    #[error("metrics cannot be empty")]
    EmptyMetrics,
    #[error("target_ip cannot be empty")]
    EmptyTargetIp,
    #[error("rtt_ms cannot be negative")]
    NegativeRtt,
    #[error("loss_rate must be between 0.0 and 1.0")]
    InvalidLossRate,
}

/// Smoothed probe results for one peer, as published to the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerMetric {
    /// Tunnel IP of the probed peer.
    pub target_ip: String,
    /// Smoothed round-trip time in milliseconds. `None` means every sample
    /// in the window timed out; distinct from `Some(0.0)`.
    pub rtt_ms: Option<f64>,
    /// Smoothed loss fraction in `[0, 1]`.
    pub loss_rate: f64,
}

impl PeerMetric {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.target_ip.is_empty() {
            return Err(ValidationError::EmptyTargetIp);
        }
        if let Some(rtt) = self.rtt_ms {
            if rtt < 0.0 {
                return Err(ValidationError::NegativeRtt);
            }
        }
        if !(0.0..=1.0).contains(&self.loss_rate) {
            return Err(ValidationError::InvalidLossRate);
        }
        Ok(())
    }
}

/// One telemetry push from an agent: who, when, and what it measured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryReport {
    pub agent_id: String,
    /// Seconds since the Unix epoch, as observed by the agent.
    pub timestamp: i64,
    pub metrics: Vec<PeerMetric>,
}

impl TelemetryReport {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.agent_id.is_empty() {
            return Err(ValidationError::EmptyAgentId);
        }
        if self.timestamp <= 0 {
            return Err(ValidationError::InvalidTimestamp);
        }
        if self.metrics.is_empty() {
            return Err(ValidationError::EmptyMetrics);
        }
        for metric in &self.metrics {
            metric.validate()?;
        }
        Ok(())
    }
}

/// Why a directive was published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteReason {
    /// Relay through a healthier peer beats the direct path.
    OptimizedPath,
    /// Direct tunnel routing; any override should be withdrawn.
    Default,
}

/// One routing decision for a single destination host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDirective {
    /// Destination as a `/32` host route, e.g. `"10.254.0.3/32"`.
    pub dst_cidr: String,
    /// Relay tunnel IP, or [`NEXT_HOP_DIRECT`].
    pub next_hop: String,
    pub reason: RouteReason,
}

impl RouteDirective {
    /// Relay `dst` through `via`.
    pub fn relay(dst: impl std::fmt::Display, via: impl Into<String>) -> Self {
        Self {
            dst_cidr: format!("{dst}/32"),
            next_hop: via.into(),
            reason: RouteReason::OptimizedPath,
        }
    }

    /// Withdraw any override for `dst`; tunnel default routing applies.
    pub fn direct(dst: impl std::fmt::Display) -> Self {
        Self {
            dst_cidr: format!("{dst}/32"),
            next_hop: NEXT_HOP_DIRECT.to_string(),
            reason: RouteReason::Default,
        }
    }

    pub fn is_direct(&self) -> bool {
        self.next_hop == NEXT_HOP_DIRECT
    }
}

/// Body of `GET /api/v1/routes` responses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutesResponse {
    pub routes: Vec<RouteDirective>,
}

/// Body of every 4xx/5xx response on the control-plane API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub detail: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_report() -> TelemetryReport {
        TelemetryReport {
            agent_id: "10.254.0.1".into(),
            timestamp: 1_700_000_000,
            metrics: vec![
                PeerMetric {
                    target_ip: "10.254.0.2".into(),
                    rtt_ms: Some(12.5),
                    loss_rate: 0.1,
                },
                PeerMetric {
                    target_ip: "10.254.0.3".into(),
                    rtt_ms: None,
                    loss_rate: 1.0,
                },
            ],
        }
    }

    #[test]
    fn valid_report_passes() {
        assert_eq!(sample_report().validate(), Ok(()));
    }

    #[test]
    fn empty_agent_id_rejected() {
        let mut report = sample_report();
        report.agent_id.clear();
        assert_eq!(report.validate(), Err(ValidationError::EmptyAgentId));
    }

    #[test]
    fn non_positive_timestamp_rejected() {
        let mut report = sample_report();
        report.timestamp = 0;
        assert_eq!(report.validate(), Err(ValidationError::InvalidTimestamp));
        report.timestamp = -5;
        assert_eq!(report.validate(), Err(ValidationError::InvalidTimestamp));
    }

    #[test]
    fn empty_metrics_rejected() {
        let mut report = sample_report();
        report.metrics.clear();
        assert_eq!(report.validate(), Err(ValidationError::EmptyMetrics));
    }

    #[test]
    fn negative_rtt_rejected() {
        let mut report = sample_report();
        report.metrics[0].rtt_ms = Some(-10.0);
        assert_eq!(report.validate(), Err(ValidationError::NegativeRtt));
    }

    #[test]
    fn out_of_range_loss_rejected() {
        let mut report = sample_report();
        report.metrics[0].loss_rate = 1.5;
        assert_eq!(report.validate(), Err(ValidationError::InvalidLossRate));
        report.metrics[0].loss_rate = -0.1;
        assert_eq!(report.validate(), Err(ValidationError::InvalidLossRate));
    }

    #[test]
    fn absent_rtt_serializes_as_null() {
        let report = sample_report();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["metrics"][1]["rtt_ms"], serde_json::Value::Null);
    }

    #[test]
    fn report_round_trips() {
        let report = sample_report();
        let bytes = serde_json::to_vec(&report).unwrap();
        let back: TelemetryReport = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, report);
    }

    #[test]
    fn reason_wire_strings() {
        let relay = RouteDirective::relay("10.254.0.3", "10.254.0.2");
        let json = serde_json::to_value(&relay).unwrap();
        assert_eq!(json["reason"], "optimized_path");
        assert_eq!(json["dst_cidr"], "10.254.0.3/32");

        let direct = RouteDirective::direct("10.254.0.3");
        let json = serde_json::to_value(&direct).unwrap();
        assert_eq!(json["reason"], "default");
        assert_eq!(json["next_hop"], "direct");
        assert!(direct.is_direct());
    }
}
