//! Component health model shared by the agent and controller `/health`
//! endpoints.
//!
//! Aggregation rule: `unhealthy` dominates `degraded` dominates `healthy`.
//! The HTTP layer maps an unhealthy report to 503, everything else to 200.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Health of one named component plus free-form diagnostic details.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: HealthStatus,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub details: serde_json::Map<String, Value>,
    /// RFC 3339 timestamp of when this component was last inspected.
    pub last_check: String,
}

impl ComponentHealth {
    pub fn new(status: HealthStatus) -> Self {
        Self {
            status,
            details: serde_json::Map::new(),
            last_check: Utc::now().to_rfc3339(),
        }
    }

    /// Attach one diagnostic detail; chainable.
    pub fn detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

/// Aggregated health report for a whole process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub components: BTreeMap<String, ComponentHealth>,
    pub timestamp: String,
}

impl HealthReport {
    pub fn new() -> Self {
        Self {
            status: HealthStatus::Healthy,
            components: BTreeMap::new(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    pub fn add_component(&mut self, name: &str, health: ComponentHealth) {
        match health.status {
            HealthStatus::Unhealthy => self.status = HealthStatus::Unhealthy,
            HealthStatus::Degraded => {
                if self.status == HealthStatus::Healthy {
                    self.status = HealthStatus::Degraded;
                }
            }
            HealthStatus::Healthy => {}
        }
        self.components.insert(name.to_string(), health);
    }

    pub fn is_healthy(&self) -> bool {
        !self
            .components
            .values()
            .any(|c| c.status == HealthStatus::Unhealthy)
    }
}

impl Default for HealthReport {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_serialize_lowercase() {
        assert_eq!(
            serde_json::to_value(HealthStatus::Degraded).unwrap(),
            "degraded"
        );
        assert_eq!(
            serde_json::to_value(HealthStatus::Unhealthy).unwrap(),
            "unhealthy"
        );
    }

    #[test]
    fn unhealthy_dominates_degraded() {
        let mut report = HealthReport::new();
        report.add_component("a", ComponentHealth::new(HealthStatus::Degraded));
        assert_eq!(report.status, HealthStatus::Degraded);
        report.add_component("b", ComponentHealth::new(HealthStatus::Unhealthy));
        assert_eq!(report.status, HealthStatus::Unhealthy);
        // A later healthy component cannot improve the aggregate.
        report.add_component("c", ComponentHealth::new(HealthStatus::Healthy));
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert!(!report.is_healthy());
    }

    #[test]
    fn degraded_report_is_still_healthy_for_http() {
        let mut report = HealthReport::new();
        report.add_component("a", ComponentHealth::new(HealthStatus::Degraded));
        assert!(report.is_healthy());
    }

    #[test]
    fn details_carried_through() {
        let health = ComponentHealth::new(HealthStatus::Healthy)
            .detail("agent_count", 3)
            .detail("running", true);
        let json = serde_json::to_value(&health).unwrap();
        assert_eq!(json["details"]["agent_count"], 3);
        assert_eq!(json["details"]["running"], true);
    }
}
