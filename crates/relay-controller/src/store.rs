//! In-memory topology store: the last accepted telemetry report per agent.
//!
//! Records are immutable once inserted and shared by `Arc`, so `get_all`
//! hands out a cheap snapshot that stays valid while writers proceed.

use chrono::{DateTime, Utc};
use relay_models::TelemetryReport;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Stored link metrics toward one probe target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkMetrics {
    pub rtt_ms: Option<f64>,
    pub loss_rate: f64,
}

/// One agent's latest accepted report.
#[derive(Debug, Clone)]
pub struct AgentRecord {
    /// When the controller accepted the report.
    pub received_at: DateTime<Utc>,
    /// target tunnel IP → link metrics.
    pub metrics: HashMap<String, LinkMetrics>,
}

/// Concurrent map of agent id → [`AgentRecord`].
#[derive(Default)]
pub struct TopologyStore {
    records: RwLock<HashMap<String, Arc<AgentRecord>>>,
}

impl TopologyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically replace the record for the report's agent.
    pub async fn store(&self, report: &TelemetryReport) {
        let metrics = report
            .metrics
            .iter()
            .map(|m| {
                (
                    m.target_ip.clone(),
                    LinkMetrics {
                        rtt_ms: m.rtt_ms,
                        loss_rate: m.loss_rate,
                    },
                )
            })
            .collect();

        let record = Arc::new(AgentRecord {
            received_at: Utc::now(),
            metrics,
        });
        self.records
            .write()
            .await
            .insert(report.agent_id.clone(), record);
    }

    pub async fn get(&self, agent_id: &str) -> Option<Arc<AgentRecord>> {
        self.records.read().await.get(agent_id).cloned()
    }

    /// Snapshot of the whole store. Entries are shared, not copied.
    pub async fn get_all(&self) -> HashMap<String, Arc<AgentRecord>> {
        self.records.read().await.clone()
    }

    pub async fn exists(&self, agent_id: &str) -> bool {
        self.records.read().await.contains_key(agent_id)
    }

    pub async fn count(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn agent_ids(&self) -> Vec<String> {
        self.records.read().await.keys().cloned().collect()
    }

    /// Most recent reception time across all records.
    pub async fn last_update(&self) -> Option<DateTime<Utc>> {
        self.records
            .read()
            .await
            .values()
            .map(|r| r.received_at)
            .max()
    }

    /// Remove records older than `threshold`; returns how many went away.
    pub async fn clean_stale(&self, threshold: Duration) -> usize {
        let limit = chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();

        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, record| now.signed_duration_since(record.received_at) <= limit);
        before - records.len()
    }
}
