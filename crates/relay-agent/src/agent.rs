//! Agent supervisor: wires the prober, control-plane client, and route
//! executor together and drives the periodic telemetry and sync ticks.

use crate::client::{ClientError, RetryClient};
use crate::executor::{Executor, RouteOps};
use crate::prober::{IcmpProbe, Prober};
use chrono::Utc;
use relay_models::{ComponentHealth, HealthReport, HealthStatus, TelemetryReport, TunnelSubnet};
use serde_json::Value;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Validated agent configuration. Assembled by the caller (environment,
/// deployment tooling); defaults match the documented operator defaults.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// This node's identity on the control plane: its tunnel IP as a string.
    pub agent_id: String,
    pub controller_url: String,
    pub controller_timeout: Duration,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub probe_window: usize,
    pub sync_interval: Duration,
    pub retry_attempts: u32,
    pub retry_backoff: Vec<Duration>,
    pub interface: String,
    pub subnet: TunnelSubnet,
    pub peer_ips: Vec<Ipv4Addr>,
    pub shutdown_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_id: String::new(),
            controller_url: "http://127.0.0.1:8000".into(),
            controller_timeout: Duration::from_secs(5),
            probe_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(2),
            probe_window: 10,
            sync_interval: Duration::from_secs(10),
            retry_attempts: 3,
            retry_backoff: vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
            ],
            interface: "wg0".into(),
            subnet: TunnelSubnet::default(),
            peer_ips: Vec::new(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

struct SupervisorTasks {
    stop: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

/// The per-node agent process: probes peers, reports telemetry, and applies
/// the controller's route directives to the kernel.
pub struct Agent {
    config: AgentConfig,
    prober: Arc<Prober>,
    client: Arc<RetryClient>,
    executor: Arc<Executor>,
    accept_new: AtomicBool,
    inflight: AtomicI64,
    running: AtomicBool,
    control: parking_lot::Mutex<Option<SupervisorTasks>>,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        probe: Arc<dyn IcmpProbe>,
        route_ops: Arc<dyn RouteOps>,
    ) -> Result<Self, ClientError> {
        let prober = Arc::new(Prober::new(
            config.peer_ips.clone(),
            config.probe_interval,
            config.probe_timeout,
            config.probe_window,
            probe,
        ));
        let client = Arc::new(RetryClient::new(
            config.controller_url.clone(),
            config.controller_timeout,
            config.retry_attempts,
            config.retry_backoff.clone(),
        )?);
        let executor = Arc::new(Executor::new(
            config.interface.clone(),
            config.subnet,
            route_ops,
        ));

        Ok(Self {
            config,
            prober,
            client,
            executor,
            accept_new: AtomicBool::new(true),
            inflight: AtomicI64::new(0),
            running: AtomicBool::new(false),
            control: parking_lot::Mutex::new(None),
        })
    }

    /// Start the prober and both supervisor ticks. Idempotent.
    pub fn start(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(agent_id = %self.config.agent_id, "agent starting");

        self.prober.clone().start();

        let (stop, _) = watch::channel(false);
        let handles = vec![
            tokio::spawn(Self::telemetry_loop(Arc::clone(&self), stop.subscribe())),
            tokio::spawn(Self::sync_loop(Arc::clone(&self), stop.subscribe())),
        ];
        *self.control.lock() = Some(SupervisorTasks { stop, handles });

        tracing::info!(agent_id = %self.config.agent_id, "agent started");
    }

    async fn telemetry_loop(agent: Arc<Agent>, mut stopped: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(agent.config.sync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // Skip the immediate tick so the first report has a probe window
        // behind it.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => agent.telemetry_tick().await,
                _ = stopped.changed() => return,
            }
        }
    }

    async fn sync_loop(agent: Arc<Agent>, mut stopped: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(agent.config.sync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => agent.sync_tick().await,
                _ = stopped.changed() => return,
            }
        }
    }

    async fn telemetry_tick(&self) {
        if !self.accept_new.load(Ordering::SeqCst) {
            return;
        }
        let metrics = self.prober.smoothed_metrics();
        if metrics.is_empty() {
            tracing::debug!("no peers configured, skipping telemetry");
            return;
        }

        let report = TelemetryReport {
            agent_id: self.config.agent_id.clone(),
            timestamp: Utc::now().timestamp(),
            metrics,
        };

        self.inflight.fetch_add(1, Ordering::SeqCst);
        let result = self.client.send_telemetry_with_retry(&report).await;
        self.inflight.fetch_sub(1, Ordering::SeqCst);

        if let Err(err) = result {
            tracing::error!(error = %err, "failed to push telemetry");
            if self.client.should_enter_fallback() {
                self.enter_fallback().await;
            }
        }
    }

    async fn sync_tick(&self) {
        if self.client.is_in_fallback() {
            self.inflight.fetch_add(1, Ordering::SeqCst);
            let health = self.client.check_health().await;
            self.inflight.fetch_sub(1, Ordering::SeqCst);
            if health.is_ok() {
                tracing::info!("controller reachable again");
                self.client.reset_failure_count();
            }
            return;
        }

        self.inflight.fetch_add(1, Ordering::SeqCst);
        let result = self.client.get_routes_with_retry(&self.config.agent_id).await;
        self.inflight.fetch_sub(1, Ordering::SeqCst);

        match result {
            Ok(routes) => {
                if !routes.is_empty() {
                    tracing::info!(count = routes.len(), "received route directives");
                    self.executor.sync_routes(&routes).await;
                }
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to pull routes");
                if self.client.should_enter_fallback() {
                    self.enter_fallback().await;
                }
            }
        }
    }

    async fn enter_fallback(&self) {
        self.client.enter_fallback();
        match self.executor.flush_routes().await {
            Ok(removed) => {
                tracing::warn!(removed, "fallback: relay routes withdrawn, tunnel defaults apply")
            }
            Err(err) => tracing::error!(error = %err, "fallback: failed to flush routes"),
        }
    }

    /// Stop the prober and both supervisor ticks and wait for them.
    /// Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.prober.stop().await;
        let tasks = self.control.lock().take();
        if let Some(tasks) = tasks {
            let _ = tasks.stop.send(true);
            for handle in tasks.handles {
                let _ = handle.await;
            }
        }
    }

    /// Graceful shutdown: stop taking probe results, stop the prober,
    /// signal both supervisor ticks, then wait for them and any in-flight
    /// control-plane calls to finish, bounded by `deadline`. Tasks still
    /// running at the deadline are aborted. Managed routes are withdrawn
    /// last; cleanup errors are logged and never abort later steps.
    pub async fn shutdown(&self, deadline: Duration) {
        tracing::info!(agent_id = %self.config.agent_id, "agent shutting down");

        self.accept_new.store(false, Ordering::SeqCst);
        self.prober.stop().await;

        // Signal the loops but join them under the deadline below: a tick
        // that is mid-retry only notices the signal once its HTTP call
        // returns.
        self.running.store(false, Ordering::SeqCst);
        let mut handles = match self.control.lock().take() {
            Some(tasks) => {
                let _ = tasks.stop.send(true);
                tasks.handles
            }
            None => Vec::new(),
        };

        let settled = tokio::time::timeout(deadline, async {
            for handle in &mut handles {
                let _ = handle.await;
            }
            self.drain_inflight().await;
        })
        .await;

        if settled.is_err() {
            tracing::warn!(
                remaining = self.inflight.load(Ordering::SeqCst),
                "shutdown deadline hit with requests in flight, aborting supervisor tasks"
            );
            for handle in &handles {
                handle.abort();
            }
        }

        let (cleaned, errors) = self.executor.cleanup_managed_routes().await;
        for err in &errors {
            tracing::error!(error = %err, "route cleanup error");
        }
        tracing::info!(
            cleaned,
            errors = errors.len(),
            "agent shutdown complete"
        );
    }

    async fn drain_inflight(&self) {
        let mut ticker = tokio::time::interval(Duration::from_millis(100));
        loop {
            ticker.tick().await;
            if self.inflight.load(Ordering::SeqCst) == 0 {
                return;
            }
        }
    }

    pub fn health_report(&self) -> HealthReport {
        let mut report = HealthReport::new();

        let running = self.prober.is_running();
        let mut prober_health = ComponentHealth::new(if running {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        })
        .detail("running", running)
        .detail("success_rate", self.prober.success_rate());
        prober_health = match self.prober.last_probe_time() {
            Some(t) => prober_health.detail("last_probe_time", t.to_rfc3339()),
            None => prober_health.detail("last_probe_time", Value::Null),
        };
        report.add_component("prober", prober_health);

        let in_fallback = self.client.is_in_fallback();
        let connection = ComponentHealth::new(if in_fallback {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        })
        .detail("in_fallback", in_fallback)
        .detail("controller_url", self.config.controller_url.clone());
        report.add_component("controller_connection", connection);

        report
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn prober(&self) -> &Arc<Prober> {
        &self.prober
    }

    pub fn client(&self) -> &Arc<RetryClient> {
        &self.client
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
