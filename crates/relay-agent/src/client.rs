//! HTTP client for the controller: telemetry push, route pull, and the
//! fallback latch with bounded-backoff retries.
//!
//! Retry shape: an operation makes `max_retries + 1` attempts; the delay
//! before attempt `k` is the `k-1`th entry of the backoff table, clamped to
//! its last entry. Exhausting every attempt counts one failure toward the
//! latch; any success (including an explicit health probe) resets it and
//! leaves fallback.

use parking_lot::Mutex;
use relay_models::{ErrorResponse, RouteDirective, RoutesResponse, TelemetryReport};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("agent not found")]
    AgentNotFound,
    #[error("{operation} returned status {status}: {detail}")]
    Status {
        operation: &'static str,
        status: u16,
        detail: String,
    },
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

/// Plain single-shot client for the controller API.
pub struct ControllerClient {
    base_url: String,
    http: reqwest::Client,
}

impl ControllerClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { base_url, http })
    }

    pub async fn send_telemetry(&self, report: &TelemetryReport) -> Result<(), ClientError> {
        let url = format!("{}/api/v1/telemetry", self.base_url);
        let resp = self.http.post(&url).json(report).send().await?;
        Self::check("telemetry", resp).await.map(drop)
    }

    pub async fn get_routes(&self, agent_id: &str) -> Result<Vec<RouteDirective>, ClientError> {
        let url = format!("{}/api/v1/routes", self.base_url);
        let resp = self
            .http
            .get(&url)
            .query(&[("agent_id", agent_id)])
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ClientError::AgentNotFound);
        }
        let resp = Self::check("routes", resp).await?;
        let body: RoutesResponse = resp.json().await?;
        Ok(body.routes)
    }

    pub async fn check_health(&self) -> Result<(), ClientError> {
        let url = format!("{}/health", self.base_url);
        let resp = self.http.get(&url).send().await?;
        Self::check("health", resp).await.map(drop)
    }

    async fn check(
        operation: &'static str,
        resp: reqwest::Response,
    ) -> Result<reqwest::Response, ClientError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let detail = match resp.json::<ErrorResponse>().await {
            Ok(body) => body.detail,
            Err(_) => String::from("<no body>"),
        };
        Err(ClientError::Status {
            operation,
            status: status.as_u16(),
            detail,
        })
    }
}

struct Latch {
    failure_count: u32,
    in_fallback: bool,
}

/// Retry + fallback wrapper around [`ControllerClient`].
pub struct RetryClient {
    client: ControllerClient,
    max_retries: u32,
    backoff: Vec<Duration>,
    latch: Mutex<Latch>,
}

impl RetryClient {
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        max_retries: u32,
        backoff: Vec<Duration>,
    ) -> Result<Self, ClientError> {
        Ok(Self {
            client: ControllerClient::new(base_url, timeout)?,
            max_retries,
            backoff,
            latch: Mutex::new(Latch {
                failure_count: 0,
                in_fallback: false,
            }),
        })
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        if self.backoff.is_empty() {
            return Duration::ZERO;
        }
        let idx = ((attempt - 1) as usize).min(self.backoff.len() - 1);
        self.backoff[idx]
    }

    pub async fn send_telemetry_with_retry(
        &self,
        report: &TelemetryReport,
    ) -> Result<(), ClientError> {
        let mut attempt = 0;
        loop {
            match self.client.send_telemetry(report).await {
                Ok(()) => {
                    self.note_success();
                    return Ok(());
                }
                Err(err) => {
                    tracing::warn!(error = %err, attempt, "telemetry push failed");
                    if attempt >= self.max_retries {
                        self.note_exhausted();
                        return Err(err);
                    }
                    attempt += 1;
                    let delay = self.backoff_delay(attempt);
                    tracing::warn!(
                        attempt,
                        max = self.max_retries,
                        delay_s = delay.as_secs_f64(),
                        "retrying telemetry push"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    pub async fn get_routes_with_retry(
        &self,
        agent_id: &str,
    ) -> Result<Vec<RouteDirective>, ClientError> {
        let mut attempt = 0;
        loop {
            match self.client.get_routes(agent_id).await {
                Ok(routes) => {
                    self.note_success();
                    return Ok(routes);
                }
                Err(err) => {
                    tracing::warn!(error = %err, attempt, "route pull failed");
                    if attempt >= self.max_retries {
                        self.note_exhausted();
                        return Err(err);
                    }
                    attempt += 1;
                    let delay = self.backoff_delay(attempt);
                    tracing::warn!(
                        attempt,
                        max = self.max_retries,
                        delay_s = delay.as_secs_f64(),
                        "retrying route pull"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Single-shot health probe; a success leaves fallback like any other
    /// successful operation, a failure does not count toward the latch.
    pub async fn check_health(&self) -> Result<(), ClientError> {
        self.client.check_health().await?;
        self.note_success();
        Ok(())
    }

    fn note_success(&self) {
        let mut latch = self.latch.lock();
        latch.failure_count = 0;
        if latch.in_fallback {
            latch.in_fallback = false;
            tracing::info!("controller recovered, leaving fallback mode");
        }
    }

    fn note_exhausted(&self) {
        self.latch.lock().failure_count += 1;
    }

    pub fn should_enter_fallback(&self) -> bool {
        let latch = self.latch.lock();
        latch.failure_count >= self.max_retries && !latch.in_fallback
    }

    pub fn enter_fallback(&self) {
        let mut latch = self.latch.lock();
        tracing::warn!(
            failures = latch.failure_count,
            "entering fallback mode"
        );
        latch.in_fallback = true;
    }

    pub fn is_in_fallback(&self) -> bool {
        self.latch.lock().in_fallback
    }

    pub fn reset_failure_count(&self) {
        self.latch.lock().failure_count = 0;
    }

    pub fn failure_count(&self) -> u32 {
        self.latch.lock().failure_count
    }
}
