//! Agent-local health endpoint.
//!
//! Exposes the same `/health` contract as the controller: 200 while no
//! component is unhealthy, 503 otherwise, with the full component report as
//! the body either way.

use crate::agent::Agent;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use relay_models::HealthReport;
use std::sync::Arc;

pub fn router(agent: Arc<Agent>) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .with_state(agent)
}

async fn handle_health(State(agent): State<Arc<Agent>>) -> (StatusCode, Json<HealthReport>) {
    let report = agent.health_report();
    let code = if report.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentConfig;
    use crate::executor::{ExecutorError, KernelRoute, RouteOps};
    use crate::prober::{IcmpProbe, Measurement};
    use async_trait::async_trait;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    struct NoProbe;

    #[async_trait]
    impl IcmpProbe for NoProbe {
        async fn probe(&self, _target: Ipv4Addr, _timeout: Duration) -> Measurement {
            Measurement::lost()
        }
    }

    struct NoOps;

    #[async_trait]
    impl RouteOps for NoOps {
        async fn list(&self, _device: &str) -> Result<Vec<KernelRoute>, ExecutorError> {
            Ok(Vec::new())
        }
        async fn replace(
            &self,
            _dst: Ipv4Addr,
            _via: Ipv4Addr,
            _device: &str,
        ) -> Result<(), ExecutorError> {
            Ok(())
        }
        async fn delete(&self, _dst: Ipv4Addr, _device: &str) -> Result<(), ExecutorError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn health_returns_503_until_the_prober_runs() {
        let agent = Arc::new(
            Agent::new(AgentConfig::default(), Arc::new(NoProbe), Arc::new(NoOps)).unwrap(),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(agent.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let resp = reqwest::get(format!("http://{addr}/health")).await.unwrap();
        assert_eq!(resp.status(), 503);
        let body: HealthReport = resp.json().await.unwrap();
        assert!(body.components.contains_key("prober"));
        assert!(body.components.contains_key("controller_connection"));

        agent.clone().start();
        let resp = reqwest::get(format!("http://{addr}/health")).await.unwrap();
        assert_eq!(resp.status(), 200);
        agent.stop().await;
    }
}
