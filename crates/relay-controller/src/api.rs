//! Control-plane HTTP surface.
//!
//! | Method | Path              | Success              | Failure          |
//! |--------|-------------------|----------------------|------------------|
//! | POST   | /api/v1/telemetry | 200 `{"status":"ok"}`| 400 invalid body |
//! | GET    | /api/v1/routes    | 200 `{"routes":[…]}` | 400 / 404        |
//! | GET    | /health           | 200 health report    | 503 unhealthy    |
//!
//! Every failure body is `{"detail": "<message>"}`.

use crate::cleaner::StaleCleaner;
use crate::solver::RouteSolver;
use crate::store::TopologyStore;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use relay_models::{
    ComponentHealth, ErrorResponse, HealthReport, HealthStatus, RoutesResponse, TelemetryReport,
};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<TopologyStore>,
    pub solver: Arc<RouteSolver>,
    pub cleaner: Arc<StaleCleaner>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/telemetry", post(ingest_telemetry))
        .route("/api/v1/routes", get(get_routes))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Error response carrying the status code and a human-readable detail.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn bad_request(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            detail: detail.into(),
        }
    }

    fn not_found(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            detail: detail.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                detail: self.detail,
            }),
        )
            .into_response()
    }
}

async fn ingest_telemetry(
    State(state): State<AppState>,
    payload: Result<Json<TelemetryReport>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(report) = payload
        .map_err(|rej| ApiError::bad_request(format!("Invalid JSON: {}", rej.body_text())))?;
    report
        .validate()
        .map_err(|err| ApiError::bad_request(err.to_string()))?;

    state.store.store(&report).await;
    tracing::info!(
        agent_id = %report.agent_id,
        metrics = report.metrics.len(),
        "accepted telemetry"
    );
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

#[derive(Deserialize)]
struct RoutesQuery {
    agent_id: Option<String>,
}

async fn get_routes(
    State(state): State<AppState>,
    Query(query): Query<RoutesQuery>,
) -> Result<Json<RoutesResponse>, ApiError> {
    let agent_id = match query.agent_id {
        Some(id) if !id.is_empty() => id,
        _ => return Err(ApiError::bad_request("agent_id query parameter is required")),
    };

    if !state.store.exists(&agent_id).await {
        return Err(ApiError::not_found(
            "Agent not found. Has it sent telemetry?",
        ));
    }

    let routes = state.solver.compute_routes(&state.store, &agent_id).await;
    tracing::info!(agent_id = %agent_id, routes = routes.len(), "computed routes");
    Ok(Json(RoutesResponse { routes }))
}

async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthReport>) {
    let mut report = HealthReport::new();

    let mut store_health = ComponentHealth::new(HealthStatus::Healthy)
        .detail("agent_count", state.store.count().await as u64);
    store_health = match state.store.last_update().await {
        Some(t) => store_health.detail("last_update", t.to_rfc3339()),
        None => store_health.detail("last_update", Value::Null),
    };
    report.add_component("topology_store", store_health);

    report.add_component(
        "cleaner",
        ComponentHealth::new(HealthStatus::Healthy)
            .detail("evicted_total", state.cleaner.evicted_total())
            .detail("stale_threshold_s", state.cleaner.threshold().as_secs()),
    );

    let code = if report.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(report))
}
