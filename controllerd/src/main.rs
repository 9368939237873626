use anyhow::{Context, Result};
use relay_controller::{AppState, ControllerConfig, RouteSolver, StaleCleaner, TopologyStore};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn config_from_env() -> ControllerConfig {
    let defaults = ControllerConfig::default();
    ControllerConfig {
        listen_address: std::env::var("RELAY_LISTEN_ADDR").unwrap_or(defaults.listen_address),
        port: env_or("RELAY_PORT", defaults.port),
        penalty_factor: env_or("RELAY_PENALTY_FACTOR", defaults.penalty_factor),
        hysteresis: env_or("RELAY_HYSTERESIS", defaults.hysteresis),
        stale_threshold: Duration::from_secs(env_or(
            "RELAY_STALE_THRESHOLD_SECS",
            defaults.stale_threshold.as_secs(),
        )),
        clean_interval: Duration::from_secs(env_or(
            "RELAY_CLEAN_INTERVAL_SECS",
            defaults.clean_interval.as_secs(),
        )),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "relay_controllerd=debug,info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config_from_env();

    let store = Arc::new(TopologyStore::new());
    let solver = Arc::new(RouteSolver::new(config.penalty_factor, config.hysteresis));
    let cleaner = Arc::new(StaleCleaner::new(
        store.clone(),
        config.stale_threshold,
        config.clean_interval,
    ));
    cleaner.clone().start();

    let app = relay_controller::router(AppState {
        store,
        solver,
        cleaner: cleaner.clone(),
    });

    let addr = format!("{}:{}", config.listen_address, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(
        %addr,
        penalty_factor = config.penalty_factor,
        hysteresis = config.hysteresis,
        "controller listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    cleaner.stop().await;
    Ok(())
}
