use anyhow::{bail, Context, Result};
use relay_agent::{Agent, AgentConfig, IpRouteCli, SurgeProbe};
use relay_models::TunnelSubnet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn config_from_env() -> Result<AgentConfig> {
    let agent_id = match std::env::var("RELAY_AGENT_ID") {
        Ok(id) if !id.is_empty() => id,
        _ => bail!("RELAY_AGENT_ID must be set to this node's tunnel IP"),
    };

    let subnet: TunnelSubnet = std::env::var("RELAY_SUBNET")
        .unwrap_or_else(|_| "10.254.0.0/24".into())
        .parse()
        .context("RELAY_SUBNET is not a valid IPv4 CIDR")?;

    let peer_ips: Vec<Ipv4Addr> = std::env::var("RELAY_PEER_IPS")
        .unwrap_or_default()
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|s| {
            s.trim()
                .parse()
                .with_context(|| format!("bad peer IP {s:?} in RELAY_PEER_IPS"))
        })
        .collect::<Result<_>>()?;

    let retry_backoff: Vec<Duration> = std::env::var("RELAY_RETRY_BACKOFF_SECS")
        .unwrap_or_else(|_| "1,2,4".into())
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|s| {
            s.trim()
                .parse()
                .map(Duration::from_secs)
                .with_context(|| format!("bad backoff entry {s:?} in RELAY_RETRY_BACKOFF_SECS"))
        })
        .collect::<Result<_>>()?;

    Ok(AgentConfig {
        agent_id,
        controller_url: std::env::var("RELAY_CONTROLLER_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8000".into()),
        controller_timeout: Duration::from_secs(env_or("RELAY_CONTROLLER_TIMEOUT_SECS", 5)),
        probe_interval: Duration::from_secs(env_or("RELAY_PROBE_INTERVAL_SECS", 5)),
        probe_timeout: Duration::from_secs(env_or("RELAY_PROBE_TIMEOUT_SECS", 2)),
        probe_window: env_or("RELAY_PROBE_WINDOW", 10),
        sync_interval: Duration::from_secs(env_or("RELAY_SYNC_INTERVAL_SECS", 10)),
        retry_attempts: env_or("RELAY_RETRY_ATTEMPTS", 3),
        retry_backoff,
        interface: std::env::var("RELAY_INTERFACE").unwrap_or_else(|_| "wg0".into()),
        subnet,
        peer_ips,
        shutdown_timeout: Duration::from_secs(env_or("RELAY_SHUTDOWN_TIMEOUT_SECS", 30)),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "relay_agentd=debug,info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config_from_env()?;
    let shutdown_timeout = config.shutdown_timeout;

    let probe = Arc::new(SurgeProbe::new().context("failed to open ICMP socket (need CAP_NET_RAW)")?);
    let agent = Arc::new(Agent::new(config, probe, Arc::new(IpRouteCli))?);

    agent.clone().start();

    if let Ok(port) = std::env::var("RELAY_HEALTH_PORT") {
        let port: u16 = port.parse().context("RELAY_HEALTH_PORT is not a port")?;
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("failed to bind health port {port}"))?;
        tracing::info!(port, "health endpoint listening");
        let app = relay_agent::health::router(agent.clone());
        tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                tracing::error!(error = %err, "health server exited");
            }
        });
    }

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
    tracing::info!("shutdown signal received");

    agent.shutdown(shutdown_timeout).await;
    Ok(())
}
