//! Route executor: reconciles kernel host routes on the tunnel interface
//! with directives from the controller.
//!
//! The kernel is only ever touched through [`RouteOps`]; every parameter that
//! reaches a command line is a parsed, subnet-checked [`Ipv4Addr`]. A
//! destination or next hop outside the tunnel subnet fails that directive and
//! nothing else.

use async_trait::async_trait;
use relay_models::{RouteDirective, TunnelSubnet};
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("destination {0:?} is not an IPv4 host route")]
    BadDestination(String),
    #[error("next_hop {0:?} is not an IPv4 address")]
    BadNextHop(String),
    #[error("{ip} is outside tunnel subnet {subnet}")]
    OutsideSubnet { ip: Ipv4Addr, subnet: TunnelSubnet },
    #[error("`{command}` failed: {output}")]
    CommandFailed { command: String, output: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One host route as seen in the kernel table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelRoute {
    pub destination: Ipv4Addr,
    /// `None` for a direct (on-link) route.
    pub next_hop: Option<Ipv4Addr>,
}

/// The host's route-table primitive. The real implementation shells out to
/// iproute2; tests substitute an in-memory table.
#[async_trait]
pub trait RouteOps: Send + Sync {
    /// Host routes currently present on `device`.
    async fn list(&self, device: &str) -> Result<Vec<KernelRoute>, ExecutorError>;
    /// Idempotent add-or-replace of `dst/32 via next_hop dev device`.
    async fn replace(
        &self,
        dst: Ipv4Addr,
        via: Ipv4Addr,
        device: &str,
    ) -> Result<(), ExecutorError>;
    /// Delete `dst/32 dev device`; an absent route is success.
    async fn delete(&self, dst: Ipv4Addr, device: &str) -> Result<(), ExecutorError>;
}

/// `ip route` backend.
pub struct IpRouteCli;

impl IpRouteCli {
    async fn run(args: Vec<String>) -> Result<std::process::Output, ExecutorError> {
        let output = Command::new("ip").args(&args).output().await?;
        if output.status.success() {
            return Ok(output);
        }
        Err(ExecutorError::CommandFailed {
            command: format!("ip {}", args.join(" ")),
            output: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

#[async_trait]
impl RouteOps for IpRouteCli {
    async fn list(&self, device: &str) -> Result<Vec<KernelRoute>, ExecutorError> {
        let out = Self::run(
            ["route", "show", "table", "main"]
                .map(String::from)
                .to_vec(),
        )
        .await?;
        Ok(parse_route_table(
            &String::from_utf8_lossy(&out.stdout),
            device,
        ))
    }

    async fn replace(
        &self,
        dst: Ipv4Addr,
        via: Ipv4Addr,
        device: &str,
    ) -> Result<(), ExecutorError> {
        Self::run(vec![
            "route".into(),
            "replace".into(),
            format!("{dst}/32"),
            "via".into(),
            via.to_string(),
            "dev".into(),
            device.to_string(),
        ])
        .await
        .map(drop)
    }

    async fn delete(&self, dst: Ipv4Addr, device: &str) -> Result<(), ExecutorError> {
        let result = Self::run(vec![
            "route".into(),
            "del".into(),
            format!("{dst}/32"),
            "dev".into(),
            device.to_string(),
        ])
        .await;
        match result {
            Ok(_) => Ok(()),
            // iproute2 reports a missing route as ESRCH.
            Err(ExecutorError::CommandFailed { ref output, .. })
                if output.contains("No such process") =>
            {
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

/// Parse `ip route show table main` output, keeping host routes on `device`.
fn parse_route_table(text: &str, device: &str) -> Vec<KernelRoute> {
    let mut routes = Vec::new();
    for line in text.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.is_empty() {
            continue;
        }

        let on_device = fields
            .windows(2)
            .any(|w| w[0] == "dev" && w[1] == device);
        if !on_device {
            continue;
        }

        let dst_field = fields[0];
        let raw = match dst_field.split_once('/') {
            Some((ip, "32")) => ip,
            Some(_) => continue, // prefix routes stay untouched
            None => dst_field,
        };
        let Ok(destination) = raw.parse::<Ipv4Addr>() else {
            continue;
        };

        let next_hop = fields
            .windows(2)
            .find(|w| w[0] == "via")
            .and_then(|w| w[1].parse::<Ipv4Addr>().ok());

        routes.push(KernelRoute {
            destination,
            next_hop,
        });
    }
    routes
}

/// Applies route directives to the kernel and remembers what it installed so
/// shutdown and fallback can withdraw exactly that.
pub struct Executor {
    device: String,
    subnet: TunnelSubnet,
    ops: Arc<dyn RouteOps>,
    /// Destinations this executor currently overrides. The lock also
    /// serializes every kernel mutation.
    managed: Mutex<HashSet<Ipv4Addr>>,
}

impl Executor {
    pub fn new(device: impl Into<String>, subnet: TunnelSubnet, ops: Arc<dyn RouteOps>) -> Self {
        Self {
            device: device.into(),
            subnet,
            ops,
            managed: Mutex::new(HashSet::new()),
        }
    }

    fn ensure_in_subnet(&self, ip: Ipv4Addr) -> Result<(), ExecutorError> {
        if !self.subnet.contains(ip) {
            return Err(ExecutorError::OutsideSubnet {
                ip,
                subnet: self.subnet,
            });
        }
        Ok(())
    }

    fn host_from_cidr(&self, dst_cidr: &str) -> Result<Ipv4Addr, ExecutorError> {
        let raw = dst_cidr.strip_suffix("/32").unwrap_or(dst_cidr);
        let ip: Ipv4Addr = raw
            .parse()
            .map_err(|_| ExecutorError::BadDestination(dst_cidr.to_string()))?;
        self.ensure_in_subnet(ip)?;
        Ok(ip)
    }

    /// Apply a directive batch, best effort. A failing directive is logged
    /// and skipped; the rest of the batch still runs. A destination with no
    /// directive is left untouched: moving a relayed peer back to direct
    /// routing takes an explicit `"direct"` directive (or a fallback flush).
    pub async fn sync_routes(&self, directives: &[RouteDirective]) {
        let mut managed = self.managed.lock().await;
        for directive in directives {
            if let Err(err) = self.apply_directive(directive, &mut managed).await {
                tracing::warn!(
                    dst = %directive.dst_cidr,
                    error = %err,
                    "failed to apply route directive"
                );
            }
        }
    }

    async fn apply_directive(
        &self,
        directive: &RouteDirective,
        managed: &mut HashSet<Ipv4Addr>,
    ) -> Result<(), ExecutorError> {
        let dst = self.host_from_cidr(&directive.dst_cidr)?;

        if directive.is_direct() {
            self.ops.delete(dst, &self.device).await?;
            managed.remove(&dst);
            tracing::info!(dst = %dst, "withdrew relay route");
        } else {
            let via: Ipv4Addr = directive
                .next_hop
                .parse()
                .map_err(|_| ExecutorError::BadNextHop(directive.next_hop.clone()))?;
            self.ensure_in_subnet(via)?;
            self.ops.replace(dst, via, &self.device).await?;
            managed.insert(dst);
            tracing::info!(dst = %dst, via = %via, "installed relay route");
        }
        Ok(())
    }

    /// Withdraw every route on the tunnel interface that relays through an
    /// in-subnet next hop, regardless of who installed it. The managed set is
    /// emptied even when individual deletes fail: entering fallback means
    /// this agent no longer owns any overrides.
    pub async fn flush_routes(&self) -> Result<usize, ExecutorError> {
        let mut managed = self.managed.lock().await;
        let routes = self.ops.list(&self.device).await?;

        let mut removed = 0;
        for route in routes {
            let Some(via) = route.next_hop else { continue };
            if !self.subnet.contains(route.destination) || !self.subnet.contains(via) {
                continue;
            }
            match self.ops.delete(route.destination, &self.device).await {
                Ok(()) => {
                    removed += 1;
                    tracing::info!(dst = %route.destination, "flushed relay route");
                }
                Err(err) => {
                    tracing::warn!(dst = %route.destination, error = %err, "failed to flush route")
                }
            }
        }
        managed.clear();
        Ok(removed)
    }

    /// Withdraw exactly the routes this executor installed. Idempotent;
    /// failed withdrawals stay in the managed set and are reported.
    pub async fn cleanup_managed_routes(&self) -> (usize, Vec<ExecutorError>) {
        let mut managed = self.managed.lock().await;
        let targets: Vec<Ipv4Addr> = managed.iter().copied().collect();

        let mut cleaned = 0;
        let mut errors = Vec::new();
        for dst in targets {
            match self.ops.delete(dst, &self.device).await {
                Ok(()) => {
                    managed.remove(&dst);
                    cleaned += 1;
                }
                Err(err) => errors.push(err),
            }
        }
        (cleaned, errors)
    }

    /// Kernel host routes on the tunnel interface, filtered to the subnet.
    pub async fn current_routes(&self) -> Result<Vec<KernelRoute>, ExecutorError> {
        let routes = self.ops.list(&self.device).await?;
        Ok(routes
            .into_iter()
            .filter(|r| self.subnet.contains(r.destination))
            .collect())
    }

    pub async fn managed_count(&self) -> usize {
        self.managed.lock().await.len()
    }
}

/// Minimal change set turning `current` into `desired`: relay overrides to
/// install or repoint, and stale overrides to withdraw. Directives that do
/// not parse are ignored (the executor would reject them anyway).
pub fn calculate_diff(
    current: &[KernelRoute],
    desired: &[RouteDirective],
) -> (Vec<RouteDirective>, Vec<RouteDirective>) {
    let current_map: HashMap<Ipv4Addr, Option<Ipv4Addr>> = current
        .iter()
        .map(|r| (r.destination, r.next_hop))
        .collect();

    let mut desired_map: HashMap<Ipv4Addr, Ipv4Addr> = HashMap::new();
    for directive in desired {
        if directive.is_direct() {
            continue;
        }
        let raw = directive
            .dst_cidr
            .strip_suffix("/32")
            .unwrap_or(&directive.dst_cidr);
        let (Ok(dst), Ok(via)) = (raw.parse::<Ipv4Addr>(), directive.next_hop.parse::<Ipv4Addr>())
        else {
            continue;
        };
        desired_map.insert(dst, via);
    }

    let mut to_add: Vec<RouteDirective> = desired_map
        .iter()
        .filter(|(dst, via)| current_map.get(*dst) != Some(&Some(**via)))
        .map(|(dst, via)| RouteDirective::relay(dst, via.to_string()))
        .collect();

    let mut to_remove: Vec<RouteDirective> = current_map
        .iter()
        .filter(|(dst, via)| via.is_some() && !desired_map.contains_key(*dst))
        .map(|(dst, _)| RouteDirective::direct(dst))
        .collect();

    to_add.sort_by(|a, b| a.dst_cidr.cmp(&b.dst_cidr));
    to_remove.sort_by(|a, b| a.dst_cidr.cmp(&b.dst_cidr));
    (to_add, to_remove)
}
