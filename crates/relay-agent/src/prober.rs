//! Link prober: periodic ICMP sampling of every peer, smoothed over a
//! fixed-size window per peer.
//!
//! Probe failures are data, not errors: a timeout becomes a measurement with
//! no RTT and full loss, and flows through the window like any other sample.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use relay_models::PeerMetric;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use surge_ping::{PingIdentifier, PingSequence};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// One probe outcome.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    /// Observed round-trip time in milliseconds; `None` on timeout or error.
    pub rtt_ms: Option<f64>,
    /// Loss fraction for this probe: 0.0 on reply, 1.0 otherwise.
    pub loss_rate: f64,
    pub taken_at: DateTime<Utc>,
}

impl Measurement {
    pub fn reply(rtt_ms: f64) -> Self {
        Self {
            rtt_ms: Some(rtt_ms),
            loss_rate: 0.0,
            taken_at: Utc::now(),
        }
    }

    pub fn lost() -> Self {
        Self {
            rtt_ms: None,
            loss_rate: 1.0,
            taken_at: Utc::now(),
        }
    }
}

/// Fixed-capacity ring of measurements; insertion overwrites the oldest.
#[derive(Debug, Clone)]
pub struct SampleWindow {
    slots: Vec<Measurement>,
    capacity: usize,
    head: usize,
}

impl SampleWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            capacity: capacity.max(1),
            head: 0,
        }
    }

    pub fn push(&mut self, m: Measurement) {
        if self.slots.len() < self.capacity {
            self.slots.push(m);
        } else {
            self.slots[self.head] = m;
        }
        self.head = (self.head + 1) % self.capacity;
    }

    /// Mean RTT over samples that have one, mean loss over all samples.
    /// An empty window yields `(None, 0.0)`; a window of timeouts yields
    /// `(None, 1.0)`.
    pub fn averages(&self) -> (Option<f64>, f64) {
        if self.slots.is_empty() {
            return (None, 0.0);
        }

        let mut rtt_sum = 0.0;
        let mut rtt_count = 0usize;
        let mut loss_sum = 0.0;
        for m in &self.slots {
            if let Some(rtt) = m.rtt_ms {
                rtt_sum += rtt;
                rtt_count += 1;
            }
            loss_sum += m.loss_rate;
        }

        let avg_rtt = (rtt_count > 0).then(|| rtt_sum / rtt_count as f64);
        (avg_rtt, loss_sum / self.slots.len() as f64)
    }

    /// Most recently inserted sample, if any.
    pub fn latest(&self) -> Option<Measurement> {
        if self.slots.is_empty() {
            return None;
        }
        Some(self.slots[(self.head + self.capacity - 1) % self.capacity])
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Single ICMP echo against one peer. Implementations never fail; probe
/// errors come back as [`Measurement::lost`].
#[async_trait]
pub trait IcmpProbe: Send + Sync {
    async fn probe(&self, target: Ipv4Addr, timeout: Duration) -> Measurement;
}

/// ICMP echo via a raw socket. Requires CAP_NET_RAW (or root), same as the
/// tunnel fabric itself.
pub struct SurgeProbe {
    client: surge_ping::Client,
}

impl SurgeProbe {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            client: surge_ping::Client::new(&surge_ping::Config::default())?,
        })
    }
}

#[async_trait]
impl IcmpProbe for SurgeProbe {
    async fn probe(&self, target: Ipv4Addr, timeout: Duration) -> Measurement {
        let payload = [0u8; 56];
        let mut pinger = self
            .client
            .pinger(IpAddr::V4(target), PingIdentifier(rand::random()))
            .await;
        pinger.timeout(timeout);
        match pinger.ping(PingSequence(0), &payload).await {
            Ok((_, rtt)) => Measurement::reply(rtt.as_secs_f64() * 1000.0),
            Err(err) => {
                tracing::debug!(peer = %target, error = %err, "icmp probe failed");
                Measurement::lost()
            }
        }
    }
}

struct ProberState {
    /// One window per peer, in peer order.
    windows: Vec<SampleWindow>,
    last_probe: Option<DateTime<Utc>>,
}

struct ProbeTask {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Periodically probes every peer and keeps the smoothed per-peer metrics
/// that the telemetry tick publishes.
pub struct Prober {
    peers: Vec<Ipv4Addr>,
    interval: Duration,
    timeout: Duration,
    probe: Arc<dyn IcmpProbe>,
    state: Mutex<ProberState>,
    sent: AtomicU64,
    received: AtomicU64,
    running: AtomicBool,
    control: Mutex<Option<ProbeTask>>,
}

impl Prober {
    pub fn new(
        peers: Vec<Ipv4Addr>,
        interval: Duration,
        timeout: Duration,
        window_size: usize,
        probe: Arc<dyn IcmpProbe>,
    ) -> Self {
        let windows = peers.iter().map(|_| SampleWindow::new(window_size)).collect();
        Self {
            peers,
            interval,
            timeout,
            probe,
            state: Mutex::new(ProberState {
                windows,
                last_probe: None,
            }),
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            running: AtomicBool::new(false),
            control: Mutex::new(None),
        }
    }

    /// Start the probe loop. The first pass runs immediately; ticks are
    /// edge-triggered, so a slow pass skips ticks instead of queueing them.
    /// Idempotent.
    pub fn start(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let (stop, mut stopped) = watch::channel(false);
        let prober = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(prober.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => prober.probe_all().await,
                    _ = stopped.changed() => break,
                }
            }
        });
        *self.control.lock() = Some(ProbeTask { stop, handle });
    }

    /// Stop the probe loop and wait for it to exit. Idempotent; safe to call
    /// when not started.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let task = self.control.lock().take();
        if let Some(task) = task {
            let _ = task.stop.send(true);
            let _ = task.handle.await;
        }
    }

    async fn probe_all(&self) {
        for (idx, peer) in self.peers.iter().enumerate() {
            let m = self.probe.probe(*peer, self.timeout).await;

            self.sent.fetch_add(1, Ordering::Relaxed);
            if m.rtt_ms.is_some() {
                self.received.fetch_add(1, Ordering::Relaxed);
            }
            match m.rtt_ms {
                Some(rtt) => {
                    tracing::debug!(peer = %peer, rtt_ms = rtt, loss = m.loss_rate, "probe reply")
                }
                None => tracing::debug!(peer = %peer, "probe timeout"),
            }

            let mut state = self.state.lock();
            state.windows[idx].push(m);
            state.last_probe = Some(m.taken_at);
        }
    }

    /// Smoothed metrics for every peer, in peer order.
    pub fn smoothed_metrics(&self) -> Vec<PeerMetric> {
        let state = self.state.lock();
        self.peers
            .iter()
            .zip(&state.windows)
            .map(|(peer, window)| {
                let (rtt_ms, loss_rate) = window.averages();
                PeerMetric {
                    target_ip: peer.to_string(),
                    rtt_ms,
                    loss_rate,
                }
            })
            .collect()
    }

    /// Latest unsmoothed sample per peer; peers never probed are skipped.
    pub fn raw_metrics(&self) -> Vec<PeerMetric> {
        let state = self.state.lock();
        self.peers
            .iter()
            .zip(&state.windows)
            .filter_map(|(peer, window)| {
                window.latest().map(|m| PeerMetric {
                    target_ip: peer.to_string(),
                    rtt_ms: m.rtt_ms,
                    loss_rate: m.loss_rate,
                })
            })
            .collect()
    }

    /// Fraction of probes answered since startup; 1.0 before any were sent.
    pub fn success_rate(&self) -> f64 {
        let sent = self.sent.load(Ordering::Relaxed);
        if sent == 0 {
            return 1.0;
        }
        self.received.load(Ordering::Relaxed) as f64 / sent as f64
    }

    pub fn last_probe_time(&self) -> Option<DateTime<Utc>> {
        self.state.lock().last_probe
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
