//! Periodic eviction of stale agent records from the topology store.

use crate::store::TopologyStore;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

struct CleanerTask {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct StaleCleaner {
    store: Arc<TopologyStore>,
    threshold: Duration,
    interval: Duration,
    evicted_total: AtomicU64,
    running: AtomicBool,
    control: Mutex<Option<CleanerTask>>,
}

impl StaleCleaner {
    pub fn new(store: Arc<TopologyStore>, threshold: Duration, interval: Duration) -> Self {
        Self {
            store,
            threshold,
            interval,
            evicted_total: AtomicU64::new(0),
            running: AtomicBool::new(false),
            control: Mutex::new(None),
        }
    }

    pub fn start(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(
            threshold_s = self.threshold.as_secs(),
            interval_s = self.interval.as_secs(),
            "stale cleaner started"
        );

        let (stop, mut stopped) = watch::channel(false);
        let cleaner = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cleaner.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The store starts empty; the first sweep can wait a period.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => { cleaner.clean_once().await; }
                    _ = stopped.changed() => return,
                }
            }
        });
        *self.control.lock() = Some(CleanerTask { stop, handle });
    }

    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let task = self.control.lock().take();
        if let Some(task) = task {
            let _ = task.stop.send(true);
            let _ = task.handle.await;
        }
        tracing::info!(
            total_evicted = self.evicted_total.load(Ordering::Relaxed),
            "stale cleaner stopped"
        );
    }

    /// One eviction sweep; returns how many records were removed.
    pub async fn clean_once(&self) -> usize {
        let before = self.store.agent_ids().await;
        let removed = self.store.clean_stale(self.threshold).await;
        if removed == 0 {
            return 0;
        }

        let after: HashSet<String> = self.store.agent_ids().await.into_iter().collect();
        let evicted: Vec<String> = before
            .into_iter()
            .filter(|id| !after.contains(id))
            .collect();

        tracing::info!(
            removed,
            evicted = ?evicted,
            remaining = after.len(),
            "evicted stale agents"
        );
        self.evicted_total.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Monotonic count of evicted records, for health reporting.
    pub fn evicted_total(&self) -> u64 {
        self.evicted_total.load(Ordering::Relaxed)
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }
}
