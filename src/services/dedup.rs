//! Per-location duplicate suppression
//!
//! Keeps only the most recently accepted EPC per location. A sighting is
//! suppressed only when it repeats that EPC inside the window; any other EPC
//! accepted at the location in between overwrites the entry, so a later read
//! of the first EPC is accepted again.
//!
//! The table is guarded by a single mutex. `check_and_record` decides and
//! overwrites under one lock acquisition, which serializes concurrent
//! transports that share a location.

use crate::infra::metrics::Metrics;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, info};

/// Most recent acceptance at one location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupEntry {
    pub epc: String,
    pub accepted_at: Instant,
    /// Window in force when accepted (used for eviction)
    pub window: Duration,
}

impl DedupEntry {
    #[inline]
    fn suppresses(&self, epc: &str, window: Duration, now: Instant) -> bool {
        self.epc == epc && now.saturating_duration_since(self.accepted_at) < window
    }
}

/// Location-keyed dedup table
#[derive(Default)]
pub struct DedupCache {
    entries: Mutex<FxHashMap<String, DedupEntry>>,
}

impl DedupCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a sighting of `epc` at `location` would be accepted at `now`
    pub fn should_accept_at(
        &self,
        epc: &str,
        location: &str,
        window: Duration,
        now: Instant,
    ) -> bool {
        let entries = self.entries.lock();
        !entries.get(location).is_some_and(|e| e.suppresses(epc, window, now))
    }

    /// Overwrite the location's entry with `epc` accepted at `now`
    pub fn record_at(&self, epc: &str, location: &str, window: Duration, now: Instant) {
        let mut entries = self.entries.lock();
        Self::overwrite(&mut entries, epc, location, window, now);
    }

    /// Check and, if accepted, record in one critical section
    pub fn check_and_record_at(
        &self,
        epc: &str,
        location: &str,
        window: Duration,
        now: Instant,
    ) -> bool {
        let mut entries = self.entries.lock();
        if entries.get(location).is_some_and(|e| e.suppresses(epc, window, now)) {
            return false;
        }
        Self::overwrite(&mut entries, epc, location, window, now);
        true
    }

    pub fn should_accept(&self, epc: &str, location: &str, window: Duration) -> bool {
        self.should_accept_at(epc, location, window, Instant::now())
    }

    pub fn record(&self, epc: &str, location: &str, window: Duration) {
        self.record_at(epc, location, window, Instant::now())
    }

    pub fn check_and_record(&self, epc: &str, location: &str, window: Duration) -> bool {
        self.check_and_record_at(epc, location, window, Instant::now())
    }

    fn overwrite(
        entries: &mut FxHashMap<String, DedupEntry>,
        epc: &str,
        location: &str,
        window: Duration,
        now: Instant,
    ) {
        match entries.get_mut(location) {
            Some(entry) => {
                entry.epc.clear();
                entry.epc.push_str(epc);
                entry.accepted_at = now;
                entry.window = window;
            }
            None => {
                entries.insert(
                    location.to_string(),
                    DedupEntry { epc: epc.to_string(), accepted_at: now, window },
                );
            }
        }
    }

    /// Drop entries at least `factor` x their window old; returns how many
    ///
    /// With `factor >= 1` an evicted entry could no longer suppress anything,
    /// so eviction never changes an accept/suppress decision.
    pub fn evict_expired(&self, now: Instant, factor: u32) -> usize {
        let factor = factor.max(1);
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| {
            now.saturating_duration_since(e.accepted_at) < e.window.saturating_mul(factor)
        });
        before - entries.len()
    }

    /// Snapshot of a location's entry
    pub fn entry(&self, location: &str) -> Option<DedupEntry> {
        self.entries.lock().get(location).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Periodically evict stale entries until shutdown
pub async fn run_eviction(
    cache: Arc<DedupCache>,
    every: Duration,
    factor: u32,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval_secs = %every.as_secs(), factor = %factor, "dedup_sweeper_started");
    let mut ticker = interval(every.max(Duration::from_millis(1)));
    // First tick fires immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("dedup_sweeper_shutdown");
                    return;
                }
            }
            _ = ticker.tick() => {
                let evicted = cache.evict_expired(Instant::now(), factor);
                let remaining = cache.len();
                metrics.record_dedup_sweep(evicted as u64, remaining as u64);
                debug!(evicted = %evicted, remaining = %remaining, "dedup_sweep");
            }
        }
    }
}
