//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! All counter updates are lock-free; reporting is the only operation
//! that needs synchronization (via atomic swap).
//!
//! NOTE: All atomics use Relaxed ordering intentionally—these are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Frame processing latency bucket boundaries (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const NUM_BUCKETS: usize = 11;

/// Reconciliation latency bucket boundaries (milliseconds)
/// Buckets: ≤5, ≤10, ≤20, ≤40, ≤80, ≤160, ≤320, ≤640, ≤1280, ≤2560, >2560 ms
const RECONCILE_BOUNDS: [u64; 10] = [5, 10, 20, 40, 80, 160, 320, 640, 1280, 2560];

/// Compute bucket index for a value against the given bounds using binary search
#[inline]
fn bucket_index(bounds: &[u64; 10], value: u64) -> usize {
    bounds.partition_point(|&bound| bound < value)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Read a periodic counter, swapping it to zero when `reset`
#[inline]
fn take(counter: &AtomicU64, reset: bool) -> u64 {
    if reset {
        counter.swap(0, Ordering::Relaxed)
    } else {
        counter.load(Ordering::Relaxed)
    }
}

/// Read all buckets, swapping them to zero when `reset`
#[inline]
fn take_buckets(buckets: &[AtomicU64; NUM_BUCKETS], reset: bool) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = take(bucket, reset);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(
    buckets: &[u64; NUM_BUCKETS],
    bounds: &[u64; 10],
    percentile: f64,
) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = ((total as f64 * percentile).ceil() as u64).max(1);
    let mut cumulative = 0u64;

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            // Overflow bucket reports 2x the last bound
            return bounds.get(i).copied().unwrap_or(bounds[9] * 2);
        }
    }
    bounds[9] * 2
}

/// Lock-free metrics collector
///
/// All recording operations are lock-free using atomics.
/// The `report()` method atomically swaps periodic counters to get a consistent snapshot.
pub struct Metrics {
    /// Total frames read from any transport (monotonic)
    frames_total: AtomicU64,
    /// Frames since last report (reset on report)
    frames_since_report: AtomicU64,
    /// Sum of frame latencies in microseconds (reset on report)
    frame_latency_sum_us: AtomicU64,
    /// Max frame latency in microseconds (reset on report)
    frame_latency_max_us: AtomicU64,
    /// Frame processing latency histogram buckets (reset on report)
    frame_latency_buckets: [AtomicU64; NUM_BUCKETS],
    /// Frames that failed to decode (monotonic)
    frames_malformed: AtomicU64,
    /// Frames from readers missing in config (monotonic)
    frames_unknown_reader: AtomicU64,
    /// Frames whose EPC failed validation (monotonic)
    frames_invalid_epc: AtomicU64,
    /// Frames suppressed by the dedup window (monotonic)
    frames_duplicate: AtomicU64,
    /// Accepted sightings with no product mapping (monotonic)
    frames_unmapped: AtomicU64,
    /// Sightings that passed dedup (monotonic)
    sightings_accepted: AtomicU64,
    /// Tag records created (monotonic)
    tags_created: AtomicU64,
    /// Tag records refreshed (monotonic)
    tags_updated: AtomicU64,
    /// EPC/product conflicts (monotonic)
    conflicts: AtomicU64,
    /// Product or location names missing in the store (monotonic)
    lookup_failures: AtomicU64,
    /// Reconciliations failed by store errors (monotonic)
    store_errors: AtomicU64,
    /// Store calls retried after a transient failure (monotonic)
    store_retries: AtomicU64,
    /// Compensating tag deletions performed (monotonic)
    compensations: AtomicU64,
    /// Tag created but inventory not adjusted and not compensated (monotonic)
    partial_applications: AtomicU64,
    /// Reconciliations since last report (reset on report)
    reconciles_since_report: AtomicU64,
    /// Sum of reconcile latencies in milliseconds (reset on report)
    reconcile_latency_sum_ms: AtomicU64,
    /// Max reconcile latency in milliseconds (reset on report)
    reconcile_latency_max_ms: AtomicU64,
    /// Reconcile latency histogram buckets (reset on report)
    reconcile_latency_buckets: [AtomicU64; NUM_BUCKETS],
    /// Dedup entries evicted by the sweep (monotonic)
    dedup_evicted: AtomicU64,
    /// Current dedup table size (updated by sweep)
    dedup_entries: AtomicU64,
    /// Last report time (only accessed from reporter)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            frames_total: AtomicU64::new(0),
            frames_since_report: AtomicU64::new(0),
            frame_latency_sum_us: AtomicU64::new(0),
            frame_latency_max_us: AtomicU64::new(0),
            frame_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            frames_malformed: AtomicU64::new(0),
            frames_unknown_reader: AtomicU64::new(0),
            frames_invalid_epc: AtomicU64::new(0),
            frames_duplicate: AtomicU64::new(0),
            frames_unmapped: AtomicU64::new(0),
            sightings_accepted: AtomicU64::new(0),
            tags_created: AtomicU64::new(0),
            tags_updated: AtomicU64::new(0),
            conflicts: AtomicU64::new(0),
            lookup_failures: AtomicU64::new(0),
            store_errors: AtomicU64::new(0),
            store_retries: AtomicU64::new(0),
            compensations: AtomicU64::new(0),
            partial_applications: AtomicU64::new(0),
            reconciles_since_report: AtomicU64::new(0),
            reconcile_latency_sum_ms: AtomicU64::new(0),
            reconcile_latency_max_ms: AtomicU64::new(0),
            reconcile_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            dedup_evicted: AtomicU64::new(0),
            dedup_entries: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Record a frame was processed end to end with given latency (lock-free)
    #[inline]
    pub fn record_frame_processed(&self, latency_us: u64) {
        self.frames_total.fetch_add(1, Ordering::Relaxed);
        self.frames_since_report.fetch_add(1, Ordering::Relaxed);
        self.frame_latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);

        let bucket = bucket_index(&BUCKET_BOUNDS, latency_us);
        self.frame_latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);

        update_atomic_max(&self.frame_latency_max_us, latency_us);
    }

    #[inline]
    pub fn record_malformed(&self) {
        self.frames_malformed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_unknown_reader(&self) {
        self.frames_unknown_reader.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_invalid_epc(&self) {
        self.frames_invalid_epc.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_duplicate(&self) {
        self.frames_duplicate.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_unmapped(&self) {
        self.frames_unmapped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_accepted(&self) {
        self.sightings_accepted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_tag_created(&self) {
        self.tags_created.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_tag_updated(&self) {
        self.tags_updated.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_lookup_failure(&self) {
        self.lookup_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_store_error(&self) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_store_retry(&self) {
        self.store_retries.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_compensation(&self) {
        self.compensations.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_partial_application(&self) {
        self.partial_applications.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one reconciliation round trip (lock-free)
    #[inline]
    pub fn record_reconcile_latency(&self, latency_ms: u64) {
        self.reconciles_since_report.fetch_add(1, Ordering::Relaxed);
        self.reconcile_latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);

        let bucket = bucket_index(&RECONCILE_BOUNDS, latency_ms);
        self.reconcile_latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);

        update_atomic_max(&self.reconcile_latency_max_ms, latency_ms);
    }

    /// Record the result of a dedup eviction sweep
    #[inline]
    pub fn record_dedup_sweep(&self, evicted: u64, remaining: u64) {
        self.dedup_evicted.fetch_add(evicted, Ordering::Relaxed);
        self.dedup_entries.store(remaining, Ordering::Relaxed);
    }

    #[inline]
    pub fn frames_total(&self) -> u64 {
        self.frames_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn frames_duplicate(&self) -> u64 {
        self.frames_duplicate.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn tags_created(&self) -> u64 {
        self.tags_created.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn conflicts(&self) -> u64 {
        self.conflicts.load(Ordering::Relaxed)
    }

    /// Calculate and return metrics summary, then reset periodic counters
    ///
    /// This is the only method that resets counters. It uses atomic swap
    /// to get a consistent snapshot while allowing concurrent updates.
    pub fn report(&self) -> MetricsSummary {
        self.summarize(true)
    }

    /// Summary without resetting periodic counters (Prometheus scrapes)
    pub fn snapshot(&self) -> MetricsSummary {
        self.summarize(false)
    }

    fn summarize(&self, reset: bool) -> MetricsSummary {
        // Swap periodic counters to zero (or just read them) and get their values
        let frames_count = take(&self.frames_since_report, reset);
        let latency_sum = take(&self.frame_latency_sum_us, reset);
        let max_latency = take(&self.frame_latency_max_us, reset);
        let frame_lat_buckets = take_buckets(&self.frame_latency_buckets, reset);

        let reconcile_count = take(&self.reconciles_since_report, reset);
        let reconcile_sum = take(&self.reconcile_latency_sum_ms, reset);
        let reconcile_max = take(&self.reconcile_latency_max_ms, reset);
        let reconcile_lat_buckets = take_buckets(&self.reconcile_latency_buckets, reset);

        // Calculate elapsed time and reset
        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            if reset {
                *last = Instant::now();
            }
            elapsed
        };

        let frames_per_sec = if elapsed.as_secs_f64() > 0.0 {
            frames_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        let avg_latency = if frames_count > 0 { latency_sum / frames_count } else { 0 };
        let reconcile_avg = if reconcile_count > 0 { reconcile_sum / reconcile_count } else { 0 };

        MetricsSummary {
            frames_total: self.frames_total.load(Ordering::Relaxed),
            frames_per_sec,
            avg_frame_latency_us: avg_latency,
            max_frame_latency_us: max_latency,
            frame_lat_p50_us: percentile_from_buckets(&frame_lat_buckets, &BUCKET_BOUNDS, 0.50),
            frame_lat_p99_us: percentile_from_buckets(&frame_lat_buckets, &BUCKET_BOUNDS, 0.99),
            frame_lat_buckets,
            frames_malformed: self.frames_malformed.load(Ordering::Relaxed),
            frames_unknown_reader: self.frames_unknown_reader.load(Ordering::Relaxed),
            frames_invalid_epc: self.frames_invalid_epc.load(Ordering::Relaxed),
            frames_duplicate: self.frames_duplicate.load(Ordering::Relaxed),
            frames_unmapped: self.frames_unmapped.load(Ordering::Relaxed),
            sightings_accepted: self.sightings_accepted.load(Ordering::Relaxed),
            tags_created: self.tags_created.load(Ordering::Relaxed),
            tags_updated: self.tags_updated.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            lookup_failures: self.lookup_failures.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
            store_retries: self.store_retries.load(Ordering::Relaxed),
            compensations: self.compensations.load(Ordering::Relaxed),
            partial_applications: self.partial_applications.load(Ordering::Relaxed),
            reconcile_avg_ms: reconcile_avg,
            reconcile_max_ms: reconcile_max,
            reconcile_p99_ms: percentile_from_buckets(
                &reconcile_lat_buckets,
                &RECONCILE_BOUNDS,
                0.99,
            ),
            reconcile_lat_buckets,
            dedup_evicted: self.dedup_evicted.load(Ordering::Relaxed),
            dedup_entries: self.dedup_entries.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of histogram buckets (exported for Prometheus formatting)
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Exported bucket bounds for Prometheus formatting
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;
pub const METRICS_RECONCILE_BOUNDS: [u64; 10] = RECONCILE_BOUNDS;

#[derive(Debug)]
pub struct MetricsSummary {
    pub frames_total: u64,
    pub frames_per_sec: f64,
    pub avg_frame_latency_us: u64,
    pub max_frame_latency_us: u64,
    /// Frame processing latency histogram buckets
    /// Bounds: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200 µs
    pub frame_lat_buckets: [u64; NUM_BUCKETS],
    pub frame_lat_p50_us: u64,
    pub frame_lat_p99_us: u64,
    pub frames_malformed: u64,
    pub frames_unknown_reader: u64,
    pub frames_invalid_epc: u64,
    pub frames_duplicate: u64,
    pub frames_unmapped: u64,
    pub sightings_accepted: u64,
    pub tags_created: u64,
    pub tags_updated: u64,
    pub conflicts: u64,
    pub lookup_failures: u64,
    pub store_errors: u64,
    pub store_retries: u64,
    pub compensations: u64,
    pub partial_applications: u64,
    /// Reconcile latency histogram buckets
    /// Bounds: ≤5, ≤10, ≤20, ≤40, ≤80, ≤160, ≤320, ≤640, ≤1280, ≤2560, >2560 ms
    pub reconcile_lat_buckets: [u64; NUM_BUCKETS],
    pub reconcile_avg_ms: u64,
    pub reconcile_max_ms: u64,
    pub reconcile_p99_ms: u64,
    pub dedup_evicted: u64,
    pub dedup_entries: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            frames_total = %self.frames_total,
            frames_per_sec = format!("{:.1}", self.frames_per_sec),
            avg_latency_us = %self.avg_frame_latency_us,
            p99_us = %self.frame_lat_p99_us,
            malformed = %self.frames_malformed,
            unknown_reader = %self.frames_unknown_reader,
            invalid_epc = %self.frames_invalid_epc,
            duplicate = %self.frames_duplicate,
            accepted = %self.sightings_accepted,
            created = %self.tags_created,
            updated = %self.tags_updated,
            conflicts = %self.conflicts,
            store_errors = %self.store_errors,
            reconcile_p99_ms = %self.reconcile_p99_ms,
            dedup_entries = %self.dedup_entries,
            "metrics"
        );
    }
}
