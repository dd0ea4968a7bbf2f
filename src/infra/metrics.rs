//! Lock-free metrics collection and periodic reporting
//!
//! Counter updates happen on the edge-callback and finalizer paths, so every
//! recording operation is a relaxed atomic. `report()` is the only operation
//! that resets anything.
//!
//! NOTE: All atomics use Relaxed ordering. These are statistical
//! counters only; money totals live in the channel ledgers, never here.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Finalization latency bucket boundaries (milliseconds, last pulse → credit)
/// Buckets: ≤10, ≤20, ≤40, ≤80, ≤160, ≤320, ≤640, ≤1280, ≤2560, ≤5120, >5120
const BUCKET_BOUNDS: [u64; 10] = [10, 20, 40, 80, 160, 320, 640, 1280, 2560, 5120];
const NUM_BUCKETS: usize = 11;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_ms: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_ms)
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

/// Swap all buckets to zero and return their values
#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    // Upper bounds for each bucket (last bucket uses 2x the previous bound)
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [10, 20, 40, 80, 160, 320, 640, 1280, 2560, 5120, 10240];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Money in hundredths, for atomic accumulation
fn to_cents(amount: Decimal) -> u64 {
    (amount * Decimal::ONE_HUNDRED).round().to_u64().unwrap_or(0)
}

/// Lock-free metrics collector
pub struct Metrics {
    /// Debounced pulses accepted into a channel queue (monotonic)
    pulses_total: AtomicU64,
    /// Pulses lost because a channel queue was full (monotonic)
    pulses_dropped: AtomicU64,
    /// Bursts or edges that resolved to a denomination (monotonic)
    credits_total: AtomicU64,
    /// Credited money in hundredths (monotonic)
    credited_cents: AtomicU64,
    /// Bursts whose pulse count had no table entry (monotonic)
    noise_bursts: AtomicU64,
    /// Credits that resolved outside a session (monotonic)
    unattributed_total: AtomicU64,
    /// Sessions started (monotonic)
    sessions_started: AtomicU64,
    /// Dispense calls that paid the full amount (monotonic)
    dispense_ok: AtomicU64,
    /// Dispense calls that ended short (monotonic)
    dispense_failed: AtomicU64,
    /// Coins confirmed by hopper sensors (monotonic)
    coins_dispensed: AtomicU64,
    /// Credits since last report (reset on report)
    credits_since_report: AtomicU64,
    /// Finalization latency histogram (reset on report)
    finalize_buckets: [AtomicU64; NUM_BUCKETS],
    /// Sum of finalization latencies in ms (reset on report)
    finalize_sum_ms: AtomicU64,
    /// Max finalization latency in ms (reset on report)
    finalize_max_ms: AtomicU64,
    /// Last report time (only accessed from reporter)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            pulses_total: AtomicU64::new(0),
            pulses_dropped: AtomicU64::new(0),
            credits_total: AtomicU64::new(0),
            credited_cents: AtomicU64::new(0),
            noise_bursts: AtomicU64::new(0),
            unattributed_total: AtomicU64::new(0),
            sessions_started: AtomicU64::new(0),
            dispense_ok: AtomicU64::new(0),
            dispense_failed: AtomicU64::new(0),
            coins_dispensed: AtomicU64::new(0),
            credits_since_report: AtomicU64::new(0),
            finalize_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            finalize_sum_ms: AtomicU64::new(0),
            finalize_max_ms: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_pulse(&self) {
        self.pulses_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_pulse_dropped(&self) {
        self.pulses_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a resolved denomination and how long after its last pulse it
    /// became visible
    #[inline]
    pub fn record_credit(&self, amount: Decimal, finalize_ms: u64) {
        self.credits_total.fetch_add(1, Ordering::Relaxed);
        self.credits_since_report.fetch_add(1, Ordering::Relaxed);
        self.credited_cents.fetch_add(to_cents(amount), Ordering::Relaxed);

        let bucket = bucket_index(finalize_ms);
        self.finalize_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.finalize_sum_ms.fetch_add(finalize_ms, Ordering::Relaxed);
        update_atomic_max(&self.finalize_max_ms, finalize_ms);
    }

    #[inline]
    pub fn record_noise_burst(&self) {
        self.noise_bursts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_unattributed(&self) {
        self.unattributed_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_session_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_dispense(&self, success: bool) {
        if success {
            self.dispense_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.dispense_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_coins_dispensed(&self, coins: u64) {
        self.coins_dispensed.fetch_add(coins, Ordering::Relaxed);
    }

    pub fn pulses_total(&self) -> u64 {
        self.pulses_total.load(Ordering::Relaxed)
    }

    pub fn pulses_dropped(&self) -> u64 {
        self.pulses_dropped.load(Ordering::Relaxed)
    }

    pub fn credits_total(&self) -> u64 {
        self.credits_total.load(Ordering::Relaxed)
    }

    pub fn noise_bursts(&self) -> u64 {
        self.noise_bursts.load(Ordering::Relaxed)
    }

    pub fn unattributed_total(&self) -> u64 {
        self.unattributed_total.load(Ordering::Relaxed)
    }

    pub fn coins_dispensed(&self) -> u64 {
        self.coins_dispensed.load(Ordering::Relaxed)
    }

    /// Generate a metrics summary and reset periodic counters
    pub fn report(&self) -> MetricsSummary {
        let credits_count = self.credits_since_report.swap(0, Ordering::Relaxed);
        let finalize_sum = self.finalize_sum_ms.swap(0, Ordering::Relaxed);
        let finalize_max = self.finalize_max_ms.swap(0, Ordering::Relaxed);
        let finalize_buckets = swap_buckets(&self.finalize_buckets);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let credits_per_min = if elapsed.as_secs_f64() > 0.0 {
            credits_count as f64 * 60.0 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        let finalize_avg_ms = if credits_count > 0 { finalize_sum / credits_count } else { 0 };

        MetricsSummary {
            pulses_total: self.pulses_total(),
            pulses_dropped: self.pulses_dropped(),
            credits_total: self.credits_total(),
            credited: Decimal::new(self.credited_cents.load(Ordering::Relaxed) as i64, 2),
            noise_bursts: self.noise_bursts(),
            unattributed_total: self.unattributed_total(),
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            dispense_ok: self.dispense_ok.load(Ordering::Relaxed),
            dispense_failed: self.dispense_failed.load(Ordering::Relaxed),
            coins_dispensed: self.coins_dispensed(),
            credits_per_min,
            finalize_buckets,
            finalize_avg_ms,
            finalize_max_ms: finalize_max,
            finalize_p99_ms: percentile_from_buckets(&finalize_buckets, 0.99),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct MetricsSummary {
    pub pulses_total: u64,
    pub pulses_dropped: u64,
    pub credits_total: u64,
    pub credited: Decimal,
    pub noise_bursts: u64,
    pub unattributed_total: u64,
    pub sessions_started: u64,
    pub dispense_ok: u64,
    pub dispense_failed: u64,
    pub coins_dispensed: u64,
    pub credits_per_min: f64,
    /// Finalization latency histogram
    /// Bounds: ≤10, ≤20, ≤40, ≤80, ≤160, ≤320, ≤640, ≤1280, ≤2560, ≤5120, >5120 ms
    pub finalize_buckets: [u64; NUM_BUCKETS],
    pub finalize_avg_ms: u64,
    pub finalize_max_ms: u64,
    pub finalize_p99_ms: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            pulses_total = %self.pulses_total,
            pulses_dropped = %self.pulses_dropped,
            credits_total = %self.credits_total,
            credited = %self.credited,
            noise_bursts = %self.noise_bursts,
            unattributed = %self.unattributed_total,
            sessions = %self.sessions_started,
            dispense_ok = %self.dispense_ok,
            dispense_failed = %self.dispense_failed,
            coins_dispensed = %self.coins_dispensed,
            credits_per_min = format!("{:.1}", self.credits_per_min),
            finalize_avg_ms = %self.finalize_avg_ms,
            finalize_p99_ms = %self.finalize_p99_ms,
            "metrics"
        );
    }
}
