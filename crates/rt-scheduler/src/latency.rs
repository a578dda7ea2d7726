//! Latency Tracking
//!
//! Written by the periodic thread only, read from anywhere.
//!
//! Percentiles come from a log-linear histogram: exact below 16ns, then 16
//! sub-buckets per power of two, so a reported percentile is within about
//! 3% of the true value. Recording is a single relaxed increment.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::Serialize;

/// Sub-buckets per power of two
const SUB_BUCKETS: u64 = 16;
const SUB_BITS: u32 = 4;
/// Covers every non-negative i64
const BUCKETS: usize = (SUB_BUCKETS + (63 - SUB_BITS as u64) * SUB_BUCKETS) as usize;

fn bucket_index(deviation_ns: i64) -> usize {
    // Early finishes share the lowest bucket
    let v = deviation_ns.max(0) as u64;
    if v < SUB_BUCKETS {
        return v as usize;
    }
    let exp = 63 - v.leading_zeros();
    let shift = exp - SUB_BITS;
    let sub = (v >> shift) & (SUB_BUCKETS - 1);
    (SUB_BUCKETS + (shift as u64) * SUB_BUCKETS + sub) as usize
}

/// Midpoint of a bucket
fn bucket_value(index: usize) -> i64 {
    let index = index as u64;
    if index < SUB_BUCKETS {
        return index as i64;
    }
    let shift = (index - SUB_BUCKETS) / SUB_BUCKETS;
    let sub = (index - SUB_BUCKETS) % SUB_BUCKETS;
    let lower = (SUB_BUCKETS + sub) << shift;
    let half_width = (1u64 << shift) / 2;
    lower.saturating_add(half_width).min(i64::MAX as u64) as i64
}

/// Running deviation statistics
#[derive(Debug)]
pub struct LatencyStats {
    count: AtomicU64,
    sum_ns: AtomicI64,
    min_ns: AtomicI64,
    max_ns: AtomicI64,
    deadline_misses: AtomicU64,
    histogram: Box<[AtomicU64]>,
}

impl Default for LatencyStats {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyStats {
    pub fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            sum_ns: AtomicI64::new(0),
            min_ns: AtomicI64::new(i64::MAX),
            max_ns: AtomicI64::new(i64::MIN),
            deadline_misses: AtomicU64::new(0),
            histogram: (0..BUCKETS).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// Record one cycle's signed deviation from its deadline
    pub fn record(&self, deviation_ns: i64) {
        self.min_ns.fetch_min(deviation_ns, Ordering::Relaxed);
        self.max_ns.fetch_max(deviation_ns, Ordering::Relaxed);
        self.sum_ns.fetch_add(deviation_ns, Ordering::Relaxed);
        self.histogram[bucket_index(deviation_ns)].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.deadline_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.count.store(0, Ordering::Relaxed);
        self.sum_ns.store(0, Ordering::Relaxed);
        self.min_ns.store(i64::MAX, Ordering::Relaxed);
        self.max_ns.store(i64::MIN, Ordering::Relaxed);
        self.deadline_misses.store(0, Ordering::Relaxed);
        for bucket in self.histogram.iter() {
            bucket.store(0, Ordering::Relaxed);
        }
    }

    /// Snapshot; all zeros when nothing was recorded
    pub fn summary(&self) -> LatencySummary {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return LatencySummary {
                deadline_misses: self.deadline_misses.load(Ordering::Relaxed),
                ..Default::default()
            };
        }

        let min_ns = self.min_ns.load(Ordering::Relaxed);
        let max_ns = self.max_ns.load(Ordering::Relaxed);
        let counts: Vec<u64> = self
            .histogram
            .iter()
            .map(|bucket| bucket.load(Ordering::Relaxed))
            .collect();
        // Not `clamp`: a racing reset can leave min above max
        let percentile = |q: f64| percentile(&counts, q).max(min_ns).min(max_ns);

        LatencySummary {
            count,
            min_ns,
            max_ns,
            avg_ns: self.sum_ns.load(Ordering::Relaxed) / count as i64,
            p50_ns: percentile(0.50),
            p95_ns: percentile(0.95),
            p99_ns: percentile(0.99),
            deadline_misses: self.deadline_misses.load(Ordering::Relaxed),
        }
    }
}

/// Value below which a fraction `q` of the recorded cycles fall
fn percentile(counts: &[u64], q: f64) -> i64 {
    let total: u64 = counts.iter().sum();
    let target = ((q * total as f64).ceil() as u64).max(1);

    let mut seen = 0;
    for (index, &n) in counts.iter().enumerate() {
        seen += n;
        if seen >= target {
            return bucket_value(index);
        }
    }
    0
}

/// Point-in-time latency figures
///
/// Deviations are signed: negative means the callback finished before its
/// deadline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LatencySummary {
    /// Cycles recorded
    pub count: u64,
    /// Earliest finish relative to the deadline
    pub min_ns: i64,
    /// Latest finish relative to the deadline
    pub max_ns: i64,
    /// Mean deviation, truncated toward zero
    pub avg_ns: i64,
    /// Median deviation; early finishes count as zero
    pub p50_ns: i64,
    /// 95th percentile deviation
    pub p95_ns: i64,
    /// 99th percentile deviation
    pub p99_ns: i64,
    /// Cycles whose deviation exceeded the configured maximum
    pub deadline_misses: u64,
}

impl LatencySummary {
    pub fn min_us(&self) -> f64 {
        self.min_ns as f64 / 1_000.0
    }

    pub fn max_us(&self) -> f64 {
        self.max_ns as f64 / 1_000.0
    }

    pub fn avg_us(&self) -> f64 {
        self.avg_ns as f64 / 1_000.0
    }

    pub fn p50_us(&self) -> f64 {
        self.p50_ns as f64 / 1_000.0
    }

    pub fn p95_us(&self) -> f64 {
        self.p95_ns as f64 / 1_000.0
    }

    pub fn p99_us(&self) -> f64 {
        self.p99_ns as f64 / 1_000.0
    }
}
