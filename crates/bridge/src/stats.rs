//! Periodic Statistics
//!
//! Every interval the reporter logs a summary, mirrors it into `metrics`
//! and publishes it as JSON on `{prefix}/stats`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use rt_scheduler::{LatencyStats, LatencySummary};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::MetricsConfig;
use crate::pipeline::{BridgeCounters, CounterSnapshot};
use crate::publisher::Publisher;
use crate::BridgeError;

/// JSON document published on the stats topic
#[derive(Debug, Clone, Serialize)]
pub struct StatsMessage {
    pub timestamp: DateTime<Utc>,
    pub device: String,
    pub backend: &'static str,
    pub latency: LatencySummary,
    pub counters: CounterSnapshot,
    pub rates: Rates,
    pub ring_capacity: usize,
}

/// Per-second rates over the last reporting interval
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Rates {
    /// Periodic task invocations
    pub cycle_hz: f64,
    pub samples_per_sec: f64,
    pub frames_per_sec: f64,
}

/// Turns cumulative counts into rates between successive reports
#[derive(Debug, Clone)]
pub struct RateTracker {
    cycles: u64,
    samples: u64,
    frames: u64,
    at: Instant,
}

impl RateTracker {
    pub fn new(now: Instant) -> Self {
        Self {
            cycles: 0,
            samples: 0,
            frames: 0,
            at: now,
        }
    }

    /// Rates since the previous update; zero if no time has passed
    ///
    /// Counts that went backwards (after a statistics reset) restart the
    /// baseline.
    pub fn update(&mut self, latency: &LatencySummary, counters: &CounterSnapshot, now: Instant) -> Rates {
        let elapsed = now.saturating_duration_since(self.at).as_secs_f64();
        let rate = |current: u64, previous: u64| {
            if elapsed > 0.0 {
                current.saturating_sub(previous) as f64 / elapsed
            } else {
                0.0
            }
        };

        let rates = Rates {
            cycle_hz: rate(latency.count, self.cycles),
            samples_per_sec: rate(counters.samples, self.samples),
            frames_per_sec: rate(counters.frames_written, self.frames),
        };
        self.cycles = latency.count;
        self.samples = counters.samples;
        self.frames = counters.frames_written;
        self.at = now;
        rates
    }
}

/// Handles the reporter reads from
#[derive(Clone)]
pub struct StatsSource {
    pub device: String,
    pub backend: &'static str,
    pub latency: Arc<LatencyStats>,
    pub counters: Arc<BridgeCounters>,
    pub ring_capacity: usize,
}

impl StatsSource {
    pub fn snapshot(&self) -> StatsMessage {
        StatsMessage {
            timestamp: Utc::now(),
            device: self.device.clone(),
            backend: self.backend,
            latency: self.latency.summary(),
            counters: self.counters.snapshot(),
            rates: Rates::default(),
            ring_capacity: self.ring_capacity,
        }
    }
}

/// Serve Prometheus metrics on `config.listen`
///
/// Must be called inside a tokio runtime.
pub fn install_metrics_exporter(config: &MetricsConfig) -> Result<(), BridgeError> {
    PrometheusBuilder::new()
        .with_http_listener(config.listen)
        .install()
        .map_err(|e| BridgeError::Metrics(e.to_string()))?;
    info!("Prometheus metrics on http://{}/metrics", config.listen);
    Ok(())
}

fn record_metrics(stats: &StatsMessage) {
    let c = &stats.counters;
    counter!("bridge_samples_total").absolute(c.samples);
    counter!("bridge_frames_written_total").absolute(c.frames_written);
    counter!("bridge_bytes_written_total").absolute(c.bytes_written);
    counter!("bridge_frames_dropped_total").absolute(c.frames_dropped);
    counter!("bridge_frames_rejected_total").absolute(c.frames_rejected);
    counter!("bridge_messages_published_total").absolute(c.messages_published);
    counter!("bridge_publish_failures_total").absolute(c.publish_failures);
    counter!("bridge_decode_errors_total").absolute(c.decode_errors);
    counter!("bridge_frames_lost_total").absolute(c.frames_lost);
    counter!("bridge_deadline_misses_total").absolute(stats.latency.deadline_misses);

    gauge!("bridge_ring_fill_bytes").set(c.ring_fill as f64);
    gauge!("bridge_cycle_latency_min_us").set(stats.latency.min_us());
    gauge!("bridge_cycle_latency_avg_us").set(stats.latency.avg_us());
    gauge!("bridge_cycle_latency_max_us").set(stats.latency.max_us());
    gauge!("bridge_cycle_latency_p50_us").set(stats.latency.p50_us());
    gauge!("bridge_cycle_latency_p95_us").set(stats.latency.p95_us());
    gauge!("bridge_cycle_latency_p99_us").set(stats.latency.p99_us());
    gauge!("bridge_cycle_hz").set(stats.rates.cycle_hz);
    gauge!("bridge_samples_per_sec").set(stats.rates.samples_per_sec);
    gauge!("bridge_frames_per_sec").set(stats.rates.frames_per_sec);
}

/// Publish one stats message, with rates since the previous report
pub fn report(
    source: &StatsSource,
    rates: &mut RateTracker,
    publisher: &dyn Publisher,
    topic: &str,
) -> StatsMessage {
    let mut stats = source.snapshot();
    stats.rates = rates.update(&stats.latency, &stats.counters, Instant::now());
    info!(
        cycles = stats.latency.count,
        misses = stats.latency.deadline_misses,
        avg_us = stats.latency.avg_us(),
        p99_us = stats.latency.p99_us(),
        max_us = stats.latency.max_us(),
        cycle_hz = stats.rates.cycle_hz,
        samples_per_sec = stats.rates.samples_per_sec,
        written = stats.counters.frames_written,
        dropped = stats.counters.frames_dropped,
        published = stats.counters.messages_published,
        "Bridge stats"
    );
    record_metrics(&stats);

    match serde_json::to_vec(&stats) {
        Ok(payload) => {
            if let Err(e) = publisher.publish(topic, &payload) {
                warn!("Stats publish failed: {}", e);
            }
        }
        Err(e) => warn!("Stats serialization failed: {}", e),
    }
    stats
}

/// Report every `interval` until `shutdown` turns true or its sender drops
pub async fn run_stats_reporter(
    source: StatsSource,
    publisher: Arc<dyn Publisher>,
    topic_prefix: String,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let topic = format!("{}/stats", topic_prefix.trim_end_matches('/'));
    let mut rates = RateTracker::new(Instant::now());
    let mut ticker = tokio::time::interval(interval);
    // First tick fires immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                report(&source, &mut rates, publisher.as_ref(), &topic);
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    // Final figures at shutdown
    report(&source, &mut rates, publisher.as_ref(), &topic);
}
