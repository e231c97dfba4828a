use crate::scenario::MetricsSink;
use dashmap::DashMap;
use hdrhistogram::Histogram;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{info, warn};

/// Latencies above this are clamped into the top bucket.
const MAX_TRACKED_MS: u64 = 60_000;

// =============================================================================
// Metrics
// =============================================================================

/// In-process [`MetricsSink`]: counters, gauges and per-name latency histograms
/// in milliseconds.
#[derive(Debug, Default)]
pub struct HistogramMetrics {
    counters: DashMap<String, AtomicU64>,
    gauges: DashMap<String, AtomicI64>,
    latencies: DashMap<String, Histogram<u64>>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencySummary {
    pub count: u64,
    pub min: u64,
    pub mean: f64,
    pub p50: u64,
    pub p95: u64,
    pub p99: u64,
    pub max: u64,
}

impl HistogramMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn gauge(&self, name: &str) -> i64 {
        self.gauges
            .get(name)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn latency(&self, name: &str) -> Option<LatencySummary> {
        let hist = self.latencies.get(name)?;
        if hist.len() == 0 {
            return None;
        }
        Some(LatencySummary {
            count: hist.len(),
            min: hist.min(),
            mean: hist.mean(),
            p50: hist.value_at_quantile(0.50),
            p95: hist.value_at_quantile(0.95),
            p99: hist.value_at_quantile(0.99),
            max: hist.max(),
        })
    }

    pub fn print_summary(&self) {
        info!("╔════════════════════════════════════════════════════════════╗");
        info!("║                   STRESS TEST SUMMARY                      ║");
        info!("╚════════════════════════════════════════════════════════════╝");

        info!("");
        info!("Counters:");
        let counters = sorted_names(self.counters.iter().map(|e| e.key().clone()));
        if counters.is_empty() {
            info!("  No data");
        }
        for name in counters {
            info!("  {:<28} {}", name, self.counter(&name));
        }

        let gauges = sorted_names(self.gauges.iter().map(|e| e.key().clone()));
        if !gauges.is_empty() {
            info!("");
            info!("Gauges:");
            for name in gauges {
                info!("  {:<28} {}", name, self.gauge(&name));
            }
        }

        for name in sorted_names(self.latencies.iter().map(|e| e.key().clone())) {
            info!("");
            info!("{} (ms):", name);
            match self.latency(&name) {
                Some(summary) => {
                    info!("  Count:  {}", summary.count);
                    info!("  Min:    {:.2}", summary.min);
                    info!("  Mean:   {:.2}", summary.mean);
                    info!("  p50:    {:.2}", summary.p50);
                    info!("  p95:    {:.2}", summary.p95);
                    info!("  p99:    {:.2}", summary.p99);
                    info!("  Max:    {:.2}", summary.max);
                }
                None => info!("  No data"),
            }
        }

        info!("");
        info!("═══════════════════════════════════════════════════════════");
    }
}

impl MetricsSink for HistogramMetrics {
    fn increment_counter(&self, name: &str, by: u64) {
        if let Some(counter) = self.counters.get(name) {
            counter.fetch_add(by, Ordering::Relaxed);
            return;
        }
        self.counters
            .entry(name.to_string())
            .or_default()
            .fetch_add(by, Ordering::Relaxed);
    }

    fn record_latency(&self, name: &str, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        let hist = self
            .latencies
            .entry(name.to_string())
            .or_try_insert_with(|| Histogram::<u64>::new_with_bounds(1, MAX_TRACKED_MS, 3));
        match hist {
            Ok(mut hist) => hist.saturating_record(ms),
            Err(e) => warn!("Failed to create histogram for {}: {}", name, e),
        }
    }

    fn adjust_gauge(&self, name: &str, delta: i64) {
        if let Some(gauge) = self.gauges.get(name) {
            gauge.fetch_add(delta, Ordering::Relaxed);
            return;
        }
        self.gauges
            .entry(name.to_string())
            .or_default()
            .fetch_add(delta, Ordering::Relaxed);
    }
}

fn sorted_names(names: impl Iterator<Item = String>) -> Vec<String> {
    let mut names: Vec<String> = names.collect();
    names.sort();
    names
}
