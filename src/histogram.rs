//! Rolling latency histogram.
//!
//! Latencies land in cumulative bucket counters keyed to 10-second time
//! slices; a percentile query merges the most recent slices into one
//! cumulative distribution and interpolates within the bracketing
//! bucket. Recording one sample touches every boundary at or above the
//! latency, so each boundary's counter already holds "samples at or
//! below me" and merging is a plain per-boundary sum.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use crate::config::HistogramConfig;
use crate::store::AtomicStore;

pub struct LatencyHistogram {
    store: Arc<dyn AtomicStore>,
    config: HistogramConfig,
}

impl LatencyHistogram {
    pub fn new(store: Arc<dyn AtomicStore>, config: HistogramConfig) -> Self {
        Self { store, config }
    }

    fn slice_start(&self, now_ms: u64) -> u64 {
        now_ms - now_ms % self.config.slice_duration_ms
    }

    /// Starts of the slices covering the retention window, newest first.
    fn window_slices(&self, now_ms: u64) -> Vec<u64> {
        let current = self.slice_start(now_ms);
        (0..self.config.max_slices as u64)
            .map_while(|i| current.checked_sub(i * self.config.slice_duration_ms))
            .collect()
    }

    pub fn record(&self, latency_ms: u64, now_ms: u64) {
        let slice = self.slice_start(now_ms);
        if let Err(e) = self.store.histogram_record(
            slice,
            latency_ms,
            &self.config.boundaries,
            self.config.slice_ttl_ms(),
            now_ms,
        ) {
            warn!(error = %e, latency_ms, "latency sample dropped");
        }
    }

    pub fn p95(&self, now_ms: u64) -> f64 {
        self.percentile(0.95, now_ms)
    }

    pub fn p99(&self, now_ms: u64) -> f64 {
        self.percentile(0.99, now_ms)
    }

    /// Percentile over the merged retention window, 0.0 when no samples
    /// were recorded. Store read failures read as empty slices.
    pub fn percentile(&self, p: f64, now_ms: u64) -> f64 {
        let mut merged: HashMap<u64, u64> = HashMap::new();
        for slice in self.window_slices(now_ms) {
            let counts = match self.store.histogram_slice(slice, now_ms) {
                Ok(counts) => counts,
                Err(e) => {
                    warn!(error = %e, slice, "histogram slice read failed, skipping");
                    continue;
                }
            };
            for (boundary, count) in counts {
                *merged.entry(boundary).or_insert(0) += count;
            }
        }

        let Some(&last) = self.config.boundaries.last() else {
            return 0.0;
        };
        let total = merged.get(&last).copied().unwrap_or(0);
        if total == 0 {
            return 0.0;
        }
        let target = (total as f64 * p).ceil() as u64;

        let mut prev_boundary = 0u64;
        let mut prev_cum = 0u64;
        for &boundary in &self.config.boundaries {
            let cum = merged.get(&boundary).copied().unwrap_or(0);
            if cum >= target {
                // A flat stretch means every sample in the bracket sits at
                // or below the previous boundary already counted.
                if cum == prev_cum {
                    return boundary as f64;
                }
                let fraction = (target - prev_cum) as f64 / (cum - prev_cum) as f64;
                return prev_boundary as f64 + (boundary - prev_boundary) as f64 * fraction;
            }
            prev_boundary = boundary;
            prev_cum = cum;
        }
        last as f64
    }

    /// Drop every slice in the retention window.
    pub fn clear(&self, now_ms: u64) {
        let slices = self.window_slices(now_ms);
        if let Err(e) = self.store.histogram_clear(&slices) {
            warn!(error = %e, "histogram clear failed");
        }
    }
}
