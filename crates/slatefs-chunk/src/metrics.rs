//! Metrics sink for the chunk store
//!
//! [`StoreMetrics`] is constructed by the caller and handed to the store, so
//! its lifetime follows the store rather than a process-wide registry.
//! [`PrometheusExporter`] renders a snapshot in Prometheus text format.
//!
//! # Prometheus Metrics
//!
//! ## Counters
//! - `slatefs_write_bytes_total`, `slatefs_read_bytes_total`
//! - `slatefs_cache_hits_total`, `slatefs_cache_misses_total`, `slatefs_cache_evictions_total`
//! - `slatefs_object_requests_total{op}`, `slatefs_object_bytes_total{op}`
//! - `slatefs_object_retries_total{op}`, `slatefs_object_failures_total{op}`
//! - `slatefs_compactions_total`, `slatefs_deletions_total`
//!
//! ## Gauges
//! - `slatefs_buffer_bytes`, `slatefs_cache_bytes`, `slatefs_cache_blocks`, `slatefs_staging_blocks`
//!
//! ## Histograms
//! - `slatefs_object_request_duration_seconds{op}`
//! - `slatefs_read_duration_seconds`

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

/// Bucket boundaries in microseconds
const BUCKET_BOUNDARIES_US: [u64; 16] = [
    100,
    250,
    500,
    1_000,
    2_500,
    5_000,
    10_000,
    25_000,
    50_000,
    100_000,
    250_000,
    500_000,
    1_000_000,
    2_500_000,
    5_000_000,
    u64::MAX,
];

/// Latency histogram with fixed buckets
#[derive(Debug)]
pub struct LatencyHistogram {
    buckets: [AtomicU64; 16],
    count: AtomicU64,
    sum: AtomicU64,
    max: AtomicU64,
}

impl LatencyHistogram {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buckets: Default::default(),
            count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            max: AtomicU64::new(0),
        }
    }

    /// Record a latency sample in microseconds
    pub fn record(&self, latency_us: u64) {
        let bucket_idx = BUCKET_BOUNDARIES_US
            .iter()
            .position(|&boundary| latency_us < boundary)
            .unwrap_or(15);

        self.buckets[bucket_idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(latency_us, Ordering::Relaxed);
        self.max.fetch_max(latency_us, Ordering::Relaxed);
    }

    /// Record the time elapsed since `start`
    pub fn record_since(&self, start: std::time::Instant) {
        self.record(u64::try_from(start.elapsed().as_micros()).unwrap_or(u64::MAX));
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    pub fn max(&self) -> u64 {
        self.max.load(Ordering::Relaxed)
    }

    /// Get percentile latency in microseconds (upper bound of its bucket)
    ///
    /// # Arguments
    /// * `percentile` - Percentile to calculate (0.0 to 1.0, e.g., 0.99 for p99)
    pub fn percentile(&self, percentile: f64) -> u64 {
        let total = self.count();
        if total == 0 {
            return 0;
        }

        let target = ((total as f64) * percentile).ceil() as u64;
        let mut cumulative = 0u64;
        for (i, bucket) in self.buckets.iter().enumerate() {
            cumulative += bucket.load(Ordering::Relaxed);
            if cumulative >= target {
                return BUCKET_BOUNDARIES_US[i];
            }
        }
        BUCKET_BOUNDARIES_US[15]
    }

    /// Per-bucket counts, not cumulative
    pub fn bucket_counts(&self) -> Vec<(u64, u64)> {
        BUCKET_BOUNDARIES_US
            .iter()
            .zip(self.buckets.iter())
            .map(|(&boundary, count)| (boundary, count.load(Ordering::Relaxed)))
            .collect()
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters and latencies of one direction of remote traffic
#[derive(Debug, Default)]
pub struct ObjectMetrics {
    pub requests: AtomicU64,
    pub bytes: AtomicU64,
    pub retries: AtomicU64,
    pub failures: AtomicU64,
    pub latency: LatencyHistogram,
}

/// Metrics sink owned by one chunk store
#[derive(Debug, Default)]
pub struct StoreMetrics {
    pub writes: AtomicU64,
    pub write_bytes: AtomicU64,
    pub reads: AtomicU64,
    pub read_bytes: AtomicU64,
    pub read_latency: LatencyHistogram,
    pub flushes: AtomicU64,
    /// Writes that found the buffer budget exhausted
    pub backpressure: AtomicU64,

    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub cache_evictions: AtomicU64,
    pub cache_corruptions: AtomicU64,
    pub stage_failures: AtomicU64,

    pub put: ObjectMetrics,
    pub get: ObjectMetrics,
    pub prefetches: AtomicU64,
    pub prefetch_failures: AtomicU64,
    pub deletions: AtomicU64,
    pub compactions: AtomicU64,
    pub compaction_failures: AtomicU64,
    pub recovered_blocks: AtomicU64,
}

impl StoreMetrics {
    #[must_use]
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::default())
    }

    /// Cache hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }
}

/// Point-in-time gauges supplied by the store at render time
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreGauges {
    pub buffer_bytes: u64,
    pub cache_bytes: u64,
    pub cache_capacity: u64,
    pub cache_blocks: u64,
    pub staging_blocks: u64,
}

/// Prometheus text format exporter
pub struct PrometheusExporter {
    /// Metrics prefix (e.g., "slatefs")
    prefix: String,
}

impl PrometheusExporter {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Export metrics in Prometheus text format
    pub fn export(&self, metrics: &StoreMetrics, gauges: &StoreGauges) -> String {
        let mut output = String::with_capacity(8 * 1024);

        let counters: [(&str, &str, &AtomicU64); 17] = [
            ("writes_total", "Chunk writes accepted", &metrics.writes),
            ("write_bytes_total", "Bytes written into chunk buffers", &metrics.write_bytes),
            ("reads_total", "Chunk reads served", &metrics.reads),
            ("read_bytes_total", "Bytes returned by chunk reads", &metrics.read_bytes),
            ("flushes_total", "Buffer flushes", &metrics.flushes),
            ("backpressure_total", "Writes that waited on the buffer budget", &metrics.backpressure),
            ("cache_hits_total", "Block lookups served from cache", &metrics.cache_hits),
            ("cache_misses_total", "Block lookups that missed the cache", &metrics.cache_misses),
            ("cache_evictions_total", "Clean blocks evicted from cache", &metrics.cache_evictions),
            ("cache_corruptions_total", "Cached blocks that failed verification", &metrics.cache_corruptions),
            ("stage_failures_total", "Blocks that could not be staged locally", &metrics.stage_failures),
            ("recovered_blocks_total", "Staged blocks re-uploaded at startup", &metrics.recovered_blocks),
            ("prefetches_total", "Speculative block downloads", &metrics.prefetches),
            ("prefetch_failures_total", "Speculative downloads that failed", &metrics.prefetch_failures),
            ("deletions_total", "Blocks deleted from object storage", &metrics.deletions),
            ("compactions_total", "Completed compactions", &metrics.compactions),
            ("compaction_failures_total", "Aborted compactions", &metrics.compaction_failures),
        ];
        for (name, help, value) in counters {
            self.write_help(&mut output, name, help);
            self.write_type(&mut output, name, "counter");
            self.write_metric(&mut output, name, value.load(Ordering::Relaxed) as f64);
        }

        let directions = [("put", &metrics.put), ("get", &metrics.get)];
        let object_counters: [(&str, &str, fn(&ObjectMetrics) -> &AtomicU64); 4] = [
            ("object_requests_total", "Object storage requests", |m| &m.requests),
            ("object_bytes_total", "Bytes transferred to or from object storage", |m| &m.bytes),
            ("object_retries_total", "Retried object storage attempts", |m| &m.retries),
            ("object_failures_total", "Object storage requests that failed definitively", |m| &m.failures),
        ];
        for (name, help, field) in object_counters {
            self.write_help(&mut output, name, help);
            self.write_type(&mut output, name, "counter");
            for (op, m) in directions {
                self.write_metric_with_labels(
                    &mut output,
                    name,
                    field(m).load(Ordering::Relaxed) as f64,
                    &[("op", op)],
                );
            }
        }

        let gauge_values = [
            ("buffer_bytes", "Bytes held in write buffers", gauges.buffer_bytes),
            ("cache_bytes", "Bytes held in cache pools", gauges.cache_bytes),
            ("cache_capacity_bytes", "Configured cache capacity", gauges.cache_capacity),
            ("cache_blocks", "Blocks held in cache pools", gauges.cache_blocks),
            ("staging_blocks", "Cached blocks not yet durable remotely", gauges.staging_blocks),
        ];
        for (name, help, value) in gauge_values {
            self.write_help(&mut output, name, help);
            self.write_type(&mut output, name, "gauge");
            self.write_metric(&mut output, name, value as f64);
        }

        let name = "object_request_duration_seconds";
        self.write_help(&mut output, name, "Object storage request latency");
        self.write_type(&mut output, name, "histogram");
        for (op, m) in directions {
            export_histogram_prometheus(&mut output, &self.prefix, name, &[("op", op)], &m.latency);
        }

        let name = "read_duration_seconds";
        self.write_help(&mut output, name, "Chunk read latency");
        self.write_type(&mut output, name, "histogram");
        export_histogram_prometheus(&mut output, &self.prefix, name, &[], &metrics.read_latency);

        output
    }

    fn write_help(&self, output: &mut String, name: &str, help: &str) {
        let _ = writeln!(output, "# HELP {}_{} {}", self.prefix, name, help);
    }

    fn write_type(&self, output: &mut String, name: &str, metric_type: &str) {
        let _ = writeln!(output, "# TYPE {}_{} {}", self.prefix, name, metric_type);
    }

    fn write_metric(&self, output: &mut String, name: &str, value: f64) {
        let _ = writeln!(output, "{}_{} {}", self.prefix, name, value);
    }

    fn write_metric_with_labels(
        &self,
        output: &mut String,
        name: &str,
        value: f64,
        labels: &[(&str, &str)],
    ) {
        let _ = writeln!(
            output,
            "{}_{}{{{}}} {}",
            self.prefix,
            name,
            format_labels(labels),
            value
        );
    }
}

impl Default for PrometheusExporter {
    fn default() -> Self {
        Self::new("slatefs")
    }
}

fn format_labels(labels: &[(&str, &str)]) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}=\"{v}\""))
        .collect::<Vec<_>>()
        .join(",")
}

/// Export latency histogram in Prometheus histogram format
pub fn export_histogram_prometheus(
    output: &mut String,
    prefix: &str,
    name: &str,
    labels: &[(&str, &str)],
    histogram: &LatencyHistogram,
) {
    let base = format_labels(labels);
    let sep = if base.is_empty() { "" } else { "," };

    let mut cumulative = 0u64;
    for (boundary_us, count) in histogram.bucket_counts() {
        cumulative += count;
        if boundary_us == u64::MAX {
            continue;
        }
        let boundary_secs = boundary_us as f64 / 1_000_000.0;
        let _ = writeln!(
            output,
            "{prefix}_{name}_bucket{{{base}{sep}le=\"{boundary_secs}\"}} {cumulative}"
        );
    }
    let _ = writeln!(
        output,
        "{prefix}_{name}_bucket{{{base}{sep}le=\"+Inf\"}} {}",
        histogram.count()
    );

    let sum_secs = histogram.sum() as f64 / 1_000_000.0;
    if base.is_empty() {
        let _ = writeln!(output, "{prefix}_{name}_sum {sum_secs}");
        let _ = writeln!(output, "{prefix}_{name}_count {}", histogram.count());
    } else {
        let _ = writeln!(output, "{prefix}_{name}_sum{{{base}}} {sum_secs}");
        let _ = writeln!(output, "{prefix}_{name}_count{{{base}}} {}", histogram.count());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_percentiles() {
        let hist = LatencyHistogram::new();
        for _ in 0..90 {
            hist.record(800);
        }
        for _ in 0..10 {
            hist.record(30_000);
        }
        assert_eq!(hist.count(), 100);
        assert_eq!(hist.percentile(0.5), 1_000);
        assert_eq!(hist.percentile(0.99), 50_000);
        assert_eq!(hist.max(), 30_000);
    }

    #[test]
    fn test_hit_ratio() {
        let metrics = StoreMetrics::default();
        assert!(metrics.hit_ratio().abs() < f64::EPSILON);
        metrics.cache_hits.store(3, Ordering::Relaxed);
        metrics.cache_misses.store(1, Ordering::Relaxed);
        assert!((metrics.hit_ratio() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = StoreMetrics::default();
        metrics.write_bytes.store(4096, Ordering::Relaxed);
        metrics.put.retries.store(2, Ordering::Relaxed);
        metrics.get.latency.record(1_500);

        let gauges = StoreGauges {
            staging_blocks: 5,
            ..StoreGauges::default()
        };
        let text = PrometheusExporter::default().export(&metrics, &gauges);

        assert!(text.contains("# TYPE slatefs_write_bytes_total counter"));
        assert!(text.contains("slatefs_write_bytes_total 4096"));
        assert!(text.contains("slatefs_object_retries_total{op=\"put\"} 2"));
        assert!(text.contains("slatefs_staging_blocks 5"));
        assert!(text.contains("slatefs_object_request_duration_seconds_bucket{op=\"get\",le=\"0.0025\"} 1"));
        assert!(text.contains("slatefs_object_request_duration_seconds_count{op=\"get\"} 1"));
        assert!(text.contains("slatefs_read_duration_seconds_bucket{le=\"+Inf\"} 0"));
    }
}
