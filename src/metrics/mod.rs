// Metrics module - Prometheus metrics for the transformation proxy
//
// Counters cover the request flow end to end: cache probes, source
// failovers, transform retries, fallbacks, presign reuse, and background
// work. The shell serves `gather()` output on its metrics endpoint.

use std::sync::OnceLock;

use prometheus::{
    register_int_counter, register_int_counter_vec, Encoder, IntCounter, IntCounterVec,
    TextEncoder,
};

pub struct ProxyMetrics {
    /// Total transform requests handled
    pub requests: IntCounter,

    /// Cache probe outcomes, labeled hit/miss/bypass
    pub cache_probes: IntCounterVec,

    /// Cache writes, labeled single/chunked/skipped
    pub cache_writes: IntCounterVec,

    /// Source trials that failed and cascaded to the next source
    pub source_failovers: IntCounter,

    /// Transform invocations, labeled ok/error
    pub transform_invocations: IntCounterVec,

    /// Duration-limit retries performed
    pub duration_retries: IntCounter,

    /// Fallback responses served, labeled direct/storage
    pub fallbacks: IntCounterVec,

    /// Presigned URL handling, labeled mint/reuse/refresh
    pub presign_events: IntCounterVec,

    /// Background tasks, labeled spawned/dropped
    pub background_tasks: IntCounterVec,
}

static METRICS: OnceLock<ProxyMetrics> = OnceLock::new();

impl ProxyMetrics {
    /// The process-wide metrics instance, registered on first use.
    pub fn global() -> &'static Self {
        METRICS.get_or_init(|| ProxyMetrics {
            requests: register_int_counter!(
                "videogate_requests_total",
                "Total transform requests handled"
            )
            .expect("metric registration cannot fail for a fresh registry"),
            cache_probes: register_int_counter_vec!(
                "videogate_cache_probes_total",
                "Result cache probe outcomes",
                &["outcome"]
            )
            .expect("metric registration cannot fail for a fresh registry"),
            cache_writes: register_int_counter_vec!(
                "videogate_cache_writes_total",
                "Result cache writes by layout",
                &["layout"]
            )
            .expect("metric registration cannot fail for a fresh registry"),
            source_failovers: register_int_counter!(
                "videogate_source_failovers_total",
                "Source trials that cascaded to the next source"
            )
            .expect("metric registration cannot fail for a fresh registry"),
            transform_invocations: register_int_counter_vec!(
                "videogate_transform_invocations_total",
                "Transform invocations by outcome",
                &["outcome"]
            )
            .expect("metric registration cannot fail for a fresh registry"),
            duration_retries: register_int_counter!(
                "videogate_duration_retries_total",
                "Retries after a duration-limit rejection"
            )
            .expect("metric registration cannot fail for a fresh registry"),
            fallbacks: register_int_counter_vec!(
                "videogate_fallbacks_total",
                "Fallback responses served by path",
                &["path"]
            )
            .expect("metric registration cannot fail for a fresh registry"),
            presign_events: register_int_counter_vec!(
                "videogate_presign_events_total",
                "Presigned URL cache events",
                &["event"]
            )
            .expect("metric registration cannot fail for a fresh registry"),
            background_tasks: register_int_counter_vec!(
                "videogate_background_tasks_total",
                "Background gate decisions",
                &["decision"]
            )
            .expect("metric registration cannot fail for a fresh registry"),
        })
    }
}

/// Render every registered metric in the Prometheus text format.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&families, &mut buffer) {
        tracing::warn!(error = %err, "metrics encoding failed");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_returns_same_instance() {
        let first = ProxyMetrics::global() as *const ProxyMetrics;
        let second = ProxyMetrics::global() as *const ProxyMetrics;
        assert_eq!(first, second);
    }

    #[test]
    fn test_counters_increment_and_render() {
        let metrics = ProxyMetrics::global();
        metrics.requests.inc();
        metrics.cache_probes.with_label_values(&["hit"]).inc();
        metrics.fallbacks.with_label_values(&["direct"]).inc();

        let rendered = gather();
        assert!(rendered.contains("videogate_requests_total"));
        assert!(rendered.contains("videogate_cache_probes_total"));
    }
}
