//! Cache result counters exposed at `/metrics`.

use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Shared counters backed by a dedicated Prometheus registry.
///
/// One counter family, `cachebox_cache_total`, split by a `result` label
/// taking the values `hit`, `miss` and `skip`.
#[derive(Clone)]
pub struct CacheMetrics {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Registry,
    results: IntCounterVec,
}

impl CacheMetrics {
    /// Creates a metrics instance with a fresh registry.
    #[must_use]
    pub fn new() -> Self {
        let registry = Registry::new();
        let results = IntCounterVec::new(
            Opts::new("cachebox_cache_total", "Cache requests by result"),
            &["result"],
        )
        .expect("metric can be created");
        registry
            .register(Box::new(results.clone()))
            .expect("metric can be registered");

        // Materialise all three series so they scrape as zero from startup.
        for result in ["hit", "miss", "skip"] {
            results.with_label_values(&[result]);
        }

        Self {
            inner: Arc::new(Inner { registry, results }),
        }
    }

    /// Records a cache hit.
    pub fn hit(&self) {
        self.inner.results.with_label_values(&["hit"]).inc();
    }

    /// Records a cache miss.
    pub fn miss(&self) {
        self.inner.results.with_label_values(&["miss"]).inc();
    }

    /// Records a skipped request (policy skip or non-2xx upstream).
    pub fn skip(&self) {
        self.inner.results.with_label_values(&["skip"]).inc();
    }

    /// Returns the current count for a result label.
    #[must_use]
    pub fn count(&self, result: &str) -> u64 {
        self.inner.results.with_label_values(&[result]).get()
    }

    /// Gathers all metrics and encodes them in the Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn gather_and_encode(&self) -> std::result::Result<String, String> {
        let encoder = TextEncoder::new();
        let metric_families = self.inner.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| format!("failed to encode metrics: {e}"))?;
        String::from_utf8(buffer)
            .map_err(|e| format!("metrics encoding produced invalid UTF-8: {e}"))
    }
}

impl Default for CacheMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let m = CacheMetrics::new();
        assert_eq!(m.count("hit"), 0);
        assert_eq!(m.count("miss"), 0);
        assert_eq!(m.count("skip"), 0);
    }

    #[test]
    fn counters_increment_independently() {
        let m = CacheMetrics::new();
        m.hit();
        m.hit();
        m.miss();
        m.skip();
        assert_eq!(m.count("hit"), 2);
        assert_eq!(m.count("miss"), 1);
        assert_eq!(m.count("skip"), 1);
    }

    #[test]
    fn clone_shares_underlying_counters() {
        let m = CacheMetrics::new();
        let clone = m.clone();
        m.hit();
        assert_eq!(clone.count("hit"), 1);
    }

    #[test]
    fn encodes_all_result_series() {
        let m = CacheMetrics::new();
        m.miss();
        let output = m.gather_and_encode().unwrap();
        assert!(output.contains(r#"cachebox_cache_total{result="miss"} 1"#));
        assert!(output.contains(r#"cachebox_cache_total{result="hit"} 0"#));
        assert!(output.contains(r#"cachebox_cache_total{result="skip"} 0"#));
    }
}
