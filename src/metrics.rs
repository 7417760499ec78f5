//! Metrics collection and export module

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use std::time::Instant;

/// Global metrics registry
pub struct Metrics {
    registry: Registry,

    // Counters
    pub drafts_built: IntCounter,
    pub drafts_rejected: IntCounter,
    pub cosign_requests: IntCounter,
    pub broadcasts: IntCounter,
    pub confirmations: IntCounter,
    pub unconfirmed_results: IntCounter,
    pub sponsored_inits: IntCounter,
    pub duplicate_inits_dropped: IntCounter,
    pub errors_total: IntCounterVec,

    // Lookup table cache
    pub lookup_table_cache_hits: IntCounter,
    pub lookup_table_cache_misses: IntCounter,

    // Gauges
    pub operations_in_flight: IntGauge,

    // Histograms
    pub build_latency: Histogram,
    pub cosign_latency: Histogram,
    pub confirm_latency: Histogram,
    pub tx_size_bytes: Histogram,
}

impl Metrics {
    /// Create new metrics instance
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let drafts_built = IntCounter::with_opts(Opts::new(
            "drafts_built_total",
            "Number of unsigned drafts handed to clients",
        ))?;

        let drafts_rejected = IntCounter::with_opts(Opts::new(
            "drafts_rejected_total",
            "Number of user-signed drafts rejected by ceremony validation",
        ))?;

        let cosign_requests = IntCounter::with_opts(Opts::new(
            "cosign_requests_total",
            "Number of custodial signer requests",
        ))?;

        let broadcasts =
            IntCounter::with_opts(Opts::new("broadcasts_total", "Number of accepted broadcasts"))?;

        let confirmations = IntCounter::with_opts(Opts::new(
            "confirmations_total",
            "Number of transactions confirmed within the polling window",
        ))?;

        let unconfirmed_results = IntCounter::with_opts(Opts::new(
            "unconfirmed_results_total",
            "Number of results returned with a signature but without confirmation",
        ))?;

        let sponsored_inits = IntCounter::with_opts(Opts::new(
            "sponsored_account_inits_total",
            "Number of account initializations paid for by the sponsor",
        ))?;

        let duplicate_inits_dropped = IntCounter::with_opts(Opts::new(
            "duplicate_account_inits_dropped_total",
            "Number of duplicate account initializations removed from drafts",
        ))?;

        let errors_total = IntCounterVec::new(
            Opts::new("operation_errors_total", "Operation errors by kind and stage"),
            &["kind", "stage"],
        )?;

        let lookup_table_cache_hits = IntCounter::with_opts(Opts::new(
            "lookup_table_cache_hits_total",
            "Lookup table resolutions served from cache",
        ))?;

        let lookup_table_cache_misses = IntCounter::with_opts(Opts::new(
            "lookup_table_cache_misses_total",
            "Lookup table resolutions fetched from the network",
        ))?;

        let operations_in_flight = IntGauge::with_opts(Opts::new(
            "operations_in_flight",
            "Number of pipeline operations currently running",
        ))?;

        let build_latency = Histogram::with_opts(
            HistogramOpts::new("build_latency_seconds", "Draft build latency")
                .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
        )?;

        let cosign_latency = Histogram::with_opts(
            HistogramOpts::new("cosign_latency_seconds", "Custodial signer latency")
                .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]),
        )?;

        let confirm_latency = Histogram::with_opts(
            HistogramOpts::new("confirm_latency_seconds", "Broadcast to confirmation latency")
                .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 20.0, 30.0, 60.0]),
        )?;

        let tx_size_bytes = Histogram::with_opts(
            HistogramOpts::new("tx_size_bytes", "Serialized draft size")
                .buckets(vec![256.0, 512.0, 768.0, 1024.0, 1152.0, 1232.0]),
        )?;

        // Register all metrics
        registry.register(Box::new(drafts_built.clone()))?;
        registry.register(Box::new(drafts_rejected.clone()))?;
        registry.register(Box::new(cosign_requests.clone()))?;
        registry.register(Box::new(broadcasts.clone()))?;
        registry.register(Box::new(confirmations.clone()))?;
        registry.register(Box::new(unconfirmed_results.clone()))?;
        registry.register(Box::new(sponsored_inits.clone()))?;
        registry.register(Box::new(duplicate_inits_dropped.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;
        registry.register(Box::new(lookup_table_cache_hits.clone()))?;
        registry.register(Box::new(lookup_table_cache_misses.clone()))?;
        registry.register(Box::new(operations_in_flight.clone()))?;
        registry.register(Box::new(build_latency.clone()))?;
        registry.register(Box::new(cosign_latency.clone()))?;
        registry.register(Box::new(confirm_latency.clone()))?;
        registry.register(Box::new(tx_size_bytes.clone()))?;

        Ok(Self {
            registry,
            drafts_built,
            drafts_rejected,
            cosign_requests,
            broadcasts,
            confirmations,
            unconfirmed_results,
            sponsored_inits,
            duplicate_inits_dropped,
            errors_total,
            lookup_table_cache_hits,
            lookup_table_cache_misses,
            operations_in_flight,
            build_latency,
            cosign_latency,
            confirm_latency,
            tx_size_bytes,
        })
    }

    /// Get the registry for exporting
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Count an operation error under its kind and stage labels
    pub fn record_error(&self, kind: &str, stage: &str) {
        self.errors_total.with_label_values(&[kind, stage]).inc();
    }
}

/// Global metrics instance
pub fn metrics() -> &'static Metrics {
    static METRICS: once_cell::sync::Lazy<Metrics> =
        once_cell::sync::Lazy::new(|| Metrics::new().expect("Failed to initialize metrics"));
    &METRICS
}

/// Timer helper for measuring operation duration
pub struct Timer {
    start: Instant,
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn observe_duration(&self, histogram: &Histogram) {
        histogram.observe(self.start.elapsed().as_secs_f64());
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

/// Increments a gauge on creation and decrements it on drop
pub struct InFlightGuard<'a> {
    gauge: &'a IntGauge,
}

impl<'a> InFlightGuard<'a> {
    pub fn new(gauge: &'a IntGauge) -> Self {
        gauge.inc();
        Self { gauge }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_and_gather() {
        let m = Metrics::new().unwrap();
        m.drafts_built.inc();
        m.record_error("PAYLOAD_TOO_LARGE", "compose");
        let text = prometheus::TextEncoder::new()
            .encode_to_string(&m.registry().gather())
            .unwrap();
        assert!(text.contains("drafts_built_total 1"));
        assert!(text.contains("operation_errors_total{kind=\"PAYLOAD_TOO_LARGE\",stage=\"compose\"} 1"));
    }

    #[test]
    fn test_in_flight_guard() {
        let m = Metrics::new().unwrap();
        {
            let _guard = InFlightGuard::new(&m.operations_in_flight);
            assert_eq!(m.operations_in_flight.get(), 1);
        }
        assert_eq!(m.operations_in_flight.get(), 0);
    }
}
