//! Prometheus metrics

use prometheus::{Encoder, HistogramOpts, HistogramVec, IntGaugeVec, Opts, Registry, TextEncoder};

/// Metrics exported on `/metrics`
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    ip_counter: IntGaugeVec,
    schedule_latency: HistogramVec,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Metrics {
    /// Register all metrics in a fresh registry
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let ip_counter = IntGaugeVec::new(
            Opts::new("galaxy_ip_counter", "Floating ips by state and node subnet"),
            &["type", "subnet"],
        )?;
        let schedule_latency = HistogramVec::new(
            HistogramOpts::new(
                "galaxy_schedule_latency_seconds",
                "Latency of scheduler extender callbacks",
            )
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 3.0, 10.0]),
            &["operation"],
        )?;
        registry.register(Box::new(ip_counter.clone()))?;
        registry.register(Box::new(schedule_latency.clone()))?;
        Ok(Self {
            registry,
            ip_counter,
            schedule_latency,
        })
    }

    /// Set the number of `state` (`total` or `allocated`) ips in `subnet`
    pub fn set_ip_count(&self, state: &str, subnet: &str, count: usize) {
        self.ip_counter
            .with_label_values(&[state, subnet])
            .set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    /// Record how long `operation` took
    pub fn observe_latency(&self, operation: &str, seconds: f64) {
        self.schedule_latency.with_label_values(&[operation]).observe(seconds);
    }

    /// Text exposition of all metrics
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
