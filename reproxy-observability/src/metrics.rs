use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Internal request counters. This is the "metrics (or no-op)" middleware hook the dispatch chain
/// calls on every request — reproxy itself never exposes a scrape endpoint or pushes anywhere;
/// `gather_text` exists so a caller wiring one in later has something to serve.
pub struct Metrics {
    registry: Registry,

    pub requests_total: IntCounterVec,
    pub request_duration: HistogramVec,
    pub active_connections: IntGauge,
    pub upstream_latency: HistogramVec,
    pub ingress_bytes: IntCounterVec,
    pub egress_bytes: IntCounterVec,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("reproxy_requests_total", "Total HTTP requests").namespace("reproxy"),
            &["rule", "method", "status"],
        )?;

        let request_duration = HistogramVec::new(
            HistogramOpts::new("reproxy_request_duration_seconds", "Request latency")
                .namespace("reproxy")
                .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["rule"],
        )?;

        let active_connections =
            IntGauge::new("reproxy_active_connections", "Number of active connections")?;

        let upstream_latency = HistogramVec::new(
            HistogramOpts::new("reproxy_upstream_latency_seconds", "Upstream response time")
                .namespace("reproxy")
                .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
            &["upstream"],
        )?;

        let ingress_bytes = IntCounterVec::new(
            Opts::new("reproxy_ingress_bytes_total", "Total ingress bandwidth").namespace("reproxy"),
            &["rule"],
        )?;

        let egress_bytes = IntCounterVec::new(
            Opts::new("reproxy_egress_bytes_total", "Total egress bandwidth").namespace("reproxy"),
            &["rule"],
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;
        registry.register(Box::new(active_connections.clone()))?;
        registry.register(Box::new(upstream_latency.clone()))?;
        registry.register(Box::new(ingress_bytes.clone()))?;
        registry.register(Box::new(egress_bytes.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            request_duration,
            active_connections,
            upstream_latency,
            ingress_bytes,
            egress_bytes,
        })
    }

    /// Record a completed request against its matched rule, or `"-"` when nothing matched.
    pub fn record_request(&self, rule: &str, method: &str, status: u16, duration_secs: f64) {
        self.requests_total.with_label_values(&[rule, method, &status.to_string()]).inc();
        self.request_duration.with_label_values(&[rule]).observe(duration_secs);
    }

    pub fn record_upstream_latency(&self, upstream: &str, duration_secs: f64) {
        self.upstream_latency.with_label_values(&[upstream]).observe(duration_secs);
    }

    /// Prometheus text exposition, for a caller that wants to wire up its own scrape endpoint.
    pub fn gather_text(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&families, &mut buffer).unwrap_or_default();
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("failed to construct metrics registry")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_request_increments_counter() {
        let metrics = Metrics::new().unwrap();
        metrics.record_request("example-rule", "GET", 200, 0.01);
        let text = metrics.gather_text();
        assert!(text.contains("reproxy_requests_total"));
    }
}
