use crate::metrics::Metrics;

/// Renders the current counters in Prometheus text exposition format. reproxy does not bind a
/// scrape endpoint itself — this is the hook a caller would serve from its own HTTP route.
pub fn render_metrics(metrics: &Metrics) -> String {
    metrics.gather_text()
}
