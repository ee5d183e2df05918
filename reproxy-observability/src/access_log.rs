use serde::{Deserialize, Serialize};

/// Structured access log entry, written once per request by the combined-format access-log
/// middleware.
#[derive(Debug, Serialize, Deserialize)]
pub struct AccessLogEntry {
    pub timestamp: String,
    pub rule_id: String,
    pub client_ip: String,
    pub method: String,
    pub uri: String,
    pub response_status: u16,
    pub latency_ms: f64,
    pub upstream_addr: Option<String>,
}

impl AccessLogEntry {
    /// Apache-combined-style line: `client_ip - - [timestamp] "METHOD uri" status latency_ms upstream`.
    pub fn to_combined_line(&self) -> String {
        format!(
            "{} - - [{}] \"{} {}\" {} {:.2} {}",
            self.client_ip,
            self.timestamp,
            self.method,
            self.uri,
            self.response_status,
            self.latency_ms,
            self.upstream_addr.as_deref().unwrap_or("-"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combined_line_falls_back_to_dash_without_upstream() {
        let entry = AccessLogEntry {
            timestamp: "2026-07-29T00:00:00Z".into(),
            rule_id: "example-rule".into(),
            client_ip: "127.0.0.1".into(),
            method: "GET".into(),
            uri: "/".into(),
            response_status: 200,
            latency_ms: 1.5,
            upstream_addr: None,
        };
        assert!(entry.to_combined_line().ends_with(" -"));
    }
}
