use reproxy_core::rule::MatchType;
use reproxy_discovery::table::RuleTable;
use serde::Serialize;

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    services: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    passed: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    failed: Option<usize>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    errors: Vec<String>,
}

/// Render the `/health` JSON body and status code from the `alive` flags the health scheduler
/// already maintains. This never pings anything itself — it has to be callable from the monoio
/// request path, which has no tokio reactor to drive `reqwest` with.
pub fn render(table: &RuleTable) -> (u16, Vec<u8>) {
    let proxy_rules: Vec<_> =
        table.mappers().into_iter().filter(|r| r.rule.match_type == MatchType::Proxy).collect();
    let services = proxy_rules.len();
    let with_ping: Vec<_> = proxy_rules.iter().filter(|r| r.rule.ping_url.is_some()).collect();
    let failed_rules: Vec<_> = with_ping.iter().filter(|r| !r.rule.is_alive()).collect();

    if failed_rules.is_empty() {
        let body = HealthBody { status: "ok", services, passed: None, failed: None, errors: vec![] };
        (200, serde_json::to_vec(&body).unwrap_or_default())
    } else {
        let passed = with_ping.len() - failed_rules.len();
        let errors = failed_rules
            .iter()
            .map(|r| format!("{}: ping failed", r.rule.ping_url.as_deref().unwrap_or("")))
            .collect();
        let body =
            HealthBody { status: "failed", services, passed: Some(passed), failed: Some(failed_rules.len()), errors };
        (417, serde_json::to_vec(&body).unwrap_or_default())
    }
}
