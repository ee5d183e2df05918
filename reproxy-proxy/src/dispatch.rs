use crate::lb::LoadBalancer;
use reproxy_discovery::table::{MatchedRoute, RuleTable};

/// Resolve `(host, path)` against the published table and pick one alive destination among the
/// matched group. `None` covers both "nothing matched" and "everything matched is dead" — the
/// caller reports both as a 502, since there is no destination to proxy to either way.
pub fn select_route(table: &RuleTable, lb: &LoadBalancer, host: &str, path: &str) -> Option<MatchedRoute> {
    let matches = table.lookup(host, path);
    let alive = matches.alive_routes();
    if alive.is_empty() {
        return None;
    }
    let index = lb.select(alive.len());
    Some(alive[index].clone())
}

/// Split a fully-expanded destination (`http://host:port/path?query`, `$1`/`$host` already
/// substituted) into a dial address and the path+query to forward upstream. Destinations
/// lacking a recognized scheme are treated as already being a bare `host:port` with no path.
pub fn split_destination(destination: &str) -> (String, String) {
    let without_scheme = destination
        .strip_prefix("http://")
        .or_else(|| destination.strip_prefix("https://"))
        .unwrap_or(destination);

    match without_scheme.find('/') {
        Some(idx) => (without_scheme[..idx].to_string(), without_scheme[idx..].to_string()),
        None => (without_scheme.to_string(), "/".to_string()),
    }
}

/// The rate-limiter key for a resolved request: `{client_ip}|{dst}` when a proxy destination was
/// resolved, else plain `{client_ip}` — matching the per-user limiter's documented key shape.
pub fn limiter_key(client_ip: std::net::IpAddr, destination: Option<&str>) -> String {
    match destination {
        Some(dst) => format!("{client_ip}|{dst}"),
        None => client_ip.to_string(),
    }
}
