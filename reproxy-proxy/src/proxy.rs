use crate::basic_auth;
use crate::dispatch::{self, limiter_key, split_destination};
use crate::error_reporter::ErrorReporter;
use crate::gzip;
use crate::health_endpoint;
use crate::ip_allow;
use crate::lb::LoadBalancer;
use crate::limiter::RateLimiter;
use arc_swap::ArcSwap;
use monoio::net::TcpStream;
use reproxy_core::config::ReproxyConfig;
use reproxy_core::rule::MatchType;
use reproxy_discovery::table::RuleTable;
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;

/// Outcome of routing one request through the fixed middleware chain. `Immediate` carries a
/// complete response the caller can write as-is; the other variants hand off to whatever I/O the
/// connection handler needs to perform (a proxied round trip, a filesystem read, a redirect).
#[derive(Debug)]
pub enum Decision {
    Proxy { upstream_addr: String, upstream_path: String, keep_host: bool, rule_label: String },
    StaticFile { fs_root: String, web_root: String, spa: bool, rule_label: String },
    Redirect { status: u16, location: String },
    Immediate { status: u16, headers: Vec<(String, String)>, body: Vec<u8> },
}

impl Decision {
    pub fn status(&self) -> u16 {
        match self {
            Decision::Proxy { .. } | Decision::StaticFile { .. } => 0,
            Decision::Redirect { status, .. } => *status,
            Decision::Immediate { status, .. } => *status,
        }
    }
}

/// Per-worker proxy state: one instance per monoio worker thread, reused across all connections
/// via `Rc<RefCell<ProxyWorker>>`. Everything here is plain (non-atomic) state, safe because
/// each worker thread owns its instance exclusively.
pub struct ProxyWorker {
    table: Arc<RuleTable>,
    table_handle: Arc<ArcSwap<RuleTable>>,
    config: Arc<ReproxyConfig>,
    lb: LoadBalancer,
    limiter: RateLimiter,
    error_reporter: ErrorReporter,
    extra_response_headers: Vec<(String, String)>,
    drop_request_headers: Vec<String>,
}

impl ProxyWorker {
    pub fn new(table_handle: Arc<ArcSwap<RuleTable>>, config: Arc<ReproxyConfig>) -> Self {
        let table = table_handle.load_full();
        let mut extra_response_headers = Vec::new();
        for directive in &config.proxy.header {
            if let Some(pair) = crate::headers::parse_directive(directive) {
                extra_response_headers.push(pair);
            }
        }
        if config.signature {
            extra_response_headers.push(("app-name".to_string(), "reproxy".to_string()));
            extra_response_headers.push(("app-version".to_string(), env!("CARGO_PKG_VERSION").to_string()));
            extra_response_headers.push(("author".to_string(), "umputun".to_string()));
        }
        let drop_request_headers: Vec<String> = config.proxy.drop_header.iter().map(|h| h.to_lowercase()).collect();
        let error_reporter = ErrorReporter::new(&config.error);
        let lb = LoadBalancer::new(config.lb.r#type);
        let limiter = RateLimiter::new(config.limiter.system, config.limiter.user);

        Self { table, table_handle, config, lb, limiter, error_reporter, extra_response_headers, drop_request_headers }
    }

    /// Check whether the published table changed. Called once per accept-loop iteration, not
    /// per request — a fresh `Arc` pointer means the discovery service rebuilt and swapped it.
    #[inline]
    pub fn maybe_update_table(&mut self) {
        let current = self.table_handle.load_full();
        if !Arc::ptr_eq(&current, &self.table) {
            self.table = current;
        }
    }

    /// Request header names to strip before forwarding upstream (case already lowered).
    pub fn drop_request_headers(&self) -> &[String] {
        &self.drop_request_headers
    }

    pub fn max_body_size(&self) -> u64 {
        self.config.proxy.max_body_size
    }

    pub fn gzip_enabled(&self) -> bool {
        self.config.proxy.gzip
    }

    /// Headers added to every response (configured `proxy.header` directives plus the signature
    /// header when enabled) — also spliced into proxied/streamed responses, which never pass
    /// through `immediate`/`error_response`.
    pub fn extra_response_headers(&self) -> &[(String, String)] {
        &self.extra_response_headers
    }

    /// Distinct literal (non-templated) upstream hosts across all proxy rules, for connection
    /// pool pre-warming. Destinations containing an unresolved capture (`$1`, `$host`) can't be
    /// dialed ahead of time and are skipped.
    pub fn static_upstream_hosts(&self) -> Vec<String> {
        let mut hosts = Vec::new();
        for rule in self.table.mappers() {
            if rule.rule.match_type != MatchType::Proxy || rule.rule.dst.contains('$') {
                continue;
            }
            let (addr, _) = split_destination(&rule.rule.dst);
            if !addr.is_empty() && !hosts.contains(&addr) {
                hosts.push(addr);
            }
        }
        hosts
    }

    /// Hot path: resolve one request into a `Decision`. Zero-copy over the caller's `&str`
    /// header slice; no `.await` anywhere in this call, so the borrow the caller takes to call
    /// it can be released before any actual I/O happens.
    #[inline]
    pub fn handle_request(
        &mut self,
        method: &str,
        path: &str,
        host: &str,
        headers: &[(&str, &str)],
        client_ip: IpAddr,
    ) -> Decision {
        if method == "GET" && path == "/ping" {
            return self.immediate(200, Vec::new(), b"pong".to_vec());
        }
        if method == "GET" && path == "/health" {
            let (status, body) = health_endpoint::render(&self.table);
            return self.immediate(status, vec![("content-type".to_string(), "application/json".to_string())], body);
        }

        const MAX_URI_LEN: usize = 8192;
        if path.len() > MAX_URI_LEN {
            return self.error_response(414);
        }
        if self.config.proxy.max_body_size > 0 {
            if let Some(len) = find_header(headers, "content-length").and_then(|v| v.parse::<u64>().ok()) {
                if len > self.config.proxy.max_body_size {
                    return self.error_response(413);
                }
            }
        }

        let route = match dispatch::select_route(&self.table, &self.lb, host, path) {
            Some(route) => route,
            None => return self.error_response(502),
        };

        let rule = &route.rule.rule;

        if !rule.auth_users.is_empty() {
            let auth_header = find_header(headers, "authorization");
            if !basic_auth::verify(&rule.auth_users, auth_header) {
                return self.error_response(401);
            }
        }
        if !rule.only_from_ips.is_empty() && !ip_allow::is_allowed(&rule.only_from_ips, client_ip) {
            return self.error_response(403);
        }

        let dst_for_key = if rule.match_type == MatchType::Proxy { Some(route.destination.as_str()) } else { None };
        let key = limiter_key(client_ip, dst_for_key);
        if !self.limiter.allow_user(&key) {
            return self.error_response(429);
        }
        if !self.limiter.allow_system() {
            return self.error_response(429);
        }

        // Redirect handling belongs to the terminal dispatcher (after auth/IP/limiter), so a
        // redirect rule still enforces auth_users/only_from_ips/rate limits like any other rule.
        if rule.redirect_type != reproxy_core::rule::RedirectType::None {
            let status = rule.redirect_type.status_code().unwrap_or(302);
            return Decision::Redirect { status, location: route.destination };
        }

        let rule_label = rule.src_pattern.clone();
        match rule.match_type {
            MatchType::Proxy => {
                let (upstream_addr, upstream_path) = split_destination(&route.destination);
                let keep_host = matches!(rule.keep_host, reproxy_core::rule::KeepHost::Yes);
                Decision::Proxy { upstream_addr, upstream_path, keep_host, rule_label }
            }
            MatchType::Static => Decision::StaticFile {
                fs_root: route.destination.clone(),
                web_root: rule.assets_web_root.clone().unwrap_or_default(),
                spa: rule.assets_spa,
                rule_label,
            },
        }
    }

    fn error_response(&self, status: u16) -> Decision {
        let (body, mut headers) = self.error_reporter.render(status);
        headers.extend(self.extra_response_headers.clone());
        Decision::Immediate { status, headers, body }
    }

    fn immediate(&self, status: u16, mut headers: Vec<(String, String)>, body: Vec<u8>) -> Decision {
        headers.extend(self.extra_response_headers.clone());
        Decision::Immediate { status, headers, body }
    }

    /// Apply gzip to an already-built `Immediate`/static response body, appending
    /// `content-encoding` when compression was actually used.
    pub fn compress_if_accepted(&self, client_headers: &[(&str, &str)], status: u16, mut headers: Vec<(String, String)>, body: Vec<u8>) -> (u16, Vec<(String, String)>, Vec<u8>) {
        if !self.gzip_enabled() || !gzip::client_accepts_gzip(client_headers) {
            return (status, headers, body);
        }
        let (compressed, used) = gzip::maybe_compress(&body, true);
        if used {
            headers.push(("content-encoding".to_string(), "gzip".to_string()));
            (status, headers, compressed)
        } else {
            (status, headers, body)
        }
    }
}

fn find_header<'a>(headers: &[(&'a str, &'a str)], name: &str) -> Option<&'a str> {
    headers.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| *v)
}

// ── Connection pool ───────────────────────────────────────────

/// Thread-local upstream connection pool. Avoids a fresh TCP handshake on every request.
/// Pre-warmed at startup: each worker opens N connections to every literal known upstream
/// before accepting any traffic.
pub struct ConnPool {
    pools: HashMap<String, VecDeque<TcpStream>>,
    max_idle: usize,
}

impl ConnPool {
    pub fn new(max_idle_per_host: usize) -> Self {
        Self { pools: HashMap::with_capacity(16), max_idle: max_idle_per_host }
    }

    #[inline]
    pub fn take(&mut self, addr: &str) -> Option<TcpStream> {
        self.pools.get_mut(addr).and_then(|q| q.pop_front())
    }

    #[inline]
    pub fn put(&mut self, addr: String, stream: TcpStream) {
        let queue = self.pools.entry(addr).or_insert_with(|| VecDeque::with_capacity(self.max_idle));
        if queue.len() < self.max_idle {
            queue.push_back(stream);
        }
    }

    /// Pre-warm connection pool: open `count` connections to each addr.
    pub async fn warm(&mut self, addrs: &[String], count: usize) {
        for addr in addrs {
            let target = count.min(self.max_idle);
            let queue = self.pools.entry(addr.clone()).or_insert_with(|| VecDeque::with_capacity(target));
            for _ in 0..target {
                match TcpStream::connect(addr.as_str()).await {
                    Ok(stream) => {
                        let _ = stream.set_nodelay(true);
                        queue.push_back(stream);
                    }
                    Err(e) => {
                        tracing::warn!(addr = %addr, error = %e, "pool pre-warm connect failed");
                        break;
                    }
                }
            }
            if !queue.is_empty() {
                tracing::info!(addr = %addr, conns = queue.len(), "pool pre-warmed");
            }
        }
    }
}

// ── Response building helpers ─────────────────────────────────

/// Build an HTTP response into a buffer (no `format!` overhead on the hot path).
pub fn build_response(buf: &mut Vec<u8>, status: u16, headers: &[(String, String)], body: &[u8]) {
    buf.clear();
    buf.extend_from_slice(b"HTTP/1.1 ");
    let mut itoa_buf = itoa::Buffer::new();
    buf.extend_from_slice(itoa_buf.format(status).as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(status_text(status).as_bytes());
    buf.extend_from_slice(b"\r\ncontent-length: ");
    buf.extend_from_slice(itoa_buf.format(body.len()).as_bytes());
    buf.extend_from_slice(b"\r\nconnection: keep-alive\r\n");
    for (k, v) in headers {
        buf.extend_from_slice(k.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(v.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(body);
}

/// Build an upstream HTTP request into a buffer, zero-copy from `&str` refs. Hop-by-hop headers
/// are always stripped; `host_override`, when set, additionally strips any client `Host` header
/// and substitutes this one (the `keep_host = false` default: talk to upstream as itself).
pub fn build_upstream_request(
    buf: &mut Vec<u8>,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
    body: &[u8],
    host_override: Option<&str>,
) {
    buf.clear();
    buf.extend_from_slice(method.as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(path.as_bytes());
    buf.extend_from_slice(b" HTTP/1.1\r\n");
    if let Some(host) = host_override {
        buf.extend_from_slice(b"host: ");
        buf.extend_from_slice(host.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("connection")
            || name.eq_ignore_ascii_case("keep-alive")
            || name.eq_ignore_ascii_case("transfer-encoding")
            || name.eq_ignore_ascii_case("upgrade")
            || (host_override.is_some() && name.eq_ignore_ascii_case("host"))
        {
            continue;
        }
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"connection: keep-alive\r\n");
    if !body.is_empty() {
        buf.extend_from_slice(b"content-length: ");
        let mut itoa_buf = itoa::Buffer::new();
        buf.extend_from_slice(itoa_buf.format(body.len()).as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"\r\n");
    if !body.is_empty() {
        buf.extend_from_slice(body);
    }
}

/// Insert additional response headers into an already-parsed upstream response, just before the
/// header block's terminating blank line. `hdr_len` is httparse's `Status::Complete` offset
/// (the index where the body starts), so `chunk[hdr_len-2..hdr_len]` is always the blank line's
/// final `\r\n` for any well-formed response.
pub fn inject_response_headers(chunk: &[u8], hdr_len: usize, extra: &[(String, String)]) -> Vec<u8> {
    if extra.is_empty() {
        return chunk.to_vec();
    }
    let insert_at = hdr_len.saturating_sub(2);
    let mut out = Vec::with_capacity(chunk.len() + extra.len() * 32);
    out.extend_from_slice(&chunk[..insert_at]);
    for (k, v) in extra {
        out.extend_from_slice(k.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(v.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(&chunk[insert_at..]);
    out
}

pub fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        417 => "Expectation Failed",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reproxy_core::config::ReproxyConfig;
    use reproxy_core::rule::{AuthUser, KeepHost, ProviderId, RedirectType, Rule};
    use std::sync::atomic::AtomicBool;

    fn rule(src: &str, dst: &str, match_type: MatchType) -> Rule {
        Rule {
            server: "*".into(),
            src_pattern: src.into(),
            dst: dst.into(),
            provider_id: ProviderId::Static,
            ping_url: None,
            match_type,
            redirect_type: RedirectType::None,
            keep_host: KeepHost::Unset,
            only_from_ips: vec![],
            auth_users: Vec::<AuthUser>::new(),
            assets_web_root: None,
            assets_location: None,
            assets_spa: false,
            alive: Arc::new(AtomicBool::new(true)),
        }
    }

    fn worker(rules: Vec<Rule>) -> ProxyWorker {
        let table = Arc::new(ArcSwap::from_pointee(RuleTable::build(rules)));
        ProxyWorker::new(table, Arc::new(ReproxyConfig::default()))
    }

    #[test]
    fn ping_short_circuits_before_any_match_resolution() {
        let mut w = worker(vec![]);
        let d = w.handle_request("GET", "/ping", "example.com", &[], "127.0.0.1".parse().unwrap());
        match d {
            Decision::Immediate { status, body, .. } => {
                assert_eq!(status, 200);
                assert_eq!(body, b"pong");
            }
            _ => panic!("expected immediate pong response"),
        }
    }

    #[test]
    fn no_match_yields_502() {
        let mut w = worker(vec![]);
        let d = w.handle_request("GET", "/nope", "example.com", &[], "127.0.0.1".parse().unwrap());
        assert_eq!(d.status(), 502);
    }

    #[test]
    fn proxy_match_splits_destination_into_addr_and_path() {
        let mut w = worker(vec![rule("^/api/(.*)", "http://U1/blah1/$1", MatchType::Proxy)]);
        let d = w.handle_request("GET", "/api/1234", "example.com", &[], "127.0.0.1".parse().unwrap());
        match d {
            Decision::Proxy { upstream_addr, upstream_path, .. } => {
                assert_eq!(upstream_addr, "U1");
                assert_eq!(upstream_path, "/blah1/1234");
            }
            other => panic!("expected a proxy decision, got {other:?}"),
        }
    }

    #[test]
    fn redirect_rule_short_circuits_to_redirect_decision() {
        let mut r = rule("^/old$", "@301 https://new.example.com/", MatchType::Proxy);
        let (kind, dest) = Rule::extract_redirect(&r.dst);
        r.redirect_type = kind;
        r.dst = dest.to_string();
        let mut w = worker(vec![r]);
        let d = w.handle_request("GET", "/old", "example.com", &[], "127.0.0.1".parse().unwrap());
        match d {
            Decision::Redirect { status, location } => {
                assert_eq!(status, 301);
                assert_eq!(location, "https://new.example.com/");
            }
            other => panic!("expected a redirect decision, got {other:?}"),
        }
    }

    #[test]
    fn ip_not_allowed_yields_403() {
        let mut r = rule("^/secure$", "http://U1/x", MatchType::Proxy);
        r.only_from_ips = vec!["10.0.0.0/8".to_string()];
        let mut w = worker(vec![r]);
        let d = w.handle_request("GET", "/secure", "example.com", &[], "203.0.113.9".parse().unwrap());
        assert_eq!(d.status(), 403);
    }

    #[test]
    fn redirect_rule_still_enforces_ip_allowlist() {
        let mut r = rule("^/old$", "@301 https://new.example.com/", MatchType::Proxy);
        let (kind, dest) = Rule::extract_redirect(&r.dst);
        r.redirect_type = kind;
        r.dst = dest.to_string();
        r.only_from_ips = vec!["10.0.0.0/8".to_string()];
        let mut w = worker(vec![r]);
        let d = w.handle_request("GET", "/old", "example.com", &[], "203.0.113.9".parse().unwrap());
        assert_eq!(d.status(), 403);
    }

    #[test]
    fn oversized_uri_yields_414() {
        let mut w = worker(vec![]);
        let huge_path = format!("/{}", "a".repeat(9000));
        let d = w.handle_request("GET", &huge_path, "example.com", &[], "127.0.0.1".parse().unwrap());
        assert_eq!(d.status(), 414);
    }

    #[test]
    fn build_response_writes_status_line_and_headers() {
        let mut buf = Vec::new();
        build_response(&mut buf, 200, &[("x-test".to_string(), "1".to_string())], b"hi");
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("x-test: 1\r\n"));
        assert!(text.ends_with("hi"));
    }

    #[test]
    fn build_upstream_request_strips_hop_by_hop_headers() {
        let mut buf = Vec::new();
        build_upstream_request(&mut buf, "GET", "/x", &[("Connection", "keep-alive"), ("X-Keep", "1")], b"", None);
        let text = String::from_utf8(buf).unwrap();
        assert!(!text.contains("Connection: keep-alive\r\nConnection"));
        assert!(text.contains("X-Keep: 1\r\n"));
    }

    #[test]
    fn build_upstream_request_host_override_replaces_client_host() {
        let mut buf = Vec::new();
        build_upstream_request(&mut buf, "GET", "/x", &[("Host", "client.example.com")], b"", Some("U1:8080"));
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("host: U1:8080\r\n"));
        assert!(!text.contains("client.example.com"));
    }

    #[test]
    fn status_text_covers_added_codes() {
        assert_eq!(status_text(413), "Payload Too Large");
        assert_eq!(status_text(414), "URI Too Long");
        assert_eq!(status_text(417), "Expectation Failed");
        assert_eq!(status_text(999), "Unknown");
    }

    #[test]
    fn inject_response_headers_adds_before_the_blank_line() {
        let resp = b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nhi";
        let hdr_len = resp.len() - 2;
        let out = inject_response_headers(resp, hdr_len, &[("x-extra".to_string(), "yes".to_string())]);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("x-extra: yes\r\n"));
        assert!(text.ends_with("hi"));
    }
}
