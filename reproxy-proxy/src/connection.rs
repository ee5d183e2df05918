use crate::proxy::{
    build_response, build_upstream_request, inject_response_headers, ConnPool, Decision, ProxyWorker,
};
use monoio::io::{AsyncReadRent, AsyncWriteRentExt};
use monoio::net::TcpStream;
use reproxy_observability::access_log::AccessLogEntry;
use reproxy_observability::metrics::Metrics;
use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Instant;

const RESP_502: &[u8] =
    b"HTTP/1.1 502 Bad Gateway\r\ncontent-length: 13\r\nconnection: keep-alive\r\n\r\nServer error\n";

/// Resolve an `addr` string (e.g. `"upstream:3001"`) to a list of `SocketAddr`s, IPv4 candidates
/// first. The blocking `ToSocketAddrs` call only runs when the connection pool is empty for this
/// address (startup, first request, or after an upstream failure) — never on the steady-state
/// hot path, where a pooled connection is already open.
fn resolve_addrs(addr: &str) -> Vec<SocketAddr> {
    if let Ok(sa) = addr.parse::<SocketAddr>() {
        return vec![sa];
    }
    use std::net::ToSocketAddrs;
    let all: Vec<SocketAddr> = match addr.to_socket_addrs() {
        Ok(iter) => iter.collect(),
        Err(_) => return vec![],
    };
    let mut v4: Vec<SocketAddr> = all.iter().copied().filter(|a| a.is_ipv4()).collect();
    let v6: Vec<SocketAddr> = all.iter().copied().filter(|a| a.is_ipv6()).collect();
    v4.extend(v6);
    v4
}

async fn new_upstream_conn(addr: &str) -> Option<TcpStream> {
    let candidates = resolve_addrs(addr);
    if candidates.is_empty() {
        tracing::warn!(addr = %addr, "upstream address resolve failed");
        return None;
    }
    for sa in &candidates {
        match TcpStream::connect(*sa).await {
            Ok(s) => {
                let _ = s.set_nodelay(true);
                return Some(s);
            }
            Err(e) => {
                tracing::debug!(addr = %addr, resolved = %sa, error = %e, "upstream candidate failed, trying next");
            }
        }
    }
    tracing::warn!(addr = %addr, tried = candidates.len(), "upstream connect failed on all candidates");
    None
}

/// Handle a single client connection (HTTP/1.1 with keepalive).
///
/// Shares `ProxyWorker` and `ConnPool` with every other connection on this thread via
/// `Rc<RefCell<_>>` — zero atomic overhead on the hot path. All buffers are allocated once and
/// reused across keepalive requests; header parsing is zero-copy (`httparse` `&str` refs into
/// the read buffer).
pub async fn handle_connection(
    mut client: TcpStream,
    peer_addr: SocketAddr,
    proxy: Rc<RefCell<ProxyWorker>>,
    conn_pool: Rc<RefCell<ConnPool>>,
    metrics: std::sync::Arc<Metrics>,
) -> anyhow::Result<()> {
    let client_ip = peer_addr.ip();

    let mut read_buf = vec![0u8; 8192];
    let mut upstream_req_buf = Vec::with_capacity(2048);
    let mut resp_buf = Vec::with_capacity(4096);
    let mut upstream_buf = vec![0u8; 65536];

    loop {
        let (res, returned_buf) = client.read(read_buf).await;
        read_buf = returned_buf;
        let n = match res {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) => return Err(e.into()),
        };

        let mut headers_raw = [httparse::EMPTY_HEADER; 64];
        let mut req = httparse::Request::new(&mut headers_raw);

        match req.parse(&read_buf[..n]) {
            Ok(httparse::Status::Complete(body_offset)) => {
                let method = req.method.unwrap_or("GET").to_string();
                let path = req.path.unwrap_or("/").to_string();
                let start = Instant::now();

                let mut headers: Vec<(&str, &str)> = Vec::with_capacity(16);
                let mut host: &str = "";
                let mut keep_alive = true;

                for h in req.headers.iter() {
                    if h.name.is_empty() {
                        break;
                    }
                    let val = std::str::from_utf8(h.value).unwrap_or("");
                    headers.push((h.name, val));
                    if h.name.eq_ignore_ascii_case("host") {
                        host = val;
                    } else if h.name.eq_ignore_ascii_case("connection") {
                        keep_alive = !val.eq_ignore_ascii_case("close");
                    }
                }

                // Recovery: a panic anywhere in match resolution or a downstream middleware
                // step must not take the whole worker thread down with it — every other
                // in-flight connection on this monoio thread shares the same event loop.
                // `handle_request` has no `.await` in it, so the borrow is never held across
                // an unwind-unsafe suspension point.
                let decision = {
                    let proxy = std::panic::AssertUnwindSafe(&proxy);
                    let method = &method;
                    let path = &path;
                    let headers = &headers;
                    std::panic::catch_unwind(move || {
                        let mut pw = proxy.0.borrow_mut();
                        pw.handle_request(method, path, host, headers, client_ip)
                    })
                };
                let decision = match decision {
                    Ok(decision) => decision,
                    Err(_) => {
                        tracing::error!(method = %method, path = %path, "panic recovered while resolving request");
                        crate::proxy::Decision::Immediate {
                            status: 500,
                            headers: Vec::new(),
                            body: b"Server error\n".to_vec(),
                        }
                    }
                };
                // Borrow dropped here — safe to do async I/O below.

                let (rule_label, final_status, upstream_addr_for_log) =
                    dispatch_decision(&mut client, &mut resp_buf, &mut upstream_req_buf, &mut upstream_buf, &proxy, &conn_pool, decision, &method, &path, &headers, body_offset, n, &read_buf, keep_alive).await?;

                let elapsed = start.elapsed();
                metrics.record_request(&rule_label, &method, final_status, elapsed.as_secs_f64());
                if let Some(ref addr) = upstream_addr_for_log {
                    metrics.record_upstream_latency(addr, elapsed.as_secs_f64());
                }
                let entry = AccessLogEntry {
                    timestamp: chrono::Utc::now().to_rfc3339(),
                    rule_id: rule_label,
                    client_ip: client_ip.to_string(),
                    method: method.clone(),
                    uri: path.clone(),
                    response_status: final_status,
                    latency_ms: elapsed.as_secs_f64() * 1000.0,
                    upstream_addr: upstream_addr_for_log,
                };
                tracing::info!(target: "access_log", "{}", entry.to_combined_line());
                if path != "/ping" {
                    tracing::debug!(method = %method, path = %path, status = final_status, latency_ms = entry.latency_ms, "request handled");
                }

                if !keep_alive {
                    return Ok(());
                }
            }
            Ok(httparse::Status::Partial) => {
                let resp = b"HTTP/1.1 400 Bad Request\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";
                let (res, _) = client.write_all(resp.to_vec()).await;
                res?;
                return Ok(());
            }
            Err(e) => {
                tracing::debug!(error = %e, "HTTP parse error");
                let resp = b"HTTP/1.1 400 Bad Request\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";
                let (res, _) = client.write_all(resp.to_vec()).await;
                res?;
                return Ok(());
            }
        }
    }
}

/// Execute a resolved `Decision`: the actual proxied round trip, a filesystem read, or writing
/// an already-built response. Returns `(rule_label, status, upstream_addr)` for access-log and
/// metrics recording back in the caller.
#[allow(clippy::too_many_arguments)]
async fn dispatch_decision(
    client: &mut TcpStream,
    resp_buf: &mut Vec<u8>,
    upstream_req_buf: &mut Vec<u8>,
    upstream_buf: &mut Vec<u8>,
    proxy: &Rc<RefCell<ProxyWorker>>,
    conn_pool: &Rc<RefCell<ConnPool>>,
    decision: Decision,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
    body_offset: usize,
    n: usize,
    read_buf: &[u8],
    keep_alive: bool,
) -> anyhow::Result<(String, u16, Option<String>)> {
    match decision {
        Decision::Immediate { status, headers: resp_headers, body } => {
            let (status, resp_headers, body) = proxy.borrow().compress_if_accepted(headers, status, resp_headers, body);
            build_response(resp_buf, status, &resp_headers, &body);
            let data = resp_buf.clone();
            let (res, _) = client.write_all(data).await;
            res?;
            Ok(("-".to_string(), status, None))
        }

        Decision::Redirect { status, location } => {
            let resp_headers = vec![("location".to_string(), location)];
            build_response(resp_buf, status, &resp_headers, b"");
            let data = resp_buf.clone();
            let (res, _) = client.write_all(data).await;
            res?;
            Ok(("-".to_string(), status, None))
        }

        Decision::StaticFile { fs_root, web_root, spa, rule_label } => {
            let resolved = crate::static_files::resolve(&fs_root, &web_root, path, spa);
            let body = std::fs::read(&resolved.disk_path).unwrap_or_default();
            let mut resp_headers = vec![crate::static_files::cache_control_header()];
            if let Some(ct) = crate::static_files::guess_content_type(&resolved.disk_path) {
                resp_headers.push(("content-type".to_string(), ct.to_string()));
            }
            let status = if resolved.status == 200 && body.is_empty() && !resolved.disk_path.exists() {
                404
            } else {
                resolved.status
            };
            let (status, resp_headers, body) =
                proxy.borrow().compress_if_accepted(headers, status, resp_headers, body);
            build_response(resp_buf, status, &resp_headers, &body);
            let data = resp_buf.clone();
            let (res, _) = client.write_all(data).await;
            res?;
            Ok((rule_label, status, None))
        }

        Decision::Proxy { ref upstream_addr, ref upstream_path, keep_host, ref rule_label } => {
            let host_override = if keep_host { None } else { Some(upstream_addr.as_str()) };
            let drop_list = proxy.borrow().drop_request_headers().to_vec();
            let filtered_headers: Vec<(&str, &str)> =
                headers.iter().copied().filter(|(k, _)| !drop_list.iter().any(|d| k.eq_ignore_ascii_case(d))).collect();

            let body_data = &read_buf[body_offset..n];
            build_upstream_request(upstream_req_buf, method, upstream_path, &filtered_headers, body_data, host_override);

            let maybe_conn = conn_pool.borrow_mut().take(upstream_addr);
            let mut upstream = match maybe_conn {
                Some(s) => s,
                None => match new_upstream_conn(upstream_addr).await {
                    Some(s) => s,
                    None => {
                        let (res, _) = client.write_all(RESP_502.to_vec()).await;
                        res?;
                        return Ok((rule_label.clone(), 502, Some(upstream_addr.clone())));
                    }
                },
            };

            let req_data = upstream_req_buf.clone();
            let (res, _) = upstream.write_all(req_data).await;
            if res.is_err() {
                match new_upstream_conn(upstream_addr).await {
                    Some(mut new_upstream) => {
                        let req_data = upstream_req_buf.clone();
                        let (res, _) = new_upstream.write_all(req_data).await;
                        if res.is_err() {
                            tracing::warn!(addr = %upstream_addr, "upstream write failed after reconnect");
                            let (res, _) = client.write_all(RESP_502.to_vec()).await;
                            res?;
                            return Ok((rule_label.clone(), 502, Some(upstream_addr.clone())));
                        }
                        upstream = new_upstream;
                    }
                    None => {
                        let (res, _) = client.write_all(RESP_502.to_vec()).await;
                        res?;
                        return Ok((rule_label.clone(), 502, Some(upstream_addr.clone())));
                    }
                }
            }

            let buf = std::mem::take(upstream_buf);
            let (res, returned_ubuf) = upstream.read(buf).await;
            *upstream_buf = returned_ubuf;
            let resp_n = match res {
                Ok(0) => {
                    tracing::warn!(addr = %upstream_addr, "upstream closed connection without response");
                    let (res, _) = client.write_all(RESP_502.to_vec()).await;
                    res?;
                    return Ok((rule_label.clone(), 502, Some(upstream_addr.clone())));
                }
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!(addr = %upstream_addr, error = %e, "upstream read error");
                    let (res, _) = client.write_all(RESP_502.to_vec()).await;
                    res?;
                    return Ok((rule_label.clone(), 502, Some(upstream_addr.clone())));
                }
            };

            let mut resp_headers_raw = [httparse::EMPTY_HEADER; 64];
            let mut resp = httparse::Response::new(&mut resp_headers_raw);
            let mut content_length: Option<usize> = None;
            let mut upstream_keepalive = true;
            let mut response_status: u16 = 502;

            let extra_headers = proxy.borrow().extra_response_headers().to_vec();

            if let Ok(httparse::Status::Complete(hdr_len)) = resp.parse(&upstream_buf[..resp_n]) {
                response_status = resp.code.unwrap_or(502);
                for h in resp.headers.iter() {
                    if h.name.is_empty() {
                        break;
                    }
                    if h.name.eq_ignore_ascii_case("content-length") {
                        content_length = std::str::from_utf8(h.value).ok().and_then(|s| s.parse().ok());
                    }
                    if h.name.eq_ignore_ascii_case("connection") {
                        let v = std::str::from_utf8(h.value).unwrap_or("");
                        upstream_keepalive = !v.eq_ignore_ascii_case("close");
                    }
                }

                let first_chunk = inject_response_headers(&upstream_buf[..resp_n], hdr_len, &extra_headers);
                let (res, _) = client.write_all(first_chunk).await;
                res?;

                if let Some(cl) = content_length {
                    let body_in_first = resp_n - hdr_len;
                    let mut remaining = cl.saturating_sub(body_in_first);

                    while remaining > 0 {
                        let chunk_size = remaining.min(65536);
                        let chunk_buf = vec![0u8; chunk_size];
                        let (res, returned_chunk) = upstream.read(chunk_buf).await;
                        let cn = match res {
                            Ok(0) => break,
                            Ok(n) => n,
                            Err(_) => break,
                        };
                        remaining -= cn;
                        let data = returned_chunk[..cn].to_vec();
                        let (res, _) = client.write_all(data).await;
                        if res.is_err() {
                            return Ok((rule_label.clone(), response_status, Some(upstream_addr.clone())));
                        }
                    }
                }
            } else {
                let data = upstream_buf[..resp_n].to_vec();
                let (res, _) = client.write_all(data).await;
                res?;
                upstream_keepalive = false;
            }

            if upstream_keepalive && keep_alive {
                conn_pool.borrow_mut().put(upstream_addr.clone(), upstream);
            }

            Ok((rule_label.clone(), response_status, Some(upstream_addr.clone())))
        }
    }
}
