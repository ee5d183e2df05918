use crate::proxy::{build_response, build_upstream_request, inject_response_headers, Decision, ProxyWorker};
use reproxy_observability::access_log::AccessLogEntry;
use reproxy_observability::metrics::Metrics;
use reproxy_tls::TlsManager;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

/// Plaintext listener for `static`/`auto` TLS modes: answers ACME HTTP-01 challenge requests
/// when one is pending and otherwise 307-redirects to the HTTPS equivalent of the request.
pub async fn run_redirect_listener(addr: SocketAddr, tls: Arc<TlsManager>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "http redirect listener started");
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "redirect listener accept error");
                continue;
            }
        };
        let tls = Arc::clone(&tls);
        tokio::spawn(async move {
            if let Err(e) = handle_redirect_connection(stream, peer, tls).await {
                tracing::debug!(error = %e, peer = %peer, "redirect connection closed");
            }
        });
    }
}

async fn handle_redirect_connection(mut stream: TcpStream, _peer: SocketAddr, tls: Arc<TlsManager>) -> anyhow::Result<()> {
    let _ = stream.set_nodelay(true);
    let mut buf = vec![0u8; 8192];
    let n = stream.read(&mut buf).await?;
    if n == 0 {
        return Ok(());
    }

    let mut headers_raw = [httparse::EMPTY_HEADER; 32];
    let mut req = httparse::Request::new(&mut headers_raw);
    let (path, host) = match req.parse(&buf[..n]) {
        Ok(httparse::Status::Complete(_)) => {
            let path = req.path.unwrap_or("/").to_string();
            let host = req
                .headers
                .iter()
                .find(|h| h.name.eq_ignore_ascii_case("host"))
                .and_then(|h| std::str::from_utf8(h.value).ok())
                .unwrap_or("")
                .to_string();
            (path, host)
        }
        _ => ("/".to_string(), String::new()),
    };

    if let Some(body) = tls.http01_response(&path).await {
        let resp_headers = vec![("content-type".to_string(), "text/plain".to_string())];
        let mut resp = Vec::new();
        build_response(&mut resp, 200, &resp_headers, body.as_bytes());
        stream.write_all(&resp).await?;
        return Ok(());
    }

    let host_only = host.split(':').next().unwrap_or(&host);
    let location = format!("https://{host_only}:443{path}");
    let resp_headers = vec![("location".to_string(), location)];
    let mut resp = Vec::new();
    build_response(&mut resp, 307, &resp_headers, b"");
    stream.write_all(&resp).await?;
    Ok(())
}

/// TLS-terminating listener for `static`/`auto` modes.
///
/// Runs the same routing decision as the monoio data plane (`ProxyWorker::handle_request`), but
/// over tokio I/O: HTTPS traffic is expected to be a much smaller share of total load than the
/// plaintext path, so this trades the monoio worker's per-thread connection pool for a plain
/// per-request upstream connection rather than duplicating that machinery on a second runtime.
pub async fn run_tls_listener(
    addr: SocketAddr,
    tls: Arc<TlsManager>,
    proxy: Arc<Mutex<ProxyWorker>>,
    metrics: Arc<Metrics>,
) -> anyhow::Result<()> {
    let server_config = reproxy_tls::tls_config::build_server_config(tls)?;
    let acceptor = TlsAcceptor::from(Arc::new(server_config));
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "https listener started");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "https listener accept error");
                continue;
            }
        };
        let acceptor = acceptor.clone();
        let proxy = Arc::clone(&proxy);
        let metrics = Arc::clone(&metrics);
        tokio::spawn(async move {
            let _ = stream.set_nodelay(true);
            let tls_stream = match acceptor.accept(stream).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::debug!(error = %e, peer = %peer, "tls handshake failed");
                    return;
                }
            };
            if let Err(e) = handle_tls_connection(tls_stream, peer, proxy, metrics).await {
                tracing::debug!(error = %e, "https connection closed");
            }
        });
    }
}

async fn handle_tls_connection(
    mut stream: tokio_rustls::server::TlsStream<TcpStream>,
    peer: SocketAddr,
    proxy: Arc<Mutex<ProxyWorker>>,
    metrics: Arc<Metrics>,
) -> anyhow::Result<()> {
    let client_ip = peer.ip();
    let mut read_buf = vec![0u8; 8192];

    loop {
        let n = stream.read(&mut read_buf).await?;
        if n == 0 {
            return Ok(());
        }

        let mut headers_raw = [httparse::EMPTY_HEADER; 64];
        let mut req = httparse::Request::new(&mut headers_raw);
        let body_offset = match req.parse(&read_buf[..n]) {
            Ok(httparse::Status::Complete(off)) => off,
            _ => {
                let resp = b"HTTP/1.1 400 Bad Request\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";
                stream.write_all(resp).await?;
                return Ok(());
            }
        };

        let method = req.method.unwrap_or("GET").to_string();
        let path = req.path.unwrap_or("/").to_string();
        let start = std::time::Instant::now();

        let mut headers: Vec<(&str, &str)> = Vec::with_capacity(16);
        let mut host = "";
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

        let decision = {
            let mut pw = proxy.lock().expect("proxy worker lock poisoned");
            pw.handle_request(&method, &path, host, &headers, client_ip)
        };

        let (rule_label, status, upstream_addr_for_log) =
            dispatch_tls_decision(&mut stream, &proxy, decision, &method, &path, &headers, body_offset, n, &read_buf).await?;

        let elapsed = start.elapsed();
        metrics.record_request(&rule_label, &method, status, elapsed.as_secs_f64());
        if let Some(ref addr) = upstream_addr_for_log {
            metrics.record_upstream_latency(addr, elapsed.as_secs_f64());
        }
        let entry = AccessLogEntry {
            timestamp: chrono::Utc::now().to_rfc3339(),
            rule_id: rule_label,
            client_ip: client_ip.to_string(),
            method: method.clone(),
            uri: path.clone(),
            response_status: status,
            latency_ms: elapsed.as_secs_f64() * 1000.0,
            upstream_addr: upstream_addr_for_log,
        };
        tracing::info!(target: "access_log", "{}", entry.to_combined_line());

        if !keep_alive {
            return Ok(());
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn dispatch_tls_decision(
    stream: &mut tokio_rustls::server::TlsStream<TcpStream>,
    proxy: &Arc<Mutex<ProxyWorker>>,
    decision: Decision,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
    body_offset: usize,
    n: usize,
    read_buf: &[u8],
) -> anyhow::Result<(String, u16, Option<String>)> {
    match decision {
        Decision::Immediate { status, headers: resp_headers, body } => {
            let (status, resp_headers, body) = {
                let pw = proxy.lock().expect("proxy worker lock poisoned");
                pw.compress_if_accepted(headers, status, resp_headers, body)
            };
            let mut resp_buf = Vec::new();
            build_response(&mut resp_buf, status, &resp_headers, &body);
            stream.write_all(&resp_buf).await?;
            Ok(("-".to_string(), status, None))
        }

        Decision::Redirect { status, location } => {
            let resp_headers = vec![("location".to_string(), location)];
            let mut resp_buf = Vec::new();
            build_response(&mut resp_buf, status, &resp_headers, b"");
            stream.write_all(&resp_buf).await?;
            Ok(("-".to_string(), status, None))
        }

        Decision::StaticFile { fs_root, web_root, spa, rule_label } => {
            let resolved = crate::static_files::resolve(&fs_root, &web_root, path, spa);
            let body = std::fs::read(&resolved.disk_path).unwrap_or_default();
            let mut resp_headers = vec![crate::static_files::cache_control_header()];
            if let Some(ct) = crate::static_files::guess_content_type(&resolved.disk_path) {
                resp_headers.push(("content-type".to_string(), ct.to_string()));
            }
            let (status, resp_headers, body) = {
                let pw = proxy.lock().expect("proxy worker lock poisoned");
                pw.compress_if_accepted(headers, resolved.status, resp_headers, body)
            };
            let mut resp_buf = Vec::new();
            build_response(&mut resp_buf, status, &resp_headers, &body);
            stream.write_all(&resp_buf).await?;
            Ok((rule_label, status, None))
        }

        Decision::Proxy { upstream_addr, upstream_path, keep_host, rule_label } => {
            let host_override = if keep_host { None } else { Some(upstream_addr.as_str()) };
            let drop_list = {
                let pw = proxy.lock().expect("proxy worker lock poisoned");
                pw.drop_request_headers().to_vec()
            };
            let filtered_headers: Vec<(&str, &str)> =
                headers.iter().copied().filter(|(k, _)| !drop_list.iter().any(|d| k.eq_ignore_ascii_case(d))).collect();
            let body_data = &read_buf[body_offset..n];
            let mut upstream_req_buf = Vec::new();
            build_upstream_request(&mut upstream_req_buf, method, &upstream_path, &filtered_headers, body_data, host_override);

            let mut upstream = match TcpStream::connect(&upstream_addr).await {
                Ok(s) => {
                    let _ = s.set_nodelay(true);
                    s
                }
                Err(e) => {
                    tracing::warn!(addr = %upstream_addr, error = %e, "tls upstream connect failed");
                    let resp = b"HTTP/1.1 502 Bad Gateway\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";
                    stream.write_all(resp).await?;
                    return Ok((rule_label, 502, Some(upstream_addr)));
                }
            };

            if upstream.write_all(&upstream_req_buf).await.is_err() {
                let resp = b"HTTP/1.1 502 Bad Gateway\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";
                stream.write_all(resp).await?;
                return Ok((rule_label, 502, Some(upstream_addr)));
            }

            let mut upstream_buf = vec![0u8; 65536];
            let resp_n = match upstream.read(&mut upstream_buf).await {
                Ok(0) | Err(_) => {
                    let resp = b"HTTP/1.1 502 Bad Gateway\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";
                    stream.write_all(resp).await?;
                    return Ok((rule_label, 502, Some(upstream_addr)));
                }
                Ok(n) => n,
            };

            let extra_headers = {
                let pw = proxy.lock().expect("proxy worker lock poisoned");
                pw.extra_response_headers().to_vec()
            };

            let mut response_status: u16 = 502;
            let mut resp_headers_raw = [httparse::EMPTY_HEADER; 64];
            let mut resp = httparse::Response::new(&mut resp_headers_raw);

            if let Ok(httparse::Status::Complete(hdr_len)) = resp.parse(&upstream_buf[..resp_n]) {
                response_status = resp.code.unwrap_or(502);
                let mut content_length: Option<usize> = None;
                for h in resp.headers.iter() {
                    if h.name.is_empty() {
                        break;
                    }
                    if h.name.eq_ignore_ascii_case("content-length") {
                        content_length = std::str::from_utf8(h.value).ok().and_then(|s| s.parse().ok());
                    }
                }

                let first_chunk = inject_response_headers(&upstream_buf[..resp_n], hdr_len, &extra_headers);
                stream.write_all(&first_chunk).await?;

                if let Some(cl) = content_length {
                    let body_in_first = resp_n - hdr_len;
                    let mut remaining = cl.saturating_sub(body_in_first);
                    while remaining > 0 {
                        let chunk_size = remaining.min(65536);
                        let mut chunk_buf = vec![0u8; chunk_size];
                        let cn = match upstream.read(&mut chunk_buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => n,
                        };
                        remaining -= cn;
                        if stream.write_all(&chunk_buf[..cn]).await.is_err() {
                            break;
                        }
                    }
                }
            } else {
                stream.write_all(&upstream_buf[..resp_n]).await?;
            }

            Ok((rule_label, response_status, Some(upstream_addr)))
        }
    }
}
