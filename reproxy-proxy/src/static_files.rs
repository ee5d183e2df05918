use std::path::{Path, PathBuf};

/// Cache-control applied to every static response. Assets are expected to be served under a
/// content-addressed or versioned path by the caller, so a short shared cache is safe without
/// per-file validation logic.
const STATIC_CACHE_CONTROL: &str = "public, max-age=300";

pub struct Resolved {
    pub disk_path: PathBuf,
    pub status: u16,
}

/// Resolve a request path under a rule's web root to a concrete filesystem path.
///
/// `norm` rules 404 when the file is missing; `spa` rules fall back to `index.html` under
/// `fs_root` so a client-side router can take over, matching the spec's distinction between the
/// two static-serving modes.
pub fn resolve(fs_root: &str, web_root: &str, request_path: &str, spa: bool) -> Resolved {
    let rel = request_path.strip_prefix(web_root).unwrap_or(request_path).trim_start_matches('/');
    let candidate = Path::new(fs_root).join(rel);
    if candidate.is_file() {
        return Resolved { disk_path: candidate, status: 200 };
    }
    if spa {
        return Resolved { disk_path: Path::new(fs_root).join("index.html"), status: 200 };
    }
    Resolved { disk_path: candidate, status: 404 }
}

pub fn cache_control_header() -> (String, String) {
    ("cache-control".to_string(), STATIC_CACHE_CONTROL.to_string())
}

/// Best-effort content-type from a file extension; `None` leaves the caller to omit the header.
pub fn guess_content_type(path: &Path) -> Option<&'static str> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") => Some("text/html; charset=utf-8"),
        Some("css") => Some("text/css; charset=utf-8"),
        Some("js") => Some("application/javascript; charset=utf-8"),
        Some("json") => Some("application/json"),
        Some("svg") => Some("image/svg+xml"),
        Some("png") => Some("image/png"),
        Some("jpg") | Some("jpeg") => Some("image/jpeg"),
        Some("ico") => Some("image/x-icon"),
        Some("wasm") => Some("application/wasm"),
        _ => None,
    }
}
