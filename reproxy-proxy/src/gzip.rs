use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;

/// True if the client's `Accept-Encoding` header lists gzip.
pub fn client_accepts_gzip(headers: &[(&str, &str)]) -> bool {
    headers
        .iter()
        .any(|(k, v)| k.eq_ignore_ascii_case("accept-encoding") && v.to_ascii_lowercase().contains("gzip"))
}

/// Compress `body` with gzip when `enabled`. Falls back to the original bytes uncompressed if
/// encoding fails or doesn't actually shrink the body (not worth the extra round-trip to
/// decompress a handful of bytes). Returns the bytes to send and whether compression was used.
pub fn maybe_compress(body: &[u8], enabled: bool) -> (Vec<u8>, bool) {
    if !enabled || body.is_empty() {
        return (body.to_vec(), false);
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    if encoder.write_all(body).is_err() {
        return (body.to_vec(), false);
    }
    match encoder.finish() {
        Ok(compressed) if compressed.len() < body.len() => (compressed, true),
        _ => (body.to_vec(), false),
    }
}
