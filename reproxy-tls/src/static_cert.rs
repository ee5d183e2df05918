use chrono::{DateTime, Utc};
use reproxy_core::Certificate;
use std::path::Path;

/// Load a certificate/key pair from disk for `ssl.type: static` mode. The pair is read once at
/// startup and never reloaded — static mode is immutable for the process lifetime.
pub fn load(cert_path: &Path, key_path: &Path) -> anyhow::Result<Certificate> {
    let cert_pem = std::fs::read_to_string(cert_path)
        .map_err(|e| anyhow::anyhow!("reading cert {}: {e}", cert_path.display()))?;
    let key_pem = std::fs::read_to_string(key_path)
        .map_err(|e| anyhow::anyhow!("reading key {}: {e}", key_path.display()))?;

    let not_after = leaf_not_after(&cert_pem)?;
    let domains = leaf_subject_names(&cert_pem).unwrap_or_default();

    Ok(Certificate { domains, cert_pem, key_pem, not_after })
}

/// Parse the `notAfter` field out of the first (leaf) certificate in a PEM chain.
pub fn leaf_not_after(cert_pem: &str) -> anyhow::Result<DateTime<Utc>> {
    let der = first_cert_der(cert_pem)?;
    let (_, cert) = x509_parser::parse_x509_certificate(&der)
        .map_err(|e| anyhow::anyhow!("parsing certificate: {e}"))?;
    let not_after = cert.validity().not_after.to_datetime();
    Ok(DateTime::from_timestamp(not_after.unix_timestamp(), 0).unwrap_or_else(Utc::now))
}

/// Best-effort SAN/CN extraction, used only to populate `Certificate::domains` for logging —
/// the TLS manager matches SNI against the rule-derived FQDN list, not this field.
fn leaf_subject_names(cert_pem: &str) -> anyhow::Result<Vec<String>> {
    let der = first_cert_der(cert_pem)?;
    let (_, cert) = x509_parser::parse_x509_certificate(&der)
        .map_err(|e| anyhow::anyhow!("parsing certificate: {e}"))?;
    let mut names = Vec::new();
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            if let x509_parser::extensions::GeneralName::DNSName(dns) = name {
                names.push(dns.to_string());
            }
        }
    }
    Ok(names)
}

fn first_cert_der(cert_pem: &str) -> anyhow::Result<Vec<u8>> {
    let mut reader = std::io::BufReader::new(cert_pem.as_bytes());
    let item = rustls_pemfile::certs(&mut reader)
        .next()
        .ok_or_else(|| anyhow::anyhow!("no certificate found in PEM"))??;
    Ok(item.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_cert_file_errors() {
        let result = load(Path::new("/nonexistent/cert.pem"), Path::new("/nonexistent/key.pem"));
        assert!(result.is_err());
    }
}
