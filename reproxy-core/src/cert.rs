use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// TLS mode, selected once at startup and immutable thereafter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    None,
    Static,
    Auto,
}

impl Default for TlsMode {
    fn default() -> Self {
        TlsMode::None
    }
}

/// An in-memory certificate, either loaded once from disk (static mode) or obtained and
/// periodically replaced by the ACME manager (auto mode).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Certificate {
    /// SNI hostnames this certificate answers for.
    pub domains: Vec<String>,

    /// PEM-encoded certificate chain (leaf first).
    pub cert_pem: String,

    /// PEM-encoded private key.
    pub key_pem: String,

    pub not_after: DateTime<Utc>,
}

impl Certificate {
    /// Whether this certificate should be renewed: within five days of expiry.
    pub fn needs_renewal(&self, now: DateTime<Utc>) -> bool {
        self.not_after - now < chrono::Duration::days(5)
    }
}
