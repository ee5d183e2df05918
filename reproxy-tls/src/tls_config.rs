use rustls::crypto::CryptoProvider;
use rustls::crypto::ring as ring_provider;
use rustls::server::ResolvesServerCert;
use rustls::{ServerConfig, SupportedCipherSuite};
use std::sync::Arc;

/// Cipher suites reproxy is willing to negotiate: ECDHE key exchange with an AES-GCM bulk
/// cipher, server-preference order (strongest / most hardware-accelerated first).
const ALLOWED_CIPHER_SUITES: &[rustls::CipherSuite] = &[
    rustls::CipherSuite::TLS13_AES_256_GCM_SHA384,
    rustls::CipherSuite::TLS13_AES_128_GCM_SHA256,
    rustls::CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
    rustls::CipherSuite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
    rustls::CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
    rustls::CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
];

/// Curve preference for key exchange: X25519 first (fastest in software), then the two
/// NIST curves most clients still offer.
const ALLOWED_KX_GROUPS: &[&str] = &["x25519", "secp256r1", "secp384r1"];

fn filtered_cipher_suites() -> Vec<SupportedCipherSuite> {
    ring_provider::DEFAULT_CIPHER_SUITES
        .iter()
        .filter(|cs| ALLOWED_CIPHER_SUITES.contains(&cs.suite()))
        .copied()
        .collect()
}

fn filtered_kx_groups() -> Vec<&'static dyn rustls::crypto::SupportedKxGroup> {
    ring_provider::ALL_KX_GROUPS
        .iter()
        .filter(|g| ALLOWED_KX_GROUPS.iter().any(|name| kx_group_name(g.name()) == *name))
        .copied()
        .collect()
}

fn kx_group_name(name: rustls::NamedGroup) -> &'static str {
    match name {
        rustls::NamedGroup::X25519 => "x25519",
        rustls::NamedGroup::secp256r1 => "secp256r1",
        rustls::NamedGroup::secp384r1 => "secp384r1",
        _ => "",
    }
}

/// Build the `rustls::ServerConfig` reproxy listens with: TLS 1.2 minimum, the cipher and
/// curve preferences above, server order enforced, certificates resolved dynamically by
/// `resolver` (backed by either the static pair or the ACME manager).
pub fn build_server_config(resolver: Arc<dyn ResolvesServerCert>) -> anyhow::Result<ServerConfig> {
    let provider = CryptoProvider {
        cipher_suites: filtered_cipher_suites(),
        kx_groups: filtered_kx_groups(),
        ..ring_provider::default_provider()
    };

    let mut config = ServerConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .map_err(|e| anyhow::anyhow!("building rustls config: {e}"))?
        .with_no_client_auth()
        .with_cert_resolver(resolver);

    // Enforce server cipher-suite preference order rather than the client's.
    config.ignore_client_order = true;
    Ok(config)
}
