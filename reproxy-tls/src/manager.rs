use crate::acme::AcmeManager;
use crate::dns01::DnsProvider;
use crate::static_cert;
use reproxy_core::cert::{Certificate, TlsMode};
use reproxy_core::config::SslConfig;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::sync::Arc;
use std::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Ties the three `ssl.type` modes together behind one object: a no-op for `none`, a single
/// immutable pair for `static`, and the full ACME lifecycle for `auto`. Implements
/// `ResolvesServerCert` directly so it can be handed to [`crate::tls_config::build_server_config`]
/// regardless of mode.
pub struct TlsManager {
    mode: TlsMode,
    static_cert: Option<CertifiedKey>,
    acme: Option<Arc<AcmeManager>>,
    /// SNI -> rustls CertifiedKey cache for auto mode, rebuilt whenever the ACME manager issues
    /// or renews. Separate from `AcmeManager::certs` because rustls needs the parsed key, not PEM.
    acme_cache: RwLock<std::collections::HashMap<String, Arc<CertifiedKey>>>,
    http_port: u16,
}

impl TlsManager {
    pub fn none() -> Self {
        Self {
            mode: TlsMode::None,
            static_cert: None,
            acme: None,
            acme_cache: RwLock::new(std::collections::HashMap::new()),
            http_port: 80,
        }
    }

    pub fn load_static(cfg: &SslConfig) -> anyhow::Result<Self> {
        let cert_path = cfg.cert.as_ref().ok_or_else(|| anyhow::anyhow!("ssl.cert required for static mode"))?;
        let key_path = cfg.key.as_ref().ok_or_else(|| anyhow::anyhow!("ssl.key required for static mode"))?;
        let cert = static_cert::load(cert_path, key_path)?;
        let certified = certified_key_from(&cert)?;

        Ok(Self {
            mode: TlsMode::Static,
            static_cert: Some(certified),
            acme: None,
            acme_cache: RwLock::new(std::collections::HashMap::new()),
            http_port: cfg.http_port,
        })
    }

    pub fn auto(cfg: &SslConfig, dns_provider: Option<Arc<dyn DnsProvider>>) -> Self {
        let acme = Arc::new(AcmeManager::new(cfg.acme_location.clone(), cfg.acme_email.clone(), dns_provider));
        Self {
            mode: TlsMode::Auto,
            static_cert: None,
            acme: Some(acme),
            acme_cache: RwLock::new(std::collections::HashMap::new()),
            http_port: cfg.http_port,
        }
    }

    pub fn mode(&self) -> TlsMode {
        self.mode
    }

    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    /// Build from configuration. `known_fqdns` is the rule-derived hostname set used to seed ACME
    /// issuance when `ssl.fqdn` is left empty — discovered once at startup by harvesting
    /// `DiscoveryService::servers()` for up to five seconds before falling back to whatever rules
    /// have already arrived.
    pub async fn new(
        cfg: &SslConfig,
        known_fqdns: Vec<String>,
        dns_provider: Option<Arc<dyn DnsProvider>>,
    ) -> anyhow::Result<Self> {
        match cfg.r#type {
            TlsMode::None => Ok(Self::none()),
            TlsMode::Static => Self::load_static(cfg),
            TlsMode::Auto => {
                let manager = Self::auto(cfg, dns_provider);
                let fqdns = if cfg.fqdn.is_empty() { known_fqdns } else { cfg.fqdn.clone() };
                if let Some(acme) = &manager.acme {
                    acme.bootstrap(&fqdns).await?;
                    manager.refresh_acme_cache(&fqdns).await;
                }
                Ok(manager)
            }
        }
    }

    async fn refresh_acme_cache(&self, fqdns: &[String]) {
        let Some(acme) = &self.acme else { return };
        let mut cache = self.acme_cache.write().expect("acme cache lock poisoned");
        for fqdn in fqdns {
            if let Some(cert) = acme.certificate_for(fqdn).await {
                if let Ok(certified) = certified_key_from(&cert) {
                    cache.insert(fqdn.clone(), Arc::new(certified));
                }
            }
        }
    }

    /// Spawn the ACME renewal loop. No-op outside auto mode.
    pub fn spawn_renewal(&self, fqdns: Vec<String>, cancellation: CancellationToken) {
        if let Some(acme) = self.acme.clone() {
            tokio::spawn(async move {
                acme.run(fqdns, cancellation).await;
            });
        }
    }

    /// Serve an ACME HTTP-01 challenge response if `path` matches `/.well-known/acme-challenge/*`
    /// and a token is currently pending; otherwise returns `None` so the caller falls through to
    /// its normal redirect-to-HTTPS behavior.
    pub async fn http01_response(&self, path: &str) -> Option<String> {
        let token = path.strip_prefix("/.well-known/acme-challenge/")?;
        let acme = self.acme.as_ref()?;
        acme.http01_response(token).await
    }
}

impl ResolvesServerCert for TlsManager {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        match self.mode {
            TlsMode::None => None,
            TlsMode::Static => self.static_cert.clone().map(Arc::new),
            TlsMode::Auto => {
                let sni = client_hello.server_name()?;
                self.acme_cache.read().expect("acme cache lock poisoned").get(sni).cloned()
            }
        }
    }
}

fn certified_key_from(cert: &Certificate) -> anyhow::Result<CertifiedKey> {
    let mut reader = std::io::BufReader::new(cert.cert_pem.as_bytes());
    let chain: Vec<_> = rustls_pemfile::certs(&mut reader).collect::<Result<_, _>>()?;

    let mut key_reader = std::io::BufReader::new(cert.key_pem.as_bytes());
    let key_der = rustls_pemfile::private_key(&mut key_reader)?
        .ok_or_else(|| anyhow::anyhow!("no private key found in PEM"))?;

    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key_der)
        .map_err(|e| anyhow::anyhow!("unsupported private key: {e}"))?;

    Ok(CertifiedKey::new(chain, signing_key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_mode_resolves_nothing() {
        let manager = TlsManager::none();
        assert_eq!(manager.mode(), TlsMode::None);
    }

    #[tokio::test]
    async fn http01_response_none_outside_auto_mode() {
        let manager = TlsManager::none();
        assert!(manager.http01_response("/.well-known/acme-challenge/abc").await.is_none());
    }
}
