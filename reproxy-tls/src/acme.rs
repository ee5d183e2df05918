use crate::dns01::{self, DnsProvider};
use crate::static_cert;
use instant_acme::{
    Account, AccountCredentials, Authorization, AuthorizationStatus, ChallengeType, Identifier,
    LetsEncrypt, NewAccount, NewOrder, OrderStatus,
};
use reproxy_core::Certificate;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

/// Renewal attempts a failed ACME order gets before giving up until the next scheduled pass.
const MAX_RENEWAL_ATTEMPTS: u32 = 5;

/// Base backoff between renewal attempts; the actual wait is `attempt * RENEWAL_BACKOFF`.
const RENEWAL_BACKOFF: Duration = Duration::from_secs(60);

/// How long to wait for an authorization to move past `Pending` before giving up on it.
const AUTHORIZATION_POLL_TIMEOUT: Duration = Duration::from_secs(120);

/// Drives ACME account registration, order issuance, HTTP-01/DNS-01 challenge completion, and
/// renewal for `ssl.type: auto`. One manager instance serves every FQDN reproxy terminates TLS
/// for; certificates and the account key persist under `acme_location` so a restart doesn't
/// re-register or re-issue needlessly.
pub struct AcmeManager {
    acme_location: PathBuf,
    acme_email: Option<String>,
    dns_provider: Option<Arc<dyn DnsProvider>>,
    dns_nameservers: Vec<String>,

    /// HTTP-01 tokens awaiting a matching request on the challenge port, keyed by token.
    pending_http01: Mutex<HashMap<String, String>>,

    /// Most recently issued certificate per FQDN, served by `TlsManager::resolve`.
    certs: RwLock<HashMap<String, Certificate>>,
}

impl AcmeManager {
    pub fn new(
        acme_location: PathBuf,
        acme_email: Option<String>,
        dns_provider: Option<Arc<dyn DnsProvider>>,
    ) -> Self {
        Self {
            acme_location,
            acme_email,
            dns_provider,
            dns_nameservers: Vec::new(),
            pending_http01: Mutex::new(HashMap::new()),
            certs: RwLock::new(HashMap::new()),
        }
    }

    fn account_path(&self) -> PathBuf {
        self.acme_location.join("account.json")
    }

    fn cert_path(&self, fqdn: &str) -> PathBuf {
        self.acme_location.join("certs").join(format!("{fqdn}.crt"))
    }

    fn key_path(&self, fqdn: &str) -> PathBuf {
        self.acme_location.join("certs").join(format!("{fqdn}.key"))
    }

    /// The key authorization for a token currently being served over HTTP-01, if any.
    pub async fn http01_response(&self, token: &str) -> Option<String> {
        self.pending_http01.lock().await.get(token).cloned()
    }

    /// The certificate currently held for `fqdn`, loaded from disk or freshly issued.
    pub async fn certificate_for(&self, fqdn: &str) -> Option<Certificate> {
        self.certs.read().await.get(fqdn).cloned()
    }

    /// Load every certificate already on disk under `acme_location`, then issue whatever is
    /// still missing or within the renewal window. Called once at startup.
    pub async fn bootstrap(&self, fqdns: &[String]) -> anyhow::Result<()> {
        std::fs::create_dir_all(self.acme_location.join("certs"))?;

        for fqdn in fqdns {
            if let Ok(cert) = self.load_from_disk(fqdn) {
                if !cert.needs_renewal(chrono::Utc::now()) {
                    self.certs.write().await.insert(fqdn.clone(), cert);
                    continue;
                }
            }
            if let Err(e) = self.issue(fqdn).await {
                tracing::error!(fqdn, error = %e, "initial acme issuance failed");
            }
        }
        Ok(())
    }

    fn load_from_disk(&self, fqdn: &str) -> anyhow::Result<Certificate> {
        static_cert::load(&self.cert_path(fqdn), &self.key_path(fqdn))
    }

    async fn load_or_register_account(&self) -> anyhow::Result<Account> {
        if let Ok(bytes) = std::fs::read(self.account_path()) {
            let credentials: AccountCredentials = serde_json::from_slice(&bytes)?;
            let account = Account::from_credentials(credentials).await?;
            return Ok(account);
        }

        let contact = self
            .acme_email
            .as_ref()
            .map(|email| format!("mailto:{email}"))
            .into_iter()
            .collect::<Vec<_>>();
        let contact_refs: Vec<&str> = contact.iter().map(String::as_str).collect();

        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &contact_refs,
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            LetsEncrypt::Production.url(),
            None,
        )
        .await?;

        std::fs::write(self.account_path(), serde_json::to_vec_pretty(&credentials)?)?;
        Ok(account)
    }

    /// Issue (or re-issue) a certificate for a single FQDN end to end: order, satisfy every
    /// authorization's challenge, finalize with a freshly generated key, persist to disk.
    pub async fn issue(&self, fqdn: &str) -> anyhow::Result<Certificate> {
        let account = self.load_or_register_account().await?;

        let identifier = Identifier::Dns(fqdn.to_string());
        let mut order = account
            .new_order(&NewOrder { identifiers: &[identifier] })
            .await?;

        let authorizations = order.authorizations().await?;
        for authz in &authorizations {
            self.complete_authorization(&mut order, authz).await?;
        }

        let private_key = rcgen::KeyPair::generate()?;
        let params = rcgen::CertificateParams::new(vec![fqdn.to_string()])?;
        let csr = params.serialize_request(&private_key)?;

        order.finalize(csr.der()).await?;

        let cert_chain_pem = loop {
            match order.certificate().await? {
                Some(chain) => break chain,
                None => tokio::time::sleep(Duration::from_secs(2)).await,
            }
        };

        let key_pem = private_key.serialize_pem();
        std::fs::create_dir_all(self.acme_location.join("certs"))?;
        write_private(&self.key_path(fqdn), key_pem.as_bytes())?;
        std::fs::write(self.cert_path(fqdn), cert_chain_pem.as_bytes())?;

        let not_after = static_cert::leaf_not_after(&cert_chain_pem)?;
        let cert = Certificate {
            domains: vec![fqdn.to_string()],
            cert_pem: cert_chain_pem,
            key_pem,
            not_after,
        };
        self.certs.write().await.insert(fqdn.to_string(), cert.clone());
        Ok(cert)
    }

    async fn complete_authorization(
        &self,
        order: &mut instant_acme::Order,
        authz: &Authorization,
    ) -> anyhow::Result<()> {
        if authz.status == AuthorizationStatus::Valid {
            return Ok(());
        }

        let Identifier::Dns(fqdn) = &authz.identifier;

        let challenge_type =
            if self.dns_provider.is_some() { ChallengeType::Dns01 } else { ChallengeType::Http01 };

        let challenge = authz
            .challenges
            .iter()
            .find(|c| c.r#type == challenge_type)
            .ok_or_else(|| anyhow::anyhow!("no {challenge_type:?} challenge offered for {fqdn}"))?;

        let key_auth = order.key_authorization(challenge);

        match challenge_type {
            ChallengeType::Http01 => {
                self.pending_http01
                    .lock()
                    .await
                    .insert(challenge.token.clone(), key_auth.as_str().to_string());
            }
            ChallengeType::Dns01 => {
                let provider = self
                    .dns_provider
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("dns-01 challenge offered but no dns provider configured"))?;
                let digest = key_auth.dns_value();
                provider.add_record(fqdn, &digest).await?;
                dns01::wait_until_propagated(fqdn, &digest, &self.dns_nameservers, Duration::from_secs(60))
                    .await;
            }
            _ => anyhow::bail!("unsupported challenge type {challenge_type:?}"),
        }

        order.set_challenge_ready(&challenge.url).await?;

        let deadline = tokio::time::Instant::now() + AUTHORIZATION_POLL_TIMEOUT;
        loop {
            tokio::time::sleep(Duration::from_secs(3)).await;
            let state = order.refresh().await?;
            match state.status {
                OrderStatus::Ready | OrderStatus::Valid => break,
                OrderStatus::Invalid => anyhow::bail!("authorization for {fqdn} went invalid"),
                _ if tokio::time::Instant::now() >= deadline => {
                    anyhow::bail!("timed out waiting for authorization of {fqdn}")
                }
                _ => continue,
            }
        }

        if challenge_type == ChallengeType::Dns01 {
            if let Some(provider) = &self.dns_provider {
                let digest = key_auth.dns_value();
                let _ = provider.remove_record(fqdn, &digest).await;
            }
        }

        Ok(())
    }

    /// Background renewal loop: wakes up periodically, renews any certificate within five days
    /// of expiry, retries a failing domain up to `MAX_RENEWAL_ATTEMPTS` times before leaving it
    /// for the next pass rather than retrying forever.
    pub async fn run(self: Arc<Self>, fqdns: Vec<String>, cancellation: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_secs(3600));
        loop {
            tokio::select! {
                _ = cancellation.cancelled() => return,
                _ = ticker.tick() => {}
            }

            for fqdn in &fqdns {
                let needs_renewal = match self.certs.read().await.get(fqdn) {
                    Some(cert) => cert.needs_renewal(chrono::Utc::now()),
                    None => true,
                };
                if !needs_renewal {
                    continue;
                }

                let mut attempt = 0;
                loop {
                    attempt += 1;
                    match self.issue(fqdn).await {
                        Ok(_) => break,
                        Err(e) if attempt >= MAX_RENEWAL_ATTEMPTS => {
                            tracing::error!(fqdn, attempt, error = %e, "giving up on renewal until next scheduled pass");
                            break;
                        }
                        Err(e) => {
                            tracing::warn!(fqdn, attempt, error = %e, "renewal attempt failed, retrying");
                            tokio::time::sleep(RENEWAL_BACKOFF * attempt).await;
                        }
                    }
                }
            }
        }
    }
}

fn write_private(path: &std::path::Path, bytes: &[u8]) -> anyhow::Result<()> {
    std::fs::write(path, bytes)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}
