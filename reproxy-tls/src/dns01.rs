use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use std::time::Duration;

/// DNS-01 challenge backend. reproxy ships no registrar integrations itself — operators plug in
/// whatever updates their zone (a webhook, a registrar API client, a script).
#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Create a `_acme-challenge.<fqdn>` TXT record with the given key authorization digest.
    async fn add_record(&self, fqdn: &str, value: &str) -> anyhow::Result<()>;

    /// Remove the TXT record created by `add_record`, best-effort cleanup after the challenge
    /// completes (successfully or not).
    async fn remove_record(&self, fqdn: &str, value: &str) -> anyhow::Result<()>;
}

/// Poll a set of nameservers directly for the expected TXT value rather than trusting the
/// resolver's own propagation, since authoritative servers can disagree during a zone update.
/// Best-effort: gives up after `timeout` and lets the caller proceed anyway, since ACME will
/// fail the authorization itself if propagation genuinely hasn't happened.
pub async fn wait_until_propagated(
    fqdn: &str,
    expected: &str,
    nameservers: &[String],
    timeout: Duration,
) -> bool {
    let record = format!("_acme-challenge.{fqdn}");
    let resolvers = build_resolvers(nameservers);
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        for resolver in &resolvers {
            if let Ok(lookup) = resolver.txt_lookup(&record).await {
                for txt in lookup.iter() {
                    let value: String = txt.iter().map(|b| String::from_utf8_lossy(b)).collect();
                    if value == expected {
                        return true;
                    }
                }
            }
        }

        if tokio::time::Instant::now() >= deadline {
            tracing::warn!(fqdn, "dns-01 propagation check timed out, proceeding anyway");
            return false;
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}

fn build_resolvers(nameservers: &[String]) -> Vec<TokioAsyncResolver> {
    if nameservers.is_empty() {
        return vec![TokioAsyncResolver::tokio(
            ResolverConfig::cloudflare(),
            ResolverOpts::default(),
        )];
    }

    nameservers
        .iter()
        .filter_map(|ns| {
            let addr: std::net::IpAddr = ns.parse().ok()?;
            let group = NameServerConfigGroup::from_ips_clear(&[addr], 53, true);
            let config = ResolverConfig::from_parts(None, vec![], group);
            Some(TokioAsyncResolver::tokio(config, ResolverOpts::default()))
        })
        .collect()
}
