use arc_swap::ArcSwap;
use reproxy_core::rule::CompiledRule;
use std::sync::Arc;
use std::time::Duration;

const MAX_CONCURRENT_CHECKS: usize = 8;

/// One `ping_url` that failed this pass, with a short human-readable reason — surfaced
/// verbatim in the `/health` endpoint's `errors[]` array.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PingFailure {
    pub ping_url: String,
    pub error: String,
}

/// Summary of one health scheduler pass, returned to whoever wants to expose it on `/health`.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct HealthReport {
    /// Count of proxy-type rules considered this pass.
    pub services: usize,
    /// Count of rules carrying a `ping_url`, out of `services` — not a subset count of
    /// successful checks, a count of how many rules *have* one (see the ledger entry for
    /// why this mismatch is kept rather than fixed).
    pub passed: usize,
    /// Rules whose ping failed this pass.
    pub failures: Vec<PingFailure>,
}

impl HealthReport {
    pub fn all_ok(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Pings every proxy rule's `ping_url`, at most `MAX_CONCURRENT_CHECKS` in flight at once, and
/// flips `Rule::alive` accordingly. Rules with no `ping_url` are left alive permanently — there
/// is nothing to check.
pub async fn run_once(table: &Arc<ArcSwap<crate::table::RuleTable>>, client: &reqwest::Client) -> HealthReport {
    let snapshot = table.load();
    let rules: Vec<Arc<CompiledRule>> = snapshot
        .mappers()
        .into_iter()
        .filter(|r| r.rule.match_type == reproxy_core::rule::MatchType::Proxy)
        .collect();

    let services = rules.len();
    let passed = rules.iter().filter(|r| r.rule.ping_url.is_some()).count();

    let semaphore = Arc::new(tokio::sync::Semaphore::new(MAX_CONCURRENT_CHECKS));
    let mut handles = Vec::new();
    for rule in rules {
        let Some(ping_url) = rule.rule.ping_url.clone() else { continue };
        let semaphore = semaphore.clone();
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.unwrap();
            let result = ping(&client, &ping_url).await;
            rule.rule.set_alive(result.is_ok());
            result.err().map(|error| PingFailure { ping_url, error })
        }));
    }
    let mut failures = Vec::new();
    for handle in handles {
        if let Ok(Some(failure)) = handle.await {
            failures.push(failure);
        }
    }

    HealthReport { services, passed, failures }
}

/// A 2xx response is success; any other status or a transport error is failure, per the
/// ~500ms per-request timeout the health scheduler uses.
async fn ping(client: &reqwest::Client, url: &str) -> Result<(), String> {
    match client.get(url).timeout(Duration::from_millis(500)).send().await {
        Ok(resp) if resp.status().is_success() => Ok(()),
        Ok(resp) => Err(format!("status {}", resp.status().as_u16())),
        Err(e) => Err(e.to_string()),
    }
}

/// Runs `run_once` on a fixed interval until `cancel` fires. The interval is the discovery
/// service's `health_interval_secs`; there is no backoff on repeated failures, matching the
/// plain alive/dead flip the scheduler implements (no success/failure thresholds).
pub async fn schedule(
    table: Arc<ArcSwap<crate::table::RuleTable>>,
    interval: Duration,
    cancel: tokio_util::sync::CancellationToken,
) {
    let client = reqwest::Client::new();
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let report = run_once(&table, &client).await;
                tracing::debug!(services = report.services, passed = report.passed, "health check pass complete");
            }
        }
    }
}
