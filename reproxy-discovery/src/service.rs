use arc_swap::ArcSwap;
use reproxy_core::rule::CompiledRule;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::health::{self, HealthReport};
use crate::normalize::normalize;
use crate::provider::Provider;
use crate::table::{Matches, RuleTable};

/// Merges every provider's rule list into one published `RuleTable`, debounced so a burst of
/// provider events collapses into a single rebuild, and runs the health scheduler against the
/// same table. Proxy workers read the table through `ArcSwap` snapshots and are notified of a
/// new one over a `crossbeam_channel`, since they live on the monoio runtime and cannot await a
/// tokio channel directly.
pub struct DiscoveryService {
    providers: Vec<Arc<dyn Provider>>,
    table: Arc<ArcSwap<RuleTable>>,
    changed_tx: crossbeam_channel::Sender<()>,
    debounce: Duration,
    health_interval: Duration,
}

impl DiscoveryService {
    pub fn new(
        providers: Vec<Arc<dyn Provider>>,
        debounce: Duration,
        health_interval: Duration,
    ) -> (Self, crossbeam_channel::Receiver<()>) {
        let (changed_tx, changed_rx) = crossbeam_channel::unbounded();
        let service = DiscoveryService {
            providers,
            table: Arc::new(ArcSwap::from_pointee(RuleTable::build(Vec::new()))),
            changed_tx,
            debounce,
            health_interval,
        };
        (service, changed_rx)
    }

    /// A cheap handle proxy workers hold to read the current table without touching the
    /// service itself.
    pub fn table_handle(&self) -> Arc<ArcSwap<RuleTable>> {
        self.table.clone()
    }

    /// Resolve `(server, path)` against the currently published table.
    pub fn lookup(&self, server: &str, path: &str) -> Matches {
        self.table.load().lookup(server, path)
    }

    pub fn servers(&self) -> Vec<String> {
        self.table.load().servers()
    }

    pub fn mappers(&self) -> Vec<Arc<CompiledRule>> {
        self.table.load().mappers()
    }

    /// Run one health pass immediately, outside the scheduled interval (used by an explicit
    /// `/health` hit if the caller wants a fresh read rather than the last scheduled one).
    pub async fn check_health(&self) -> HealthReport {
        let client = reqwest::Client::new();
        health::run_once(&self.table, &client).await
    }

    /// Spawn the health scheduler on the current tokio runtime; runs until `cancel` fires.
    pub fn schedule_health_check(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let table = self.table.clone();
        let interval = self.health_interval;
        tokio::spawn(health::schedule(table, interval, cancel))
    }

    /// Fan in every provider's event stream, rebuild the table on a debounced signal, and keep
    /// doing so until `cancel` fires. Never returns an error: a provider whose `list()` fails
    /// is logged and simply contributes nothing to that rebuild.
    pub async fn run(&self, cancel: CancellationToken) {
        let (rebuild_tx, mut rebuild_rx) = tokio::sync::mpsc::channel::<()>(1);

        for provider in &self.providers {
            let provider = provider.clone();
            let cancel = cancel.clone();
            let rebuild_tx = rebuild_tx.clone();
            tokio::spawn(async move {
                let mut events = provider.events(cancel.clone()).await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        signal = events.recv() => {
                            if signal.is_none() {
                                break;
                            }
                            let _ = rebuild_tx.send(()).await;
                        }
                    }
                }
            });
        }
        drop(rebuild_tx);

        self.rebuild().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                signal = rebuild_rx.recv() => {
                    if signal.is_none() {
                        break;
                    }
                    tokio::time::sleep(self.debounce).await;
                    while rebuild_rx.try_recv().is_ok() {}
                    self.rebuild().await;
                }
            }
        }
    }

    async fn rebuild(&self) {
        let mut merged = Vec::new();
        for provider in &self.providers {
            match provider.list().await {
                Ok(rules) => merged.extend(rules),
                Err(e) => tracing::warn!(provider = provider.id().as_str(), error = %e, "provider list failed, skipping for this rebuild"),
            }
        }

        let rules = normalize(merged);
        let count = rules.len();
        let table = RuleTable::build(rules);
        self.table.store(Arc::new(table));
        let _ = self.changed_tx.send(());
        tracing::info!(rules = count, "rule table rebuilt");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use reproxy_core::rule::{AuthUser, KeepHost, MatchType, ProviderId, RedirectType, Rule};
    use std::sync::atomic::AtomicBool;

    struct FixedProvider(Vec<Rule>);

    #[async_trait]
    impl Provider for FixedProvider {
        fn id(&self) -> ProviderId {
            ProviderId::Static
        }

        async fn events(&self, _cancel: CancellationToken) -> tokio::sync::mpsc::Receiver<()> {
            let (tx, rx) = tokio::sync::mpsc::channel(1);
            let _ = tx.send(()).await;
            rx
        }

        async fn list(&self) -> Result<Vec<Rule>, reproxy_core::error::ReproxyError> {
            Ok(self.0.clone())
        }
    }

    fn rule(src: &str, dst: &str) -> Rule {
        Rule {
            server: "*".into(),
            src_pattern: src.into(),
            dst: dst.into(),
            provider_id: ProviderId::Static,
            ping_url: None,
            match_type: MatchType::Proxy,
            redirect_type: RedirectType::None,
            keep_host: KeepHost::Unset,
            only_from_ips: vec![],
            auth_users: Vec::<AuthUser>::new(),
            assets_web_root: None,
            assets_location: None,
            assets_spa: false,
            alive: Arc::new(AtomicBool::new(true)),
        }
    }

    #[tokio::test]
    async fn run_publishes_a_table_and_notifies_on_the_changed_channel() {
        let provider: Arc<dyn Provider> = Arc::new(FixedProvider(vec![rule("^/api/(.*)", "http://u/$1")]));
        let (service, changed_rx) =
            DiscoveryService::new(vec![provider], Duration::from_millis(1), Duration::from_secs(60));
        let service = Arc::new(service);

        let cancel = CancellationToken::new();
        let run_cancel = cancel.clone();
        let run_service = service.clone();
        let handle = tokio::spawn(async move { run_service.run(run_cancel).await });

        for _ in 0..50 {
            if changed_rx.try_recv().is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert!(!service.lookup("example.com", "/api/x").is_empty());
        cancel.cancel();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn lookup_servers_and_mappers_reflect_a_rebuilt_table() {
        let provider: Arc<dyn Provider> = Arc::new(FixedProvider(vec![rule("^/api/(.*)", "http://u/$1")]));
        let (service, _changed_rx) =
            DiscoveryService::new(vec![provider], Duration::from_millis(1), Duration::from_secs(60));

        service.rebuild().await;

        assert!(!service.lookup("example.com", "/api/x").is_empty());
        assert_eq!(service.mappers().len(), 1);
    }
}
