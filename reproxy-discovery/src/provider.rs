use async_trait::async_trait;
use reproxy_core::rule::Rule;
use tokio_util::sync::CancellationToken;

/// Source of routing rules. A provider is either event-driven (Docker, Consul — push changes
/// as they happen) or poll-based (a YAML file watched for mtime changes); both shapes reduce to
/// this one interface: `events` signals "something changed, call `list` again", `list` returns
/// the current full rule set.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Tag used to stamp `Rule::provider_id` and for logging.
    fn id(&self) -> reproxy_core::rule::ProviderId;

    /// Emit on the returned channel whenever this provider's rule set may have changed. The
    /// provider owns the channel's sender and stops sending once `cancel` fires. A provider with
    /// no push mechanism of its own (a static list) may send once and then do nothing further.
    async fn events(&self, cancel: CancellationToken) -> tokio::sync::mpsc::Receiver<()>;

    /// Return the provider's current full rule set. Errors are reported but never fatal to the
    /// discovery service: a failing provider simply contributes nothing to this rebuild and is
    /// retried on the next `events` signal.
    async fn list(&self) -> Result<Vec<Rule>, reproxy_core::error::ReproxyError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use reproxy_core::rule::{AuthUser, KeepHost, MatchType, ProviderId, RedirectType};
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    struct StaticProvider(Vec<Rule>);

    #[async_trait]
    impl Provider for StaticProvider {
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

    #[tokio::test]
    async fn static_provider_lists_its_fixed_rules_and_signals_once() {
        let rule = Rule {
            server: "*".into(),
            src_pattern: "/x".into(),
            dst: "http://u".into(),
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
        };
        let provider = StaticProvider(vec![rule]);
        let mut rx = provider.events(CancellationToken::new()).await;
        assert!(rx.recv().await.is_some());
        let rules = provider.list().await.unwrap();
        assert_eq!(rules.len(), 1);
    }
}
