use dashmap::DashMap;
use reproxy_core::rule::{CompiledRule, MatchType, Rule};
use std::collections::HashMap;
use std::sync::Arc;

/// One destination resolved for a request, with the rule it came from so the middleware
/// chain can read `keep_host`, `auth_users`, etc.
#[derive(Clone)]
pub struct MatchedRoute {
    pub rule: Arc<CompiledRule>,
    /// `dst` with `$1`/`$host` already substituted from the request.
    pub destination: String,
    pub alive: bool,
}

/// The result of resolving a `(server, path)` pair. Empty `routes` means no match.
#[derive(Clone, Default)]
pub struct Matches {
    pub match_type: Option<MatchType>,
    pub routes: Vec<MatchedRoute>,
}

impl Matches {
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Only the alive destinations, in the order the load-balancer selector expects.
    pub fn alive_routes(&self) -> Vec<&MatchedRoute> {
        self.routes.iter().filter(|r| r.alive).collect()
    }
}

/// The compiled, immutable rule table the discovery service publishes. Readers use
/// `lookup` through an `ArcSwap` snapshot; nothing here mutates after construction except
/// each rule's own `alive` flag (an `AtomicBool` shared by reference, mutated by the health
/// scheduler without touching the table itself).
pub struct RuleTable {
    /// Rules grouped by their exact `server` field, each group pre-sorted by
    /// (match_type, base_path length desc, src_match string).
    by_server: HashMap<String, Vec<Arc<CompiledRule>>>,
    /// All rules, in provider-id order, for `mappers()`.
    all_sorted_by_provider: Vec<Arc<CompiledRule>>,
    /// Memoizes which stored server keys match a given requested host, via wildcard suffix
    /// or regex. Cleared by the discovery service on every rebuild.
    lookup_cache: DashMap<String, Vec<String>>,
}

impl RuleTable {
    /// Build a table from a flat, already-normalized rule list (see `normalize`). Rules whose
    /// `src_match` fails to compile are dropped with a warning; the rebuild continues.
    pub fn build(rules: Vec<Rule>) -> Self {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            match CompiledRule::compile(rule) {
                Ok(c) => compiled.push(Arc::new(c)),
                Err(e) => tracing::warn!(error = %e, "dropping rule with invalid src_match"),
            }
        }

        compiled.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));

        let mut by_server: HashMap<String, Vec<Arc<CompiledRule>>> = HashMap::new();
        for c in &compiled {
            by_server.entry(c.rule.server.clone()).or_default().push(c.clone());
        }

        let mut all_sorted_by_provider = compiled;
        all_sorted_by_provider.sort_by(|a, b| a.rule.provider_id.cmp(&b.rule.provider_id));

        RuleTable { by_server, all_sorted_by_provider, lookup_cache: DashMap::new() }
    }

    /// All distinct, non-default server (host) names carrying at least one rule.
    pub fn servers(&self) -> Vec<String> {
        let mut servers: Vec<String> = self
            .by_server
            .keys()
            .filter(|s| !s.is_empty() && s.as_str() != "*")
            .cloned()
            .collect();
        servers.sort();
        servers
    }

    /// All rules, ordered by provider id.
    pub fn mappers(&self) -> Vec<Arc<CompiledRule>> {
        self.all_sorted_by_provider.clone()
    }

    /// Resolve `(server, path)` to a `Matches`. Tries the requested server name first, then
    /// the `*` and "" default server names; the first candidate that produces any match wins
    /// and the others are never consulted — this is the mechanism by which a concrete-server
    /// match takes priority over a default-server match (see the discovery design notes).
    pub fn lookup(&self, server: &str, path: &str) -> Matches {
        for candidate in candidate_servers(server) {
            let rules = self.resolve_server_rules(&candidate, server);
            if let Some(m) = match_against(&rules, server, path) {
                return m;
            }
        }
        Matches::default()
    }

    /// Resolve the rule list associated with `candidate` (one of `[requested, "*", ""]`):
    /// exact key first, then the memoized wildcard/regex scan keyed by the *requested* host
    /// (not the candidate, so `*`/"" lookups aren't cached per-host pointlessly).
    fn resolve_server_rules(&self, candidate: &str, requested_host: &str) -> Vec<Arc<CompiledRule>> {
        if let Some(rules) = self.by_server.get(candidate) {
            return rules.clone();
        }
        if candidate != requested_host {
            return Vec::new();
        }

        if let Some(keys) = self.lookup_cache.get(requested_host) {
            return keys.iter().filter_map(|k| self.by_server.get(k)).flatten().cloned().collect();
        }

        let mut matched_keys = Vec::new();
        for key in self.by_server.keys() {
            if key == "*" || key.is_empty() {
                continue;
            }
            if server_pattern_matches(key, requested_host) {
                matched_keys.push(key.clone());
            }
        }
        self.lookup_cache.insert(requested_host.to_string(), matched_keys.clone());
        matched_keys.iter().filter_map(|k| self.by_server.get(k)).flatten().cloned().collect()
    }
}

fn candidate_servers(server: &str) -> Vec<String> {
    let mut candidates = vec![server.to_string()];
    if server != "*" {
        candidates.push("*".to_string());
    }
    if server != "" {
        candidates.push(String::new());
    }
    candidates
}

/// A stored `server` key, which may be a wildcard (`*.example.com`) or a regular expression,
/// matched against a concrete requested host.
fn server_pattern_matches(pattern: &str, host: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix("*.") {
        return host.ends_with(suffix) && host.len() > suffix.len();
    }
    if pattern == host {
        return true;
    }
    regex::Regex::new(pattern).map(|re| re.is_match(host)).unwrap_or(false)
}

/// Walk a server's sorted rule list and build the route group for the first matching
/// `src_match`. Returns `None` if nothing in this list matches the path.
fn match_against(rules: &[Arc<CompiledRule>], host: &str, path: &str) -> Option<Matches> {
    let mut group_key: Option<&str> = None;
    let mut routes = Vec::new();
    let mut match_type = None;

    for rule in rules {
        if let Some(key) = group_key {
            if rule.rule.src_pattern != key {
                break;
            }
        }

        let resolved = match rule.rule.match_type {
            MatchType::Proxy => resolve_proxy_destination(rule, host, path),
            MatchType::Static => resolve_static_destination(rule, path),
        };

        if let Some(destination) = resolved {
            if group_key.is_none() {
                group_key = Some(rule.rule.src_pattern.as_str());
                match_type = Some(rule.rule.match_type);
            }
            routes.push(MatchedRoute { rule: rule.clone(), destination, alive: rule.rule.is_alive() });
        } else if group_key.is_some() {
            // Already building a group and this rule (same src_match string) didn't
            // literally match — cannot happen for proxy rules with an identical pattern,
            // but stop defensively rather than skip past it.
            break;
        }
    }

    if routes.is_empty() {
        None
    } else {
        Some(Matches { match_type, routes })
    }
}

fn resolve_proxy_destination(rule: &CompiledRule, host: &str, path: &str) -> Option<String> {
    if !rule.src_match.is_match(path) {
        return None;
    }
    let dst = rule.rule.dst.replace("${host}", host).replace("$host", host);
    let expanded = rule.src_match.replace(path, dst.as_str());
    Some(expanded.into_owned())
}

fn resolve_static_destination(rule: &CompiledRule, path: &str) -> Option<String> {
    let web_root = rule.rule.assets_web_root.as_deref()?;
    if path == web_root || path.starts_with(&format!("{web_root}/")) {
        Some(rule.rule.dst.clone())
    } else {
        None
    }
}

fn sort_key(rule: &CompiledRule) -> (u8, std::cmp::Reverse<usize>, String) {
    let type_rank = match rule.rule.match_type {
        MatchType::Proxy => 0,
        MatchType::Static => 1,
    };
    (type_rank, std::cmp::Reverse(rule.base_path.len()), rule.rule.src_pattern.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use reproxy_core::rule::{AuthUser, KeepHost, ProviderId, RedirectType};
    use std::sync::atomic::AtomicBool;

    fn rule(server: &str, src: &str, dst: &str, match_type: MatchType) -> Rule {
        Rule {
            server: server.into(),
            src_pattern: src.into(),
            dst: dst.into(),
            provider_id: ProviderId::Static,
            ping_url: None,
            match_type,
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

    #[test]
    fn regex_proxy_match_expands_capture_group() {
        let table = RuleTable::build(vec![rule(
            "*",
            "^/api/svc1/(.*)",
            "http://U1/blah1/$1",
            MatchType::Proxy,
        )]);
        let m = table.lookup("example.com", "/api/svc1/1234");
        assert_eq!(m.routes.len(), 1);
        assert_eq!(m.routes[0].destination, "http://U1/blah1/1234");
    }

    #[test]
    fn concrete_host_rule_wins_over_default() {
        let table = RuleTable::build(vec![
            rule("*", "^/api/svc3/(.*)", "http://DEFAULT/$1", MatchType::Proxy),
            rule("localhost", "/api/svc3/xyz", "http://U3/blah3/xyz", MatchType::Proxy),
        ]);
        let m = table.lookup("localhost", "/api/svc3/xyz");
        assert_eq!(m.routes.len(), 1);
        assert_eq!(m.routes[0].destination, "http://U3/blah3/xyz");
    }

    #[test]
    fn no_match_returns_empty() {
        let table = RuleTable::build(vec![rule("*", "^/api/(.*)", "http://u/$1", MatchType::Proxy)]);
        assert!(table.lookup("example.org", "/nope").is_empty());
    }

    #[test]
    fn wildcard_host_matches_subdomains_only() {
        let table = RuleTable::build(vec![rule(
            "*.example.com",
            "^/api/(.*)",
            "http://u/$1",
            MatchType::Proxy,
        )]);
        assert!(!table.lookup("abc.example.com", "/api/x").is_empty());
        assert!(table.lookup("example.org", "/api/x").is_empty());
        assert!(table.lookup("example.com", "/api/x").is_empty());
    }

    #[test]
    fn static_rule_matches_web_root_prefix() {
        let mut r = rule("*", "/web", "/var/web", MatchType::Static);
        r.assets_web_root = Some("/web".into());
        let table = RuleTable::build(vec![r]);
        assert!(!table.lookup("example.com", "/web/index.html").is_empty());
        assert!(table.lookup("example.com", "/otherpath").is_empty());
    }

    #[test]
    fn equivalent_routes_group_by_identical_src_match_for_failover() {
        let table = RuleTable::build(vec![
            rule("*", "^/svc/(.*)", "http://a/$1", MatchType::Proxy),
            rule("*", "^/svc/(.*)", "http://b/$1", MatchType::Proxy),
        ]);
        let m = table.lookup("example.com", "/svc/x");
        assert_eq!(m.routes.len(), 2);
    }

    #[test]
    fn servers_list_skips_default_entries() {
        let table = RuleTable::build(vec![
            rule("*", "/a", "http://a", MatchType::Proxy),
            rule("www.example.com", "/b", "http://b", MatchType::Proxy),
        ]);
        assert_eq!(table.servers(), vec!["www.example.com".to_string()]);
    }
}
