use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Origin of a rule, tagged for logging and `mappers()` ordering. Concrete providers
/// (Docker, YAML, Consul, a static-rule parser) are out of scope; this enum only
/// names the tag, not the provider implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    Docker,
    File,
    Consul,
    Static,
}

impl ProviderId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::Docker => "docker",
            ProviderId::File => "file",
            ProviderId::Consul => "consul",
            ProviderId::Static => "static",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Proxy,
    Static,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedirectType {
    None,
    Permanent,
    Temporary,
}

impl RedirectType {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            RedirectType::None => None,
            RedirectType::Permanent => Some(301),
            RedirectType::Temporary => Some(302),
        }
    }
}

/// `dst` prefixes that select a redirect rather than a proxy pass-through.
/// Order matters only in that each is tried in turn; the first matching prefix wins.
const REDIRECT_PREFIXES: &[(&str, RedirectType)] = &[
    ("@301 ", RedirectType::Permanent),
    ("@perm ", RedirectType::Permanent),
    ("@302 ", RedirectType::Temporary),
    ("@tmp ", RedirectType::Temporary),
    ("@temp ", RedirectType::Temporary),
];

/// Tri-state override for whether the upstream `Host` header is the original client host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeepHost {
    Unset,
    Yes,
    No,
}

impl Default for KeepHost {
    fn default() -> Self {
        KeepHost::Unset
    }
}

/// One `user:bcrypt-hash` pair for per-route basic auth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthUser {
    pub name: String,
    pub hash: String,
}

/// A single routing directive, as published by a discovery provider and normalized by the
/// discovery service. Rules are immutable once published except for `alive`, which only the
/// health scheduler mutates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    /// Host pattern: an exact host, `*` or "" (default, matches any host), `*.example.com`
    /// (wildcard suffix), or a regular expression.
    pub server: String,

    /// Raw `src_match` pattern as received from the provider, before compilation.
    #[serde(rename = "src")]
    pub src_pattern: String,

    /// Destination template, already stripped of any redirect prefix and with `@` rewritten
    /// to `$` by the time it reaches this struct (see `discovery::table::normalize`).
    pub dst: String,

    pub provider_id: ProviderId,

    #[serde(default)]
    pub ping_url: Option<String>,

    pub match_type: MatchType,

    #[serde(default)]
    pub redirect_type: RedirectType,

    #[serde(default)]
    pub keep_host: KeepHost,

    #[serde(default)]
    pub only_from_ips: Vec<String>,

    #[serde(default)]
    pub auth_users: Vec<AuthUser>,

    #[serde(default)]
    pub assets_web_root: Option<String>,

    #[serde(default)]
    pub assets_location: Option<String>,

    #[serde(default)]
    pub assets_spa: bool,

    /// Set by the health scheduler; defaults to alive so a rule with no `ping_url` is never
    /// marked dead. Never read from a provider.
    #[serde(skip, default = "default_alive")]
    pub alive: Arc<AtomicBool>,
}

impl Default for RedirectType {
    fn default() -> Self {
        RedirectType::None
    }
}

fn default_alive() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(true))
}

impl Rule {
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Relaxed);
    }

    /// Split a `dst` value on its redirect prefix, if any. Returns the prefix's redirect type
    /// and the remaining destination (unprefixed). A prefix with an empty tail does not count.
    pub fn extract_redirect(dst: &str) -> (RedirectType, &str) {
        for (prefix, kind) in REDIRECT_PREFIXES {
            if let Some(rest) = dst.strip_prefix(prefix) {
                if !rest.is_empty() {
                    return (*kind, rest);
                }
            }
        }
        (RedirectType::None, dst)
    }

    /// Rewrite `@N` capture references to `$N`, the form the regex `replace` engine expects.
    pub fn rewrite_capture_refs(dst: &str) -> String {
        dst.replace('@', "$")
    }
}

/// A compiled rule: the immutable, regex-bearing counterpart to `Rule` held in the published
/// rule table. Compilation happens once, at rebuild time, never on the request hot path.
#[derive(Clone)]
pub struct CompiledRule {
    pub rule: Rule,
    pub src_match: Regex,
    /// Base path of `src_match`, used for the base-path-length-descending sort
    /// (e.g. `/a/b/(.*)` -> `/a/b`).
    pub base_path: String,
}

impl CompiledRule {
    pub fn compile(rule: Rule) -> Result<Self, regex::Error> {
        let src_match = Regex::new(&rule.src_pattern)?;
        let base_path = base_path_of(&rule.src_pattern);
        Ok(CompiledRule { rule, src_match, base_path })
    }
}

/// The literal prefix of a regex up to its first metacharacter, used only for ordering.
fn base_path_of(pattern: &str) -> String {
    pattern
        .chars()
        .take_while(|c| !matches!(c, '(' | '[' | '.' | '*' | '+' | '?' | '^' | '$' | '\\' | '|' | '{'))
        .collect()
}
