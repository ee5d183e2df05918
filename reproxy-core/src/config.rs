use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::cert::TlsMode;

/// Top-level configuration for reproxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReproxyConfig {
    #[serde(default)]
    pub proxy: ProxyConfig,

    #[serde(default)]
    pub ssl: SslConfig,

    #[serde(default)]
    pub lb: LbConfig,

    #[serde(default)]
    pub limiter: LimiterConfig,

    #[serde(default)]
    pub error: ErrorConfig,

    #[serde(default)]
    pub signature: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    #[serde(default = "default_true")]
    pub gzip: bool,

    /// 0 = unlimited.
    #[serde(default)]
    pub max_body_size: u64,

    /// `key:value` response headers to add, format preserved verbatim (first colon only
    /// separates key from value; the rest of the value may contain colons).
    #[serde(default)]
    pub header: Vec<String>,

    /// Request header names to strip before forwarding upstream.
    #[serde(default)]
    pub drop_header: Vec<String>,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_ms: u64,

    #[serde(default = "default_response_header_timeout_ms")]
    pub response_header_ms: u64,

    #[serde(default = "default_idle_timeout_secs")]
    pub idle_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SslConfig {
    #[serde(default)]
    pub r#type: TlsMode,

    #[serde(default)]
    pub cert: Option<PathBuf>,

    #[serde(default)]
    pub key: Option<PathBuf>,

    #[serde(default = "default_acme_location")]
    pub acme_location: PathBuf,

    #[serde(default)]
    pub acme_email: Option<String>,

    #[serde(default)]
    pub fqdn: Vec<String>,

    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// DNS-01 provider name, if set; HTTP-01 is used otherwise.
    #[serde(default)]
    pub dns_provider: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LbType {
    RoundRobin,
    Random,
    Failover,
}

impl Default for LbType {
    fn default() -> Self {
        LbType::RoundRobin
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LbConfig {
    #[serde(default)]
    pub r#type: LbType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Requests/second allowed system-wide; 0 = unlimited.
    #[serde(default)]
    pub system: u32,

    /// Requests/second allowed per {client_ip, dst} (or {client_ip} with no proxy match);
    /// 0 = unlimited.
    #[serde(default)]
    pub user: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorConfig {
    /// Enable templated error pages instead of plain-text bodies.
    #[serde(default)]
    pub nice: bool,

    #[serde(default)]
    pub template: Option<PathBuf>,
}

impl ReproxyConfig {
    /// Load configuration from an optional YAML file, layered with `REPROXY_`-prefixed
    /// environment variables (`__` nests, e.g. `REPROXY_PROXY__LISTEN`).
    pub fn load(config_path: Option<&str>) -> anyhow::Result<Self> {
        let mut figment = Figment::new();

        if let Some(path) = config_path {
            figment = figment.merge(Yaml::file(path));
        } else {
            for default_path in &["reproxy.yml", "reproxy.yaml", "/etc/reproxy/reproxy.yml"] {
                if std::path::Path::new(default_path).exists() {
                    figment = figment.merge(Yaml::file(default_path));
                    break;
                }
            }
        }

        figment = figment.merge(Env::prefixed("REPROXY_").split("__"));

        let config: Self = figment.extract()?;
        Ok(config)
    }
}

impl Default for ReproxyConfig {
    fn default() -> Self {
        Self {
            proxy: ProxyConfig::default(),
            ssl: SslConfig::default(),
            lb: LbConfig::default(),
            limiter: LimiterConfig::default(),
            error: ErrorConfig::default(),
            signature: false,
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            gzip: true,
            max_body_size: 0,
            header: vec![],
            drop_header: vec![],
            timeouts: TimeoutConfig::default(),
            debounce_ms: default_debounce_ms(),
            health_interval_secs: default_health_interval_secs(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            dial_ms: default_dial_timeout_ms(),
            response_header_ms: default_response_header_timeout_ms(),
            idle_secs: default_idle_timeout_secs(),
        }
    }
}

impl Default for SslConfig {
    fn default() -> Self {
        Self {
            r#type: TlsMode::None,
            cert: None,
            key: None,
            acme_location: default_acme_location(),
            acme_email: None,
            fqdn: vec![],
            http_port: default_http_port(),
            dns_provider: None,
        }
    }
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self { system: 0, user: 0 }
    }
}

impl Default for ErrorConfig {
    fn default() -> Self {
        Self { nice: false, template: None }
    }
}

fn default_listen() -> SocketAddr {
    "0.0.0.0:8080".parse().unwrap()
}

fn default_true() -> bool {
    true
}

fn default_debounce_ms() -> u64 {
    750
}

fn default_health_interval_secs() -> u64 {
    5
}

fn default_dial_timeout_ms() -> u64 {
    5_000
}

fn default_response_header_timeout_ms() -> u64 {
    15_000
}

fn default_idle_timeout_secs() -> u64 {
    90
}

fn default_acme_location() -> PathBuf {
    PathBuf::from("/var/lib/reproxy/acme")
}

fn default_http_port() -> u16 {
    80
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_listen_and_timeouts() {
        let cfg = ReproxyConfig::default();
        assert_eq!(cfg.proxy.listen.port(), 8080);
        assert_eq!(cfg.proxy.timeouts.dial_ms, 5_000);
        assert!(cfg.proxy.gzip);
        assert_eq!(cfg.ssl.r#type, TlsMode::None);
        assert_eq!(cfg.lb.r#type, LbType::RoundRobin);
    }

    #[test]
    fn load_with_no_file_and_no_env_yields_defaults() {
        let cfg = ReproxyConfig::load(None).expect("defaults must always load");
        assert_eq!(cfg.proxy.listen.port(), 8080);
    }
}
