use thiserror::Error;

/// Unified error type for reproxy.
#[derive(Error, Debug)]
pub enum ReproxyError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("provider {0} error: {1}")]
    Provider(String, String),

    #[error("rule compile error: {0}")]
    RuleCompile(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("auth failed")]
    AuthFailed,

    #[error("rate limited")]
    RateLimited,

    #[error("ip denied: {0}")]
    IpDenied(String),

    #[error("acme error: {0}")]
    Acme(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("internal: {0}")]
    Internal(String),
}

impl ReproxyError {
    /// Map to the HTTP status code the error reporter renders for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            ReproxyError::Config(_) => 500,
            ReproxyError::Provider(..) => 502,
            ReproxyError::RuleCompile(_) => 500,
            ReproxyError::Upstream(_) => 502,
            ReproxyError::AuthFailed => 401,
            ReproxyError::RateLimited => 429,
            ReproxyError::IpDenied(_) => 403,
            ReproxyError::Acme(_) => 500,
            ReproxyError::Io(_) => 500,
            ReproxyError::Serde(_) => 500,
            ReproxyError::Internal(_) => 500,
        }
    }
}
