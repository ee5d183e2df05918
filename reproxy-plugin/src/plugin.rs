use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Minimal per-request context a plugin sees and may mutate before the request continues
/// downstream. Deliberately untyped beyond what the middleware chain itself needs: plugins are
/// an interface consumed by the dispatch chain, not a full request/response framework.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: String,
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub client_ip: std::net::IpAddr,
    /// Rule id the match resolver stage resolved for this request, if any.
    pub rule_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResponseContext {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The remainder of the middleware chain, captured as a single callable so a plugin can run code
/// before calling it, after it, or not call it at all (short-circuiting with its own response).
pub type Next =
    Arc<dyn Fn(RequestContext) -> BoxFuture<'static, anyhow::Result<ResponseContext>> + Send + Sync>;

/// A single middleware stage: `wrap(ctx, next) -> response`. Every stage in the fixed chain
/// (metrics, plugin conductor, header add/drop, access log, ...) implements this same shape, so
/// the chain is just a sequence of `Arc<dyn Middleware>` folded into nested closures.
#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;

    async fn wrap(&self, ctx: RequestContext, next: Next) -> anyhow::Result<ResponseContext>;
}

/// A no-op middleware that simply calls through. This is the default plugin conductor and the
/// default metrics hook when no concrete implementation is configured — plugins and metrics are
/// an interface only, with no bundled plugin registry or scrape endpoint.
pub struct PassThrough;

#[async_trait]
impl Middleware for PassThrough {
    fn name(&self) -> &str {
        "pass-through"
    }

    async fn wrap(&self, ctx: RequestContext, next: Next) -> anyhow::Result<ResponseContext> {
        next(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RequestContext {
        RequestContext {
            method: "GET".into(),
            uri: "/".into(),
            headers: vec![],
            client_ip: "127.0.0.1".parse().unwrap(),
            rule_id: None,
        }
    }

    #[tokio::test]
    async fn pass_through_calls_next() {
        let terminal: Next =
            Arc::new(|_ctx| Box::pin(async { Ok(ResponseContext { status: 200, headers: vec![] }) }));
        let result = PassThrough.wrap(ctx(), terminal).await.unwrap();
        assert_eq!(result.status, 200);
    }
}
