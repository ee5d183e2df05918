//! No-op default implementations of the plugin conductor and metrics middleware interfaces.
//! reproxy ships no bundled plugins or metrics exporter; these exist so the fixed middleware
//! chain always has *something* to call at the "metrics" and "plugins" stages even when an
//! operator hasn't wired in a concrete implementation.

use async_trait::async_trait;
use reproxy_plugin::{Middleware, Next, Registry, RequestContext, ResponseContext};
use std::sync::Arc;

/// Metrics stage default: records nothing, just calls through.
pub struct NoopMetrics;

#[async_trait]
impl Middleware for NoopMetrics {
    fn name(&self) -> &str {
        "metrics"
    }

    async fn wrap(&self, ctx: RequestContext, next: Next) -> anyhow::Result<ResponseContext> {
        next(ctx).await
    }
}

/// Plugin conductor stage default: no plugins configured, just calls through.
pub struct NoopPluginConductor;

#[async_trait]
impl Middleware for NoopPluginConductor {
    fn name(&self) -> &str {
        "plugins"
    }

    async fn wrap(&self, ctx: RequestContext, next: Next) -> anyhow::Result<ResponseContext> {
        next(ctx).await
    }
}

/// A registry with only the no-op metrics and plugin-conductor stages registered, for a process
/// started without a concrete metrics or plugin implementation wired in.
pub fn default_registry() -> Registry {
    let mut registry = Registry::new();
    registry.register(Arc::new(NoopMetrics));
    registry.register(Arc::new(NoopPluginConductor));
    registry
}
