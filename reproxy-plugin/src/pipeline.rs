use crate::plugin::{Middleware, Next, RequestContext, ResponseContext};
use std::sync::Arc;

/// Folds an ordered list of middleware into one callable chain: `stages[0].wrap(ctx,
/// stages[1].wrap(ctx, ... terminal))`. This is the "plugin conductor" stage of the fixed
/// middleware chain — a configured list of plugins (or none) wrapping whatever runs after it.
pub struct Pipeline {
    stages: Vec<Arc<dyn Middleware>>,
}

impl Pipeline {
    pub fn new(stages: Vec<Arc<dyn Middleware>>) -> Self {
        Self { stages }
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run the chain to completion, ending in `terminal` once every stage has had a chance to
    /// run before and after it.
    pub async fn run<F>(&self, ctx: RequestContext, terminal: F) -> anyhow::Result<ResponseContext>
    where
        F: Fn(RequestContext) -> crate::plugin::BoxFuture<'static, anyhow::Result<ResponseContext>>
            + Send
            + Sync
            + 'static,
    {
        let mut next: Next = Arc::new(terminal);

        for stage in self.stages.iter().rev() {
            let stage = Arc::clone(stage);
            let inner = next.clone();
            next = Arc::new(move |ctx| {
                let stage = Arc::clone(&stage);
                let inner = inner.clone();
                Box::pin(async move { stage.wrap(ctx, inner).await })
            });
        }

        next(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::PassThrough;

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
    async fn empty_pipeline_calls_terminal_directly() {
        let pipeline = Pipeline::new(vec![]);
        let result = pipeline
            .run(ctx(), |_ctx| Box::pin(async { Ok(ResponseContext { status: 204, headers: vec![] }) }))
            .await
            .unwrap();
        assert_eq!(result.status, 204);
    }

    #[tokio::test]
    async fn pass_through_stages_do_not_alter_terminal_response() {
        let pipeline = Pipeline::new(vec![Arc::new(PassThrough), Arc::new(PassThrough)]);
        let result = pipeline
            .run(ctx(), |_ctx| Box::pin(async { Ok(ResponseContext { status: 200, headers: vec![] }) }))
            .await
            .unwrap();
        assert_eq!(result.status, 200);
    }
}
