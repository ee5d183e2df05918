use crate::plugin::Middleware;
use std::collections::HashMap;
use std::sync::Arc;

/// Registry of named middleware implementations, built once at startup and handed to workers as
/// a shared `Arc`. The fixed chain looks up configured plugin names here when assembling a
/// route's [`crate::pipeline::Pipeline`]; an unregistered name is a configuration error.
pub struct Registry {
    middlewares: HashMap<String, Arc<dyn Middleware>>,
}

impl Registry {
    pub fn new() -> Self {
        Self { middlewares: HashMap::new() }
    }

    pub fn register(&mut self, middleware: Arc<dyn Middleware>) {
        let name = middleware.name().to_string();
        tracing::info!(middleware = %name, "registered middleware");
        self.middlewares.insert(name, middleware);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Middleware>> {
        self.middlewares.get(name)
    }

    pub fn list(&self) -> Vec<&str> {
        self.middlewares.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
