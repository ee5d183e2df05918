pub mod pipeline;
pub mod plugin;
pub mod registry;

pub use pipeline::Pipeline;
pub use plugin::{Middleware, Next, PassThrough, RequestContext, ResponseContext};
pub use registry::Registry;
