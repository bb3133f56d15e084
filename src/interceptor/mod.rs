//! Message interceptor: the pipeline that takes an inbound message through
//! routing and conversation binding to an agent reply.

pub mod pipeline;
pub mod traits;

pub use pipeline::MessageInterceptor;
pub use traits::{FnProcessor, MessageProcessor, PipelineStats, PipelineStatsSnapshot};
