//! Outbound mail: validation + scheduling, and the dispatch worker

pub mod dispatcher;
pub mod pipeline;

pub use dispatcher::{OutboundDispatcher, MAX_SEND_ATTEMPTS};
pub use pipeline::{OutboundPipeline, RequestContext, SendRequest};
