//! Inbound message processing
//!
//! Raw messages from the folder synchronizer are parsed, classified,
//! threaded, persisted, and announced on the event bus.

pub mod classify;
pub mod headers;
pub mod message;
pub mod processor;

pub use classify::classify;
pub use headers::HeaderView;
pub use message::ParsedEmail;
pub use processor::{InboundProcessor, ProcessOutcome};
