//! Mailstack — multi-tenant email relay
//!
//! Keeps long-lived IMAP sessions to many third-party mailboxes healthy,
//! ingests every new message exactly once into durable storage, and
//! schedules outbound mail through per-mailbox SMTP. The interesting
//! machinery is the supervision layer: per-mailbox session loops with
//! classified reconnect backoff, resumable folder synchronization with
//! per-batch checkpoints, and lease-coordinated singleton jobs.

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod ids;
pub mod imap;
pub mod inbound;
pub mod jobs;
pub mod models;
pub mod outbound;
pub mod repository;
pub mod smtp;
pub mod status;
pub mod storage;
pub mod sync;
pub mod utils;
pub mod validation;

pub use config::Config;
pub use error::{ErrorKind, MailError, MailResult, ValidationError};
pub use events::{EventBus, LoggingEventBus};
pub use inbound::InboundProcessor;
pub use models::*;
pub use outbound::{OutboundDispatcher, OutboundPipeline, RequestContext, SendRequest};
pub use repository::Repositories;
pub use status::StatusRegistry;
pub use storage::{BlobStore, MemoryBlobStore};
pub use sync::{FolderSynchronizer, MailboxSupervisor, SupervisorSet};
