//! Mailbox synchronization: per-folder catch-up and the per-mailbox
//! connection supervisor

pub mod backoff;
pub mod folder;
pub mod supervisor;

pub use backoff::Backoff;
pub use folder::FolderSynchronizer;
pub use supervisor::{MailboxSupervisor, SupervisorSet};
