//! Durable storage for mailbox config, checkpoints, emails, threads,
//! attachments, orphaned references, and sender profiles
//!
//! One repository struct per entity, each a thin wrapper over the shared
//! `PgPool`. Row-level atomicity comes from the database; the core never
//! needs cross-row transactions.

pub mod attachments;
pub mod emails;
pub mod mailboxes;
pub mod orphans;
pub mod senders;
pub mod sync_states;
pub mod threads;

pub use attachments::EmailAttachmentRepository;
pub use emails::EmailRepository;
pub use mailboxes::MailboxRepository;
pub use orphans::OrphanEmailRepository;
pub use senders::SenderRepository;
pub use sync_states::FolderSyncStateRepository;
pub use threads::EmailThreadRepository;

use crate::error::MailResult;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Bundle of every repository, handed to the components that need them
#[derive(Clone)]
pub struct Repositories {
    pub mailboxes: MailboxRepository,
    pub sync_states: FolderSyncStateRepository,
    pub emails: EmailRepository,
    pub threads: EmailThreadRepository,
    pub attachments: EmailAttachmentRepository,
    pub orphans: OrphanEmailRepository,
    pub senders: SenderRepository,
}

impl Repositories {
    pub fn new(pool: PgPool) -> Self {
        Self {
            mailboxes: MailboxRepository::new(pool.clone()),
            sync_states: FolderSyncStateRepository::new(pool.clone()),
            emails: EmailRepository::new(pool.clone()),
            threads: EmailThreadRepository::new(pool.clone()),
            attachments: EmailAttachmentRepository::new(pool.clone()),
            orphans: OrphanEmailRepository::new(pool.clone()),
            senders: SenderRepository::new(pool),
        }
    }
}

/// Connect to the mailstack database
pub async fn connect(dsn: &str, max_connections: u32) -> MailResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(dsn)
        .await?;
    Ok(pool)
}
