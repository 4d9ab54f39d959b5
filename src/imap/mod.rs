//! IMAP transport layer
//!
//! One session per mailbox, exclusively owned by that mailbox's
//! supervisor. TLS, STARTTLS and plain connections are supported; the
//! session exposes exactly the commands the folder synchronizer needs.

pub mod session;

pub use session::{FetchedMessage, FolderStatus, IdleOutcome, SessionClient};
