//! Error handling for the relay engine

/// Result type alias for relay operations
pub type MailResult<T> = Result<T, MailError>;

/// Coarse error kind used by retry policies and the API boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network-layer failure, timeout, EOF. Retried with backoff.
    Transient,
    /// Login rejected, bad credentials, TLS handshake failure. Fatal for the mailbox.
    Auth,
    /// Entity missing in a repository. Surfaced to the caller unchanged.
    NotFound,
    /// Outbound request rejected synchronously. Never retried.
    Validation,
    /// Server violated the protocol. Handled like `Transient`.
    Protocol,
    /// Bug class. Logged with full context, surfaced as 500, not retried.
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Auth => "auth",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Validation => "validation",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Error type for relay engine operations
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    /// Connection reset, I/O timeout, EOF, server "connection closed"
    #[error("connection error: {message}")]
    Transient { message: String },

    /// Login rejected, bad credentials, TLS handshake failure
    #[error("authentication failed: {message}")]
    Auth { message: String },

    /// Entity missing in repository
    #[error("not found: {resource} with id {id}")]
    NotFound { resource: String, id: String },

    /// Outbound validation failure with a stable code
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Malformed reply, server violation
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Invariant violated, nil client, recovered panic
    #[error("internal error: {message}")]
    Internal { message: String },

    /// Database-related errors
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// SMTP sending errors
    #[error("SMTP error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),

    /// Email parsing errors
    #[error("email parsing error: {0}")]
    Parsing(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MailError {
    /// Create a transient connection error
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    /// Create an authentication error
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth {
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(resource: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create a timeout error (timeouts are transient by policy)
    pub fn timeout(operation: impl Into<String>, timeout_seconds: u64) -> Self {
        Self::Transient {
            message: format!("{} timed out after {}s", operation.into(), timeout_seconds),
        }
    }

    /// Create a parsing error
    pub fn parsing(message: impl Into<String>) -> Self {
        Self::Parsing(message.into())
    }

    /// Get the tagged kind for retry policies and logging
    pub fn kind(&self) -> ErrorKind {
        match self {
            MailError::Transient { .. } | MailError::Io(_) => ErrorKind::Transient,
            MailError::Auth { .. } => ErrorKind::Auth,
            MailError::NotFound { .. } => ErrorKind::NotFound,
            MailError::Validation(_) => ErrorKind::Validation,
            MailError::Protocol { .. } | MailError::Parsing(_) => ErrorKind::Protocol,
            MailError::Smtp(_) => ErrorKind::Transient,
            MailError::Internal { .. } | MailError::Database(_) | MailError::Json(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Check if this error should be retried with backoff
    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient | ErrorKind::Protocol)
    }

    /// Check if this error is fatal for the owning mailbox
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Auth
    }
}

/// Stable validation codes returned synchronously from the outbound pipeline
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("subject must not be empty")]
    EmptySubject,
    #[error("body must contain text or html content")]
    EmptyBody,
    #[error("at least one To recipient is required")]
    RecipientsMissing,
    #[error("invalid sender address: {0}")]
    InvalidSender(String),
    #[error("sender is not authorized for this mailbox")]
    UnauthorizedSender,
    #[error("no sender profile linked and no from name supplied")]
    UnknownSender,
    #[error("outbound sending is not enabled for this mailbox")]
    OutboundNotEnabled,
    #[error("scheduled send time must be in the future")]
    ScheduledSendNotValid,
    #[error("attachment does not exist: {0}")]
    AttachmentDoesNotExist(String),
    #[error("mailbox does not exist: {0}")]
    MailboxDoesNotExist(String),
    #[error("tenant not set on request context")]
    TenantNotSet,
    #[error("user id not set on request context")]
    UserIdNotSet,
    #[error("invalid recipient address: {0}")]
    InvalidRecipient(String),
}

impl ValidationError {
    /// Stable error code for the API surface
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::EmptySubject => "EmptySubject",
            ValidationError::EmptyBody => "EmptyBody",
            ValidationError::RecipientsMissing => "RecipientsMissing",
            ValidationError::InvalidSender(_) => "InvalidSender",
            ValidationError::UnauthorizedSender => "UnauthorizedSender",
            ValidationError::UnknownSender => "UnknownSender",
            ValidationError::OutboundNotEnabled => "OutboundNotEnabled",
            ValidationError::ScheduledSendNotValid => "ScheduledSendNotValid",
            ValidationError::AttachmentDoesNotExist(_) => "AttachmentDoesNotExist",
            ValidationError::MailboxDoesNotExist(_) => "MailboxDoesNotExist",
            ValidationError::TenantNotSet => "TenantNotSet",
            ValidationError::UserIdNotSet => "UserIdNotSet",
            ValidationError::InvalidRecipient(_) => "InvalidRecipient",
        }
    }
}

// Convert from IMAP errors, classifying at the transport layer only
impl From<async_imap::error::Error> for MailError {
    fn from(error: async_imap::error::Error) -> Self {
        use async_imap::error::Error as ImapError;
        match error {
            ImapError::Io(e) => MailError::Transient {
                message: format!("IMAP I/O: {}", e),
            },
            ImapError::ConnectionLost => MailError::Transient {
                message: "IMAP connection lost".to_string(),
            },
            ImapError::Parse(e) => MailError::Protocol {
                message: format!("IMAP parse: {:?}", e),
            },
            other => MailError::Protocol {
                message: format!("IMAP: {:?}", other),
            },
        }
    }
}

// Convert from mailparse errors
impl From<mailparse::MailParseError> for MailError {
    fn from(error: mailparse::MailParseError) -> Self {
        MailError::Parsing(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(MailError::transient("reset").kind(), ErrorKind::Transient);
        assert_eq!(MailError::auth("nope").kind(), ErrorKind::Auth);
        assert_eq!(
            MailError::not_found("mailbox", "mbox_1").kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            MailError::from(ValidationError::EmptySubject).kind(),
            ErrorKind::Validation
        );
        assert_eq!(MailError::protocol("bad reply").kind(), ErrorKind::Protocol);
        assert_eq!(MailError::internal("bug").kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_transient_and_fatal() {
        assert!(MailError::transient("eof").is_transient());
        assert!(MailError::protocol("garbage capability").is_transient());
        assert!(!MailError::auth("rejected").is_transient());
        assert!(MailError::auth("rejected").is_fatal());
        assert!(!MailError::internal("bug").is_transient());
    }

    #[test]
    fn test_validation_codes_are_stable() {
        assert_eq!(ValidationError::EmptySubject.code(), "EmptySubject");
        assert_eq!(
            ValidationError::ScheduledSendNotValid.code(),
            "ScheduledSendNotValid"
        );
        assert_eq!(
            ValidationError::MailboxDoesNotExist("mbox_x".into()).code(),
            "MailboxDoesNotExist"
        );
    }

    #[test]
    fn test_imap_error_classification() {
        let lost: MailError = async_imap::error::Error::ConnectionLost.into();
        assert!(lost.is_transient());
    }
}
