//! Core entity types for the relay engine

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Transport security mode shared by IMAP and SMTP endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Security {
    None,
    #[default]
    Tls,
    Starttls,
}

impl Security {
    pub fn as_str(&self) -> &'static str {
        match self {
            Security::None => "none",
            Security::Tls => "tls",
            Security::Starttls => "starttls",
        }
    }
}

impl FromStr for Security {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Security::None),
            "tls" | "ssl" => Ok(Security::Tls),
            "starttls" => Ok(Security::Starttls),
            other => Err(format!("unknown security mode: {}", other)),
        }
    }
}

impl fmt::Display for Security {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection status of a mailbox, owned exclusively by its supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Pending,
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
    Disabled,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Pending => "pending",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::Disabled => "disabled",
        }
    }
}

impl FromStr for ConnectionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ConnectionStatus::Pending),
            "connecting" => Ok(ConnectionStatus::Connecting),
            "connected" => Ok(ConnectionStatus::Connected),
            "disconnected" => Ok(ConnectionStatus::Disconnected),
            "reconnecting" => Ok(ConnectionStatus::Reconnecting),
            "disabled" => Ok(ConnectionStatus::Disabled),
            other => Err(format!("unknown connection status: {}", other)),
        }
    }
}

/// One server endpoint of a mailbox (IMAP or SMTP side)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(skip_serializing, default = "empty_secret")]
    pub secret: SecretString,
    pub security: Security,
}

fn empty_secret() -> SecretString {
    SecretString::new(String::new())
}

/// A configured third-party mailbox under supervision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mailbox {
    pub id: String,
    pub tenant: String,
    pub user_id: String,
    pub provider: String,
    pub email_address: String,
    pub imap: Endpoint,
    pub smtp: Endpoint,
    /// Folders to synchronize; non-empty whenever inbound is enabled
    pub sync_folders: Vec<String>,
    pub inbound_enabled: bool,
    pub outbound_enabled: bool,
    pub sender_id: Option<String>,
    pub send_quota_daily: i32,
    pub send_count: i32,
    pub quota_reset_at: Option<DateTime<Utc>>,
    pub connection_status: ConnectionStatus,
    pub connection_error: Option<String>,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Mailbox {
    /// Domain part of the mailbox address
    pub fn domain(&self) -> Option<&str> {
        self.email_address.split('@').nth(1)
    }
}

/// Resumable sync checkpoint for one (mailbox, folder) pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderSyncState {
    pub mailbox_id: String,
    pub folder: String,
    /// Highest UID fully processed; 0 means initial backfill has not completed a batch
    pub last_uid: u32,
    /// UIDVALIDITY captured at the last SELECT; a flip invalidates `last_uid`
    pub uid_validity: Option<u32>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl FolderSyncState {
    pub fn new(mailbox_id: impl Into<String>, folder: impl Into<String>) -> Self {
        Self {
            mailbox_id: mailbox_id.into(),
            folder: folder.into(),
            last_uid: 0,
            uid_validity: None,
            last_synced_at: None,
        }
    }
}

/// Email direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inbound" => Ok(Direction::Inbound),
            "outbound" => Ok(Direction::Outbound),
            other => Err(format!("unknown direction: {}", other)),
        }
    }
}

/// Lifecycle status of an email row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailStatus {
    /// Inbound emails land fully processed
    Received,
    Draft,
    Scheduled,
    Queued,
    Sent,
    Failed,
    Bounced,
}

impl EmailStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmailStatus::Received => "received",
            EmailStatus::Draft => "draft",
            EmailStatus::Scheduled => "scheduled",
            EmailStatus::Queued => "queued",
            EmailStatus::Sent => "sent",
            EmailStatus::Failed => "failed",
            EmailStatus::Bounced => "bounced",
        }
    }

    /// Allowed transitions: draft → queued → sent | failed | bounced,
    /// scheduled → queued when the scheduled time elapses.
    pub fn can_transition_to(&self, next: EmailStatus) -> bool {
        matches!(
            (self, next),
            (EmailStatus::Draft, EmailStatus::Queued)
                | (EmailStatus::Scheduled, EmailStatus::Queued)
                | (EmailStatus::Queued, EmailStatus::Sent)
                | (EmailStatus::Queued, EmailStatus::Failed)
                | (EmailStatus::Queued, EmailStatus::Bounced)
                | (EmailStatus::Failed, EmailStatus::Queued)
        )
    }
}

impl FromStr for EmailStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "received" => Ok(EmailStatus::Received),
            "draft" => Ok(EmailStatus::Draft),
            "scheduled" => Ok(EmailStatus::Scheduled),
            "queued" => Ok(EmailStatus::Queued),
            "sent" => Ok(EmailStatus::Sent),
            "failed" => Ok(EmailStatus::Failed),
            "bounced" => Ok(EmailStatus::Bounced),
            other => Err(format!("unknown email status: {}", other)),
        }
    }
}

/// Classification assigned to each inbound email by the pure rule set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Ok,
    AutoResponder,
    BounceNotification,
    Bulk,
    Internal,
    Sensitive,
    Spam,
    EmailWarmer,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Ok => "ok",
            Classification::AutoResponder => "auto_responder",
            Classification::BounceNotification => "bounce_notification",
            Classification::Bulk => "bulk",
            Classification::Internal => "internal",
            Classification::Sensitive => "sensitive",
            Classification::Spam => "spam",
            Classification::EmailWarmer => "email_warmer",
        }
    }
}

impl FromStr for Classification {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(Classification::Ok),
            "auto_responder" => Ok(Classification::AutoResponder),
            "bounce_notification" => Ok(Classification::BounceNotification),
            "bulk" => Ok(Classification::Bulk),
            "internal" => Ok(Classification::Internal),
            "sensitive" => Ok(Classification::Sensitive),
            "spam" => Ok(Classification::Spam),
            "email_warmer" => Ok(Classification::EmailWarmer),
            other => Err(format!("unknown classification: {}", other)),
        }
    }
}

/// A single address in an envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailAddress {
    pub name: Option<String>,
    pub address: String,
}

impl EmailAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            name: None,
            address: address.into(),
        }
    }

    pub fn with_name(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            address: address.into(),
        }
    }

    /// Domain part of the address
    pub fn domain(&self) -> Option<&str> {
        self.address.split('@').nth(1)
    }
}

impl fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} <{}>", name, self.address),
            None => f.write_str(&self.address),
        }
    }
}

/// The canonical email entity, inbound or outbound
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Email {
    pub id: String,
    pub mailbox_id: String,
    pub direction: Direction,
    pub status: EmailStatus,
    pub folder: Option<String>,
    /// Server-assigned UID; present for inbound only
    pub uid: Option<u32>,
    /// RFC 5322 Message-ID, globally unique
    pub message_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub thread_id: Option<String>,
    pub from: EmailAddress,
    pub to: Vec<EmailAddress>,
    pub cc: Vec<EmailAddress>,
    pub bcc: Vec<EmailAddress>,
    pub reply_to: Option<EmailAddress>,
    pub subject: String,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    /// Raw RFC 5322 header block as received off the wire
    pub raw_headers: Option<String>,
    pub classification: Option<Classification>,
    pub classification_reason: Option<String>,
    pub has_attachments: bool,
    pub sent_at: Option<DateTime<Utc>>,
    pub received_at: Option<DateTime<Utc>>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub send_attempts: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Email {
    /// Union of all envelope participants
    pub fn participants(&self) -> Vec<EmailAddress> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for addr in std::iter::once(&self.from)
            .chain(self.to.iter())
            .chain(self.cc.iter())
            .chain(self.bcc.iter())
        {
            if seen.insert(addr.address.to_lowercase()) {
                out.push(addr.clone());
            }
        }
        out
    }
}

/// A conversation of emails linked by reply headers or normalized subject
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailThread {
    pub id: String,
    pub mailbox_id: String,
    pub subject: String,
    pub participants: Vec<EmailAddress>,
    pub first_message_at: Option<DateTime<Utc>>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_message_id: Option<String>,
    pub has_attachments: bool,
    pub viewed_at: Option<DateTime<Utc>>,
    pub done_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A reference to a Message-ID seen in a header but not yet stored
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrphanEmail {
    pub id: String,
    pub mailbox_id: String,
    /// The Message-ID the referencing email pointed at
    pub referenced_message_id: String,
    /// The stored email that carried the dangling reference
    pub referencing_email_id: String,
    /// Thread the referencing email was provisionally placed on
    pub thread_id: String,
    pub created_at: DateTime<Utc>,
}

/// Attachment metadata; bytes live behind the blob interface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailAttachment {
    pub id: String,
    pub mailbox_id: String,
    pub email_ids: Vec<String>,
    pub thread_ids: Vec<String>,
    pub filename: String,
    pub content_type: String,
    pub size: i64,
    /// SHA-256 of the content; unique per mailbox for dedupe
    pub content_hash: String,
    pub storage_key: String,
    pub inline: bool,
    pub created_at: DateTime<Utc>,
}

/// Sender profile linked to a mailbox for outbound display names
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sender {
    pub id: String,
    pub mailbox_id: String,
    pub user_id: String,
    pub display_name: String,
    pub signature: Option<String>,
    pub is_default: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_security_parse_roundtrip() {
        for mode in [Security::None, Security::Tls, Security::Starttls] {
            assert_eq!(mode.as_str().parse::<Security>().unwrap(), mode);
        }
        assert_eq!("SSL".parse::<Security>().unwrap(), Security::Tls);
        assert!("quic".parse::<Security>().is_err());
    }

    #[test]
    fn test_status_transitions() {
        assert!(EmailStatus::Draft.can_transition_to(EmailStatus::Queued));
        assert!(EmailStatus::Scheduled.can_transition_to(EmailStatus::Queued));
        assert!(EmailStatus::Queued.can_transition_to(EmailStatus::Sent));
        assert!(EmailStatus::Failed.can_transition_to(EmailStatus::Queued));
        assert!(!EmailStatus::Sent.can_transition_to(EmailStatus::Queued));
        assert!(!EmailStatus::Draft.can_transition_to(EmailStatus::Sent));
    }

    #[test]
    fn test_participants_deduplicated() {
        let email = Email {
            id: "email_1".into(),
            mailbox_id: "mbox_1".into(),
            direction: Direction::Inbound,
            status: EmailStatus::Received,
            folder: Some("INBOX".into()),
            uid: Some(1),
            message_id: Some("<m1@x>".into()),
            in_reply_to: None,
            references: vec![],
            thread_id: None,
            from: EmailAddress::new("a@x.io"),
            to: vec![EmailAddress::new("A@x.io"), EmailAddress::new("b@y.io")],
            cc: vec![EmailAddress::new("b@y.io")],
            bcc: vec![],
            reply_to: None,
            subject: "hi".into(),
            body_text: None,
            body_html: None,
            raw_headers: None,
            classification: None,
            classification_reason: None,
            has_attachments: false,
            sent_at: None,
            received_at: None,
            scheduled_for: None,
            last_attempt_at: None,
            send_attempts: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let participants = email.participants();
        assert_eq!(participants.len(), 2);
    }

    #[test]
    fn test_mailbox_secret_not_serialized() {
        let endpoint = Endpoint {
            host: "imap.x.io".into(),
            port: 993,
            username: "a@x.io".into(),
            secret: SecretString::new("hunter2".into()),
            security: Security::Tls,
        };
        let json = serde_json::to_string(&endpoint).unwrap();
        assert!(!json.contains("hunter2"));
    }
}
