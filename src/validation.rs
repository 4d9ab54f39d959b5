//! Pure validation helpers for addresses, ownership, and scheduling

use crate::error::ValidationError;
use crate::models::Mailbox;
use chrono::{DateTime, Utc};
use email_address::EmailAddress as ParsedAddress;

/// Free-mail providers; a sender on one of these is never a relay sender,
/// and tenant-internal classification ignores them.
const FREE_MAIL_DOMAINS: &[&str] = &[
    "gmail.com",
    "googlemail.com",
    "yahoo.com",
    "yahoo.co.uk",
    "hotmail.com",
    "outlook.com",
    "live.com",
    "msn.com",
    "aol.com",
    "icloud.com",
    "me.com",
    "mail.com",
    "gmx.com",
    "gmx.de",
    "proton.me",
    "protonmail.com",
    "zoho.com",
    "yandex.com",
];

/// Local parts that designate machine endpoints rather than people
const SYSTEM_LOCAL_PARTS: &[&str] = &[
    "noreply",
    "no-reply",
    "no_reply",
    "donotreply",
    "do-not-reply",
    "mailer-daemon",
    "postmaster",
    "bounce",
    "bounces",
    "abuse",
    "spam",
];

/// Check RFC 5321/5322 address syntax
pub fn is_valid_address(address: &str) -> bool {
    address.parse::<ParsedAddress>().is_ok()
}

/// Lowercased domain part of an address, if present
pub fn domain_of(address: &str) -> Option<String> {
    address
        .rsplit_once('@')
        .map(|(_, domain)| domain.to_ascii_lowercase())
        .filter(|d| !d.is_empty())
}

/// Lowercased local part of an address, if present
pub fn local_part_of(address: &str) -> Option<String> {
    address
        .rsplit_once('@')
        .map(|(local, _)| local.to_ascii_lowercase())
        .filter(|l| !l.is_empty())
}

/// Check whether the address belongs to a free-mail provider
pub fn is_free_mail(address: &str) -> bool {
    domain_of(address).is_some_and(|d| FREE_MAIL_DOMAINS.contains(&d.as_str()))
}

/// Check whether the address is a machine endpoint (noreply, postmaster, ...)
pub fn is_system_address(address: &str) -> bool {
    local_part_of(address).is_some_and(|local| {
        SYSTEM_LOCAL_PARTS
            .iter()
            .any(|p| local == *p || local.starts_with(&format!("{}+", p)) || local.starts_with(&format!("{}-", p)))
    })
}

/// Validate that a sender address may relay through the given mailbox.
/// Syntax, then system/free-mail exclusion, then mailbox ownership.
pub fn validate_sender(address: &str, mailbox: &Mailbox) -> Result<(), ValidationError> {
    if !is_valid_address(address) {
        return Err(ValidationError::InvalidSender(address.to_string()));
    }
    if is_system_address(address) || is_free_mail(address) {
        return Err(ValidationError::InvalidSender(address.to_string()));
    }
    if !address.eq_ignore_ascii_case(&mailbox.email_address) {
        return Err(ValidationError::UnauthorizedSender);
    }
    Ok(())
}

/// Validate every recipient address for syntax
pub fn validate_recipients(
    to: &[String],
    cc: &[String],
    bcc: &[String],
) -> Result<(), ValidationError> {
    if to.is_empty() {
        return Err(ValidationError::RecipientsMissing);
    }
    for address in to.iter().chain(cc).chain(bcc) {
        if !is_valid_address(address) {
            return Err(ValidationError::InvalidRecipient(address.clone()));
        }
    }
    Ok(())
}

/// A scheduled send must be strictly in the future
pub fn validate_schedule(
    scheduled_for: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<(), ValidationError> {
    match scheduled_for {
        Some(at) if at <= now => Err(ValidationError::ScheduledSendNotValid),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConnectionStatus, Endpoint, Security};
    use chrono::Duration;
    use secrecy::SecretString;

    fn test_mailbox(address: &str) -> Mailbox {
        let endpoint = Endpoint {
            host: "mail.x.io".into(),
            port: 993,
            username: address.into(),
            secret: SecretString::new("secret".into()),
            security: Security::Tls,
        };
        Mailbox {
            id: "mbox_test".into(),
            tenant: "tenant_1".into(),
            user_id: "user_1".into(),
            provider: "mailstack".into(),
            email_address: address.into(),
            imap: endpoint.clone(),
            smtp: endpoint,
            sync_folders: vec!["INBOX".into()],
            inbound_enabled: true,
            outbound_enabled: true,
            sender_id: None,
            send_quota_daily: 100,
            send_count: 0,
            quota_reset_at: None,
            connection_status: ConnectionStatus::Pending,
            connection_error: None,
            last_connected_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
        }
    }

    #[test]
    fn test_address_syntax() {
        assert!(is_valid_address("a@x.io"));
        assert!(is_valid_address("first.last+tag@sub.example.com"));
        assert!(!is_valid_address("not-an-address"));
        assert!(!is_valid_address("missing@"));
        assert!(!is_valid_address("@missing.io"));
    }

    #[test]
    fn test_free_mail_detection() {
        assert!(is_free_mail("someone@gmail.com"));
        assert!(is_free_mail("someone@Outlook.com"));
        assert!(!is_free_mail("someone@corp.example"));
    }

    #[test]
    fn test_system_address_detection() {
        assert!(is_system_address("noreply@x.io"));
        assert!(is_system_address("no-reply@x.io"));
        assert!(is_system_address("MAILER-DAEMON@x.io"));
        assert!(is_system_address("bounces+abc@x.io"));
        assert!(!is_system_address("nora@x.io"));
    }

    #[test]
    fn test_validate_sender() {
        let mailbox = test_mailbox("a@x.io");
        assert!(validate_sender("a@x.io", &mailbox).is_ok());
        assert!(validate_sender("A@X.IO", &mailbox).is_ok());
        assert_eq!(
            validate_sender("b@x.io", &mailbox),
            Err(ValidationError::UnauthorizedSender)
        );
        assert!(matches!(
            validate_sender("noreply@x.io", &mailbox),
            Err(ValidationError::InvalidSender(_))
        ));
        assert!(matches!(
            validate_sender("a@gmail.com", &mailbox),
            Err(ValidationError::InvalidSender(_))
        ));
    }

    #[test]
    fn test_validate_recipients() {
        assert_eq!(
            validate_recipients(&[], &[], &[]),
            Err(ValidationError::RecipientsMissing)
        );
        assert!(validate_recipients(&["b@y.io".into()], &[], &[]).is_ok());
        assert!(matches!(
            validate_recipients(&["b@y.io".into()], &["bad".into()], &[]),
            Err(ValidationError::InvalidRecipient(_))
        ));
    }

    #[test]
    fn test_validate_schedule() {
        let now = Utc::now();
        assert!(validate_schedule(None, now).is_ok());
        assert!(validate_schedule(Some(now + Duration::hours(1)), now).is_ok());
        assert_eq!(
            validate_schedule(Some(now - Duration::hours(1)), now),
            Err(ValidationError::ScheduledSendNotValid)
        );
        assert_eq!(
            validate_schedule(Some(now), now),
            Err(ValidationError::ScheduledSendNotValid)
        );
    }
}
