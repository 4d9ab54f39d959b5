//! SMTP client over lettre with PLAIN auth on the submission port
//!
//! One transient client per dispatch attempt; nothing is pooled. The
//! security-mode semantics match the IMAP side: `tls` wraps the dial,
//! `starttls` upgrades after EHLO, `none` is plaintext.

use crate::error::{MailError, MailResult};
use crate::models::{Email, EmailAddress, Endpoint, Security};
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox as LettreMailbox, Message, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use secrecy::ExposeSecret;
use std::time::Duration;
use tracing::{debug, info};

/// Attachment content resolved from the blob store for dispatch
#[derive(Debug, Clone)]
pub struct OutgoingAttachment {
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// Thin wrapper around a lettre async transport
pub struct SmtpClient {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    host: String,
}

impl SmtpClient {
    /// Build a transport for one mailbox's SMTP endpoint
    pub fn new(endpoint: &Endpoint, command_timeout: Duration) -> MailResult<Self> {
        let mut builder =
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(endpoint.host.as_str())
                .port(endpoint.port)
                .timeout(Some(command_timeout));

        builder = match endpoint.security {
            Security::Tls => {
                let params = TlsParameters::new(endpoint.host.clone())
                    .map_err(|e| MailError::internal(format!("TLS parameters: {}", e)))?;
                builder.tls(Tls::Wrapper(params))
            }
            Security::Starttls => {
                let params = TlsParameters::new(endpoint.host.clone())
                    .map_err(|e| MailError::internal(format!("TLS parameters: {}", e)))?;
                builder.tls(Tls::Required(params))
            }
            Security::None => builder.tls(Tls::None),
        };

        let credentials = Credentials::new(
            endpoint.username.clone(),
            endpoint.secret.expose_secret().clone(),
        );
        builder = builder
            .credentials(credentials)
            .authentication(vec![Mechanism::Plain]);

        Ok(Self {
            transport: builder.build(),
            host: endpoint.host.clone(),
        })
    }

    /// Send one email. The caller has already generated the Message-ID
    /// and validated the envelope.
    pub async fn send(&self, email: &Email, attachments: &[OutgoingAttachment]) -> MailResult<()> {
        let message = build_message(email, attachments)?;

        let response = self.transport.send(message).await?;
        info!(
            host = %self.host,
            email_id = %email.id,
            code = %response.code(),
            "dispatched email via SMTP"
        );
        Ok(())
    }
}

fn build_message(email: &Email, attachments: &[OutgoingAttachment]) -> MailResult<Message> {
    let mut builder = Message::builder()
        .from(to_lettre_mailbox(&email.from)?)
        .subject(email.subject.clone());

    if let Some(message_id) = &email.message_id {
        builder = builder.message_id(Some(message_id.clone()));
    }
    if let Some(in_reply_to) = &email.in_reply_to {
        builder = builder.in_reply_to(in_reply_to.clone());
    }
    if let Some(reply_to) = &email.reply_to {
        builder = builder.reply_to(to_lettre_mailbox(reply_to)?);
    }
    for addr in &email.to {
        builder = builder.to(to_lettre_mailbox(addr)?);
    }
    for addr in &email.cc {
        builder = builder.cc(to_lettre_mailbox(addr)?);
    }
    for addr in &email.bcc {
        builder = builder.bcc(to_lettre_mailbox(addr)?);
    }

    let body = build_body(email, attachments)?;
    builder
        .multipart(body)
        .map_err(|e| MailError::internal(format!("message assembly failed: {}", e)))
}

fn build_body(email: &Email, attachments: &[OutgoingAttachment]) -> MailResult<MultiPart> {
    let text = email.body_text.clone().unwrap_or_default();

    let content = match &email.body_html {
        Some(html) => MultiPart::alternative_plain_html(text, html.clone()),
        None => MultiPart::mixed().singlepart(SinglePart::plain(text)),
    };

    if attachments.is_empty() {
        return Ok(content);
    }

    let mut mixed = MultiPart::mixed().multipart(content);
    for attachment in attachments {
        let content_type = ContentType::parse(&attachment.content_type)
            .or_else(|_| ContentType::parse("application/octet-stream"))
            .map_err(|e| MailError::internal(format!("content type: {}", e)))?;
        mixed = mixed.singlepart(
            Attachment::new(attachment.filename.clone())
                .body(attachment.bytes.clone(), content_type),
        );
    }
    debug!(count = attachments.len(), "attached files to outgoing message");
    Ok(mixed)
}

fn to_lettre_mailbox(addr: &EmailAddress) -> MailResult<LettreMailbox> {
    let address: Address = addr
        .address
        .parse()
        .map_err(|e| MailError::internal(format!("invalid address {}: {}", addr.address, e)))?;
    Ok(LettreMailbox::new(addr.name.clone(), address))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Direction, EmailStatus};
    use chrono::Utc;

    fn outgoing_email() -> Email {
        Email {
            id: "email_out1".into(),
            mailbox_id: "mbox_1".into(),
            direction: Direction::Outbound,
            status: EmailStatus::Queued,
            folder: None,
            uid: None,
            message_id: Some("<msg1@x.io>".into()),
            in_reply_to: None,
            references: vec![],
            thread_id: Some("thrd_1".into()),
            from: EmailAddress::with_name("Ada", "a@x.io"),
            to: vec![EmailAddress::new("b@y.io")],
            cc: vec![],
            bcc: vec![],
            reply_to: None,
            subject: "hello".into(),
            body_text: Some("hi there".into()),
            body_html: Some("<p>hi there</p>".into()),
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
        }
    }

    #[test]
    fn test_build_message_with_html_and_text() {
        let email = outgoing_email();
        let message = build_message(&email, &[]).unwrap();
        let formatted = String::from_utf8(message.formatted()).unwrap();
        assert!(formatted.contains("Subject: hello"));
        assert!(formatted.contains("hi there"));
        assert!(formatted.contains("<p>hi there</p>"));
    }

    #[test]
    fn test_build_message_with_attachment() {
        let email = outgoing_email();
        let attachments = vec![OutgoingAttachment {
            filename: "notes.txt".into(),
            content_type: "text/plain".into(),
            bytes: b"some notes".to_vec(),
        }];
        let message = build_message(&email, &attachments).unwrap();
        let formatted = String::from_utf8(message.formatted()).unwrap();
        assert!(formatted.contains("notes.txt"));
    }

    #[test]
    fn test_invalid_address_is_rejected() {
        let mut email = outgoing_email();
        email.to = vec![EmailAddress::new("not an address")];
        assert!(build_message(&email, &[]).is_err());
    }
}
