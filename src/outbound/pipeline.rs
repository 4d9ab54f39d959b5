//! Validation and scheduling of outbound mail
//!
//! `schedule_send` validates synchronously, persists the row durably,
//! and returns. A downstream worker picks up queued rows and performs
//! the actual SMTP dispatch.

use crate::error::{ErrorKind, MailResult, ValidationError};
use crate::ids::{self, tag};
use crate::models::{
    Direction, Email, EmailAddress, EmailStatus, EmailThread, Mailbox,
};
use crate::repository::Repositories;
use crate::utils::{generate_message_id, normalize_subject};
use crate::validation;
use chrono::{DateTime, Utc};
use tracing::info;

/// Caller identity attached to every API request
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub tenant: Option<String>,
    pub user_id: Option<String>,
}

/// An outbound send request as it arrives from the API surface
#[derive(Debug, Clone, Default)]
pub struct SendRequest {
    pub mailbox_id: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    /// Display name override when no sender profile is linked
    pub from_name: Option<String>,
    /// Reply path: attach to the referenced message's thread
    pub reply_to_message_id: Option<String>,
    pub attachment_ids: Vec<String>,
    pub scheduled_for: Option<DateTime<Utc>>,
}

/// Outbound scheduling pipeline
#[derive(Clone)]
pub struct OutboundPipeline {
    repos: Repositories,
}

impl OutboundPipeline {
    pub fn new(repos: Repositories) -> Self {
        Self { repos }
    }

    /// Validate and durably persist an outbound email. Returns the new
    /// email id and its initial status. Every validation failure is
    /// terminal; nothing is persisted on error.
    pub async fn schedule_send(
        &self,
        ctx: &RequestContext,
        request: SendRequest,
    ) -> MailResult<(String, EmailStatus)> {
        let now = Utc::now();

        let mailbox = self.validate_sender(ctx, &request).await?;
        validation::validate_recipients(&request.to, &request.cc, &request.bcc)?;
        self.validate_content(&request)?;
        self.validate_attachments(&request).await?;
        validation::validate_schedule(request.scheduled_for, now)?;

        let from_name = match (&request.from_name, &mailbox.sender_id) {
            (Some(name), _) => Some(name.clone()),
            (None, Some(sender_id)) => {
                let sender = self.repos.senders.get(sender_id).await?;
                Some(sender.display_name)
            }
            (None, None) => None,
        };

        let status = if request.scheduled_for.is_some() {
            EmailStatus::Scheduled
        } else {
            EmailStatus::Queued
        };
        let domain = mailbox.domain().unwrap_or("localhost");
        let message_id = generate_message_id(domain, now);

        let (thread_id, in_reply_to, references) =
            self.resolve_thread(&mailbox, &request, now).await?;

        let email = Email {
            id: ids::new_id(tag::EMAIL),
            mailbox_id: mailbox.id.clone(),
            direction: Direction::Outbound,
            status,
            folder: None,
            uid: None,
            message_id: Some(message_id),
            in_reply_to,
            references,
            thread_id: Some(thread_id.clone()),
            from: EmailAddress {
                name: from_name,
                address: mailbox.email_address.clone(),
            },
            to: request.to.iter().map(|a| EmailAddress::new(a.as_str())).collect(),
            cc: request.cc.iter().map(|a| EmailAddress::new(a.as_str())).collect(),
            bcc: request.bcc.iter().map(|a| EmailAddress::new(a.as_str())).collect(),
            reply_to: None,
            subject: request.subject.clone(),
            body_text: request.body_text.clone(),
            body_html: request.body_html.clone(),
            raw_headers: None,
            classification: None,
            classification_reason: None,
            has_attachments: !request.attachment_ids.is_empty(),
            sent_at: None,
            received_at: None,
            scheduled_for: request.scheduled_for,
            last_attempt_at: None,
            send_attempts: 1,
            created_at: now,
            updated_at: now,
        };

        let (stored, _) = self.repos.emails.create(&email).await?;

        for attachment_id in &request.attachment_ids {
            self.repos
                .attachments
                .add_reference(attachment_id, &stored.id, Some(&thread_id))
                .await?;
        }

        self.repos
            .threads
            .record_message(
                &thread_id,
                &stored.id,
                now,
                &stored.participants(),
                stored.has_attachments,
            )
            .await?;

        info!(
            mailbox_id = %mailbox.id,
            email_id = %stored.id,
            thread_id = %thread_id,
            status = status.as_str(),
            "outbound email scheduled"
        );

        Ok((stored.id, status))
    }

    /// Mailbox existence, caller identity, outbound flag, sender address,
    /// and the sender-profile-or-FromName requirement, in that order.
    async fn validate_sender(
        &self,
        ctx: &RequestContext,
        request: &SendRequest,
    ) -> MailResult<Mailbox> {
        let tenant = ctx
            .tenant
            .as_deref()
            .ok_or(ValidationError::TenantNotSet)?;
        let user_id = ctx
            .user_id
            .as_deref()
            .ok_or(ValidationError::UserIdNotSet)?;

        let mailbox = match self.repos.mailboxes.get_by_id(&request.mailbox_id).await {
            Ok(mailbox) => mailbox,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(ValidationError::MailboxDoesNotExist(request.mailbox_id.clone()).into())
            }
            Err(e) => return Err(e),
        };

        if mailbox.tenant != tenant || mailbox.user_id != user_id {
            return Err(ValidationError::UnauthorizedSender.into());
        }
        if !mailbox.outbound_enabled {
            return Err(ValidationError::OutboundNotEnabled.into());
        }

        validation::validate_sender(&mailbox.email_address, &mailbox)?;

        if mailbox.sender_id.is_none() && request.from_name.is_none() {
            return Err(ValidationError::UnknownSender.into());
        }

        Ok(mailbox)
    }

    fn validate_content(&self, request: &SendRequest) -> MailResult<()> {
        let has_text = request
            .body_text
            .as_deref()
            .is_some_and(|t| !t.trim().is_empty());
        let has_html = request
            .body_html
            .as_deref()
            .is_some_and(|h| !h.trim().is_empty());
        if !has_text && !has_html {
            return Err(ValidationError::EmptyBody.into());
        }
        if request.subject.trim().is_empty() {
            return Err(ValidationError::EmptySubject.into());
        }
        Ok(())
    }

    async fn validate_attachments(&self, request: &SendRequest) -> MailResult<()> {
        for attachment_id in &request.attachment_ids {
            match self.repos.attachments.get_by_id(attachment_id).await {
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    return Err(
                        ValidationError::AttachmentDoesNotExist(attachment_id.clone()).into(),
                    )
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Outbound messages start a new thread unless they reply to a
    /// stored message, in which case they join its thread.
    async fn resolve_thread(
        &self,
        mailbox: &Mailbox,
        request: &SendRequest,
        now: DateTime<Utc>,
    ) -> MailResult<(String, Option<String>, Vec<String>)> {
        if let Some(parent_message_id) = &request.reply_to_message_id {
            if let Some(parent) = self
                .repos
                .emails
                .get_by_message_id(parent_message_id)
                .await?
            {
                if let Some(thread_id) = parent.thread_id.clone() {
                    let mut references = parent.references.clone();
                    if let Some(parent_id) = &parent.message_id {
                        references.push(parent_id.clone());
                    }
                    return Ok((thread_id, parent.message_id, references));
                }
            }
        }

        let thread = EmailThread {
            id: ids::new_id(tag::THREAD),
            mailbox_id: mailbox.id.clone(),
            subject: normalize_subject(&request.subject),
            participants: Vec::new(),
            first_message_at: None,
            last_message_at: None,
            last_message_id: None,
            has_attachments: false,
            viewed_at: None,
            done_at: None,
            created_at: now,
            updated_at: now,
        };
        self.repos.threads.create(&thread).await?;
        Ok((thread.id, None, Vec::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_request_defaults_are_empty() {
        let request = SendRequest::default();
        assert!(request.to.is_empty());
        assert!(request.scheduled_for.is_none());
    }

    #[test]
    fn test_context_without_identity() {
        let ctx = RequestContext::default();
        assert!(ctx.tenant.is_none());
        assert!(ctx.user_id.is_none());
    }
}
