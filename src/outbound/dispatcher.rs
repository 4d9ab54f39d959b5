//! Dispatch worker for queued outbound mail
//!
//! Consumes `queued` rows, promotes `scheduled` rows whose time has
//! elapsed, sends through a transient SMTP client, and records the
//! outcome. Permanent SMTP rejections bounce the row immediately;
//! transient failures count against the attempt cap. Validation never
//! reaches this layer.

use crate::error::{MailError, MailResult};
use crate::events::{EventBus, TOPIC_MAIL_SENT};
use crate::models::{Email, EmailStatus};
use crate::repository::Repositories;
use crate::smtp::{OutgoingAttachment, SmtpClient};
use crate::storage::BlobStore;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Attempt cap; past it a failed row is terminal
pub const MAX_SEND_ATTEMPTS: i32 = 3;
/// How often the worker scans for due rows
const SCAN_INTERVAL: Duration = Duration::from_secs(5);
/// Rows taken per scan
const SCAN_LIMIT: i64 = 50;
/// Per-send SMTP command deadline
const SMTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Background worker draining the outbound queue
pub struct OutboundDispatcher {
    repos: Repositories,
    blobs: Arc<dyn BlobStore>,
    bus: Arc<dyn EventBus>,
    cancel: CancellationToken,
}

impl OutboundDispatcher {
    pub fn new(
        repos: Repositories,
        blobs: Arc<dyn BlobStore>,
        bus: Arc<dyn EventBus>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            repos,
            blobs,
            bus,
            cancel,
        }
    }

    /// Run until cancelled
    pub async fn run(&self) {
        info!("outbound dispatcher started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(SCAN_INTERVAL) => {}
                _ = self.cancel.cancelled() => break,
            }

            match self.dispatch_due().await {
                Ok(0) => {}
                Ok(sent) => debug!(sent, "dispatch scan complete"),
                Err(e) => error!(error = %e, "dispatch scan failed"),
            }
        }
        info!("outbound dispatcher stopped");
    }

    /// One scan over the queue; also called by the scheduled-send cron
    /// job so promotion happens even while the worker is between ticks.
    pub async fn dispatch_due(&self) -> MailResult<usize> {
        let due = self
            .repos
            .emails
            .list_due_for_dispatch(Utc::now(), SCAN_LIMIT)
            .await?;

        let mut dispatched = 0;
        for email in due {
            if self.cancel.is_cancelled() {
                break;
            }
            if self.dispatch_one(email).await? {
                dispatched += 1;
            }
        }
        Ok(dispatched)
    }

    /// Send one email; returns true when it went out
    async fn dispatch_one(&self, mut email: Email) -> MailResult<bool> {
        let mailbox = self.repos.mailboxes.get_by_id(&email.mailbox_id).await?;
        let now = Utc::now();

        // scheduled → queued once the scheduled time elapses
        if email.status == EmailStatus::Scheduled {
            self.repos
                .emails
                .update_status(&email.id, EmailStatus::Queued, email.send_attempts, None, None)
                .await?;
            email.status = EmailStatus::Queued;
            debug!(email_id = %email.id, "promoted scheduled email to queue");
        }

        let attachments = self.load_attachments(&email).await?;
        let client = SmtpClient::new(&mailbox.smtp, SMTP_TIMEOUT)?;

        match client.send(&email, &attachments).await {
            Ok(()) => {
                self.repos
                    .emails
                    .update_status(
                        &email.id,
                        EmailStatus::Sent,
                        email.send_attempts,
                        Some(now),
                        Some(now),
                    )
                    .await?;
                self.repos
                    .mailboxes
                    .increment_send_count(&mailbox.id, now)
                    .await?;
                self.bus
                    .publish_fanout(
                        &email.id,
                        TOPIC_MAIL_SENT,
                        json!({
                            "mailbox_id": mailbox.id,
                            "email_id": email.id,
                            "status": EmailStatus::Sent.as_str(),
                        }),
                    )
                    .await?;
                Ok(true)
            }
            Err(e) => {
                let attempts = email.send_attempts + 1;
                // A permanent (5xx) rejection bounces outright; only
                // transient failures walk the retry ladder.
                let status = if is_permanent_rejection(&e) {
                    EmailStatus::Bounced
                } else if attempts >= MAX_SEND_ATTEMPTS {
                    EmailStatus::Failed
                } else {
                    EmailStatus::Queued
                };
                warn!(
                    mailbox_id = %mailbox.id,
                    email_id = %email.id,
                    attempts,
                    status = status.as_str(),
                    error = %e,
                    "SMTP dispatch failed"
                );
                self.repos
                    .emails
                    .update_status(&email.id, status, attempts, Some(now), None)
                    .await?;
                Ok(false)
            }
        }
    }

    async fn load_attachments(&self, email: &Email) -> MailResult<Vec<OutgoingAttachment>> {
        if !email.has_attachments {
            return Ok(Vec::new());
        }

        let records = self.repos.attachments.list_by_email(&email.id).await?;
        let mut attachments = Vec::with_capacity(records.len());
        for record in records {
            let bytes = self.blobs.download(&record.storage_key).await?;
            attachments.push(OutgoingAttachment {
                filename: record.filename,
                content_type: record.content_type,
                bytes,
            });
        }
        Ok(attachments)
    }
}

/// Whether the remote rejected the message for good. A 5xx reply (no
/// such recipient, policy rejection) never succeeds on retry, so the
/// row bounces; everything else (4xx, connection trouble, timeouts)
/// stays retryable.
fn is_permanent_rejection(error: &MailError) -> bool {
    match error {
        MailError::Smtp(smtp_error) => smtp_error.is_permanent(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_smtp_errors_are_not_permanent() {
        assert!(!is_permanent_rejection(&MailError::transient(
            "connection reset"
        )));
        assert!(!is_permanent_rejection(&MailError::timeout("SMTP send", 60)));
        assert!(!is_permanent_rejection(&MailError::internal("bug")));
    }
}
