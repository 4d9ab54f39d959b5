//! Normalizes fetched raw messages into canonical Email rows

use crate::error::MailResult;
use crate::events::{EventBus, MailReceived, TOPIC_MAIL_RECEIVED};
use crate::ids::{self, tag};
use crate::imap::FetchedMessage;
use crate::inbound::classify::classify;
use crate::inbound::message::{parse_raw, synthesize_message_id, ParsedAttachment, ParsedEmail};
use crate::models::{
    Direction, Email, EmailAttachment, EmailStatus, EmailThread, Mailbox, OrphanEmail,
};
use crate::repository::Repositories;
use crate::storage::BlobStore;
use crate::utils::normalize_subject;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How long a subject-only match may attach to an existing thread
const SUBJECT_MATCH_WINDOW_DAYS: i64 = 30;

/// Result of processing one fetched message
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub email_id: String,
    pub thread_id: String,
    /// False when the Message-ID had already been ingested
    pub created: bool,
}

/// Inbound processor: one instance shared by all folder synchronizers
#[derive(Clone)]
pub struct InboundProcessor {
    repos: Repositories,
    blobs: Arc<dyn BlobStore>,
    bus: Arc<dyn EventBus>,
}

impl InboundProcessor {
    pub fn new(repos: Repositories, blobs: Arc<dyn BlobStore>, bus: Arc<dyn EventBus>) -> Self {
        Self { repos, blobs, bus }
    }

    /// Ingest one raw message. At most one Email row is ever created per
    /// Message-ID; re-processing an already-stored message is a no-op.
    pub async fn process(
        &self,
        mailbox: &Mailbox,
        folder: &str,
        message: &FetchedMessage,
    ) -> MailResult<ProcessOutcome> {
        let parsed = parse_raw(&message.raw)?;

        let domain = mailbox.domain().unwrap_or("localhost");
        let message_id = parsed
            .message_id
            .clone()
            .unwrap_or_else(|| synthesize_message_id(&message.raw, domain));

        // Fast path for re-fetches after a checkpoint reset
        if let Some(existing) = self.repos.emails.get_by_message_id(&message_id).await? {
            debug!(
                mailbox_id = %mailbox.id,
                message_id = %message_id,
                "message already ingested, skipping"
            );
            return Ok(ProcessOutcome {
                thread_id: existing.thread_id.clone().unwrap_or_default(),
                email_id: existing.id,
                created: false,
            });
        }

        let (classification, reason) =
            classify(&parsed.headers, &parsed.subject, &parsed.from, &parsed.to);

        let (thread_id, unresolved_refs) = self.resolve_thread(mailbox, &parsed).await?;

        let now = Utc::now();
        let received_at = parsed.date.or(message.internal_date).unwrap_or(now);
        let email = Email {
            id: ids::new_id(tag::EMAIL),
            mailbox_id: mailbox.id.clone(),
            direction: Direction::Inbound,
            status: EmailStatus::Received,
            folder: Some(folder.to_string()),
            uid: Some(message.uid),
            message_id: Some(message_id.clone()),
            in_reply_to: parsed.in_reply_to.clone(),
            references: parsed.references.clone(),
            thread_id: Some(thread_id.clone()),
            from: parsed.from.clone(),
            to: parsed.to.clone(),
            cc: parsed.cc.clone(),
            bcc: parsed.bcc.clone(),
            reply_to: parsed.reply_to.clone(),
            subject: parsed.subject.clone(),
            body_text: parsed.body_text.clone(),
            body_html: parsed.body_html.clone(),
            raw_headers: Some(parsed.raw_headers.clone()),
            classification: Some(classification),
            classification_reason: (!reason.is_empty()).then_some(reason),
            has_attachments: !parsed.attachments.is_empty(),
            sent_at: None,
            received_at: Some(received_at),
            scheduled_for: None,
            last_attempt_at: None,
            send_attempts: 0,
            created_at: now,
            updated_at: now,
        };

        let (stored, created) = self.repos.emails.create(&email).await?;
        if !created {
            // Lost the upsert race to a concurrent worker
            return Ok(ProcessOutcome {
                thread_id: stored.thread_id.clone().unwrap_or(thread_id),
                email_id: stored.id,
                created: false,
            });
        }

        for referenced in unresolved_refs {
            self.repos
                .orphans
                .create(&OrphanEmail {
                    id: ids::new_id(tag::ORPHAN),
                    mailbox_id: mailbox.id.clone(),
                    referenced_message_id: referenced,
                    referencing_email_id: stored.id.clone(),
                    thread_id: thread_id.clone(),
                    created_at: now,
                })
                .await?;
        }

        self.store_attachments(mailbox, &stored, &thread_id, &parsed.attachments)
            .await?;

        self.repos
            .threads
            .record_message(
                &thread_id,
                &stored.id,
                received_at,
                &stored.participants(),
                stored.has_attachments,
            )
            .await?;

        self.resolve_orphans(&message_id, &thread_id).await?;

        self.bus
            .publish_fanout(
                &stored.id,
                TOPIC_MAIL_RECEIVED,
                serde_json::to_value(MailReceived {
                    mailbox_id: mailbox.id.clone(),
                    email_id: stored.id.clone(),
                    thread_id: thread_id.clone(),
                    classification: classification.as_str().to_string(),
                })?,
            )
            .await?;

        info!(
            mailbox_id = %mailbox.id,
            folder,
            uid = message.uid,
            email_id = %stored.id,
            thread_id = %thread_id,
            classification = classification.as_str(),
            "ingested message"
        );

        Ok(ProcessOutcome {
            email_id: stored.id,
            thread_id,
            created: true,
        })
    }

    /// Thread linkage: In-Reply-To match, then References match, then a
    /// normalized-subject match inside the recency window, then a fresh
    /// thread. Returns the thread id plus every referenced Message-ID
    /// that is not (yet) in storage.
    async fn resolve_thread(
        &self,
        mailbox: &Mailbox,
        parsed: &ParsedEmail,
    ) -> MailResult<(String, Vec<String>)> {
        let mut referenced: Vec<String> = Vec::new();
        if let Some(in_reply_to) = &parsed.in_reply_to {
            referenced.push(in_reply_to.clone());
        }
        for r in &parsed.references {
            if !referenced.contains(r) {
                referenced.push(r.clone());
            }
        }

        // In-Reply-To names the direct parent; References lists ancestors
        // oldest first, so walk it newest first.
        let mut lookup_order: Vec<&String> = Vec::new();
        if let Some(in_reply_to) = &parsed.in_reply_to {
            lookup_order.push(in_reply_to);
        }
        for r in parsed.references.iter().rev() {
            if parsed.in_reply_to.as_ref() != Some(r) {
                lookup_order.push(r);
            }
        }

        let mut resolved_thread: Option<String> = None;
        let mut known: HashSet<String> = HashSet::new();

        for message_id in lookup_order {
            if let Some(parent) = self.repos.emails.get_by_message_id(message_id).await? {
                known.insert(message_id.clone());
                if resolved_thread.is_none() {
                    resolved_thread = parent.thread_id;
                }
            }
        }

        let unresolved: Vec<String> = referenced
            .into_iter()
            .filter(|id| !known.contains(id))
            .collect();

        if let Some(thread_id) = resolved_thread {
            return Ok((thread_id, unresolved));
        }

        let normalized = normalize_subject(&parsed.subject);
        if !normalized.is_empty() {
            if let Some(thread) = self
                .repos
                .threads
                .find_by_subject_and_mailbox(
                    &mailbox.id,
                    &normalized,
                    Utc::now(),
                    SUBJECT_MATCH_WINDOW_DAYS,
                )
                .await?
            {
                return Ok((thread.id, unresolved));
            }
        }

        let now = Utc::now();
        let thread = EmailThread {
            id: ids::new_id(tag::THREAD),
            mailbox_id: mailbox.id.clone(),
            subject: normalized,
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
        Ok((thread.id, unresolved))
    }

    /// Dedupe by content hash, upload new bytes, link references
    async fn store_attachments(
        &self,
        mailbox: &Mailbox,
        email: &Email,
        thread_id: &str,
        attachments: &[ParsedAttachment],
    ) -> MailResult<()> {
        for attachment in attachments {
            let hash = hex_digest(&attachment.bytes);

            if let Some(existing) = self
                .repos
                .attachments
                .get_by_hash(&mailbox.id, &hash)
                .await?
            {
                self.repos
                    .attachments
                    .add_reference(&existing.id, &email.id, Some(thread_id))
                    .await?;
                debug!(
                    attachment_id = %existing.id,
                    email_id = %email.id,
                    "deduplicated attachment by content hash"
                );
                continue;
            }

            let id = ids::new_id(tag::ATTACHMENT);
            let storage_key = format!("attachments/{}/{}", mailbox.id, id);
            self.blobs
                .upload(&storage_key, attachment.bytes.clone(), &attachment.content_type)
                .await?;

            self.repos
                .attachments
                .store(&EmailAttachment {
                    id,
                    mailbox_id: mailbox.id.clone(),
                    email_ids: vec![email.id.clone()],
                    thread_ids: vec![thread_id.to_string()],
                    filename: attachment.filename.clone(),
                    content_type: attachment.content_type.clone(),
                    size: attachment.bytes.len() as i64,
                    content_hash: hash,
                    storage_key,
                    inline: attachment.inline,
                    created_at: Utc::now(),
                })
                .await?;
        }
        Ok(())
    }

    /// Re-home every email that was waiting for this Message-ID
    async fn resolve_orphans(&self, message_id: &str, thread_id: &str) -> MailResult<()> {
        let orphans = self
            .repos
            .orphans
            .list_by_referenced_message_id(message_id)
            .await?;
        if orphans.is_empty() {
            return Ok(());
        }

        for orphan in &orphans {
            match self.repos.emails.get_by_id(&orphan.referencing_email_id).await {
                Ok(referencing) => {
                    self.repos
                        .emails
                        .update_thread(&referencing.id, thread_id)
                        .await?;
                    let message_at = referencing
                        .received_at
                        .or(referencing.sent_at)
                        .unwrap_or(referencing.created_at);
                    self.repos
                        .threads
                        .record_message(
                            thread_id,
                            &referencing.id,
                            message_at,
                            &referencing.participants(),
                            referencing.has_attachments,
                        )
                        .await?;
                }
                Err(e) => {
                    warn!(
                        orphan_id = %orphan.id,
                        error = %e,
                        "referencing email vanished before orphan resolution"
                    );
                }
            }
        }

        self.repos
            .orphans
            .delete_by_referenced_message_id(message_id)
            .await?;
        info!(
            message_id,
            thread_id,
            resolved = orphans.len(),
            "resolved orphaned references"
        );
        Ok(())
    }
}

fn hex_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_digest_is_stable() {
        let a = hex_digest(b"content");
        let b = hex_digest(b"content");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }
}
