//! Attachment metadata storage; content bytes live in the blob store

use crate::error::{MailError, MailResult};
use crate::models::EmailAttachment;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

#[derive(Clone)]
pub struct EmailAttachmentRepository {
    pool: PgPool,
}

impl EmailAttachmentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Store new attachment metadata. Fails on a (mailbox, content_hash)
    /// collision; callers dedupe by looking up the hash first.
    pub async fn store(&self, attachment: &EmailAttachment) -> MailResult<()> {
        sqlx::query(
            r#"
            INSERT INTO email_attachments (
                id, mailbox_id, email_ids, thread_ids, filename,
                content_type, size, content_hash, storage_key, inline, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(&attachment.id)
        .bind(&attachment.mailbox_id)
        .bind(serde_json::to_value(&attachment.email_ids)?)
        .bind(serde_json::to_value(&attachment.thread_ids)?)
        .bind(&attachment.filename)
        .bind(&attachment.content_type)
        .bind(attachment.size)
        .bind(&attachment.content_hash)
        .bind(&attachment.storage_key)
        .bind(attachment.inline)
        .bind(attachment.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_by_id(&self, id: &str) -> MailResult<EmailAttachment> {
        let row = sqlx::query("SELECT * FROM email_attachments WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => attachment_from_row(&row),
            None => Err(MailError::not_found("attachment", id)),
        }
    }

    /// Dedupe lookup by content hash within a mailbox
    pub async fn get_by_hash(
        &self,
        mailbox_id: &str,
        content_hash: &str,
    ) -> MailResult<Option<EmailAttachment>> {
        let row = sqlx::query(
            "SELECT * FROM email_attachments WHERE mailbox_id = $1 AND content_hash = $2",
        )
        .bind(mailbox_id)
        .bind(content_hash)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| attachment_from_row(&row)).transpose()
    }

    pub async fn list_by_email(&self, email_id: &str) -> MailResult<Vec<EmailAttachment>> {
        let rows = sqlx::query(
            "SELECT * FROM email_attachments WHERE email_ids @> $1 ORDER BY created_at",
        )
        .bind(serde_json::json!([email_id]))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(attachment_from_row).collect()
    }

    pub async fn list_by_thread(&self, thread_id: &str) -> MailResult<Vec<EmailAttachment>> {
        let rows = sqlx::query(
            "SELECT * FROM email_attachments WHERE thread_ids @> $1 ORDER BY created_at",
        )
        .bind(serde_json::json!([thread_id]))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(attachment_from_row).collect()
    }

    /// Link an existing attachment to one more (email, thread) pair
    pub async fn add_reference(
        &self,
        id: &str,
        email_id: &str,
        thread_id: Option<&str>,
    ) -> MailResult<()> {
        let mut attachment = self.get_by_id(id).await?;

        if !attachment.email_ids.iter().any(|e| e == email_id) {
            attachment.email_ids.push(email_id.to_string());
        }
        if let Some(thread_id) = thread_id {
            if !attachment.thread_ids.iter().any(|t| t == thread_id) {
                attachment.thread_ids.push(thread_id.to_string());
            }
        }

        sqlx::query("UPDATE email_attachments SET email_ids = $2, thread_ids = $3 WHERE id = $1")
            .bind(id)
            .bind(serde_json::to_value(&attachment.email_ids)?)
            .bind(serde_json::to_value(&attachment.thread_ids)?)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn delete(&self, id: &str) -> MailResult<()> {
        sqlx::query("DELETE FROM email_attachments WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn attachment_from_row(row: &PgRow) -> MailResult<EmailAttachment> {
    Ok(EmailAttachment {
        id: row.try_get("id")?,
        mailbox_id: row.try_get("mailbox_id")?,
        email_ids: serde_json::from_value(row.try_get("email_ids")?)?,
        thread_ids: serde_json::from_value(row.try_get("thread_ids")?)?,
        filename: row.try_get("filename")?,
        content_type: row.try_get("content_type")?,
        size: row.try_get("size")?,
        content_hash: row.try_get("content_hash")?,
        storage_key: row.try_get("storage_key")?,
        inline: row.try_get("inline")?,
        created_at: row.try_get("created_at")?,
    })
}
