//! Canonical email storage

use crate::error::{MailError, MailResult};
use crate::models::{Classification, Direction, Email, EmailStatus};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::str::FromStr;

#[derive(Clone)]
pub struct EmailRepository {
    pool: PgPool,
}

impl EmailRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert the email, deduplicating on Message-ID. Returns the stored
    /// row and whether this call created it. Two concurrent ingests of
    /// the same Message-ID race through the unique index; the loser
    /// reads back the winner's row.
    pub async fn create(&self, email: &Email) -> MailResult<(Email, bool)> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO emails (
                id, mailbox_id, direction, status, folder, uid,
                message_id, in_reply_to, references_list, thread_id,
                from_addr, to_addrs, cc_addrs, bcc_addrs, reply_to,
                subject, body_text, body_html, raw_headers,
                classification, classification_reason, has_attachments,
                sent_at, received_at, scheduled_for, last_attempt_at,
                send_attempts, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26,
                $27, $28, $29
            )
            ON CONFLICT (message_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&email.id)
        .bind(&email.mailbox_id)
        .bind(email.direction.as_str())
        .bind(email.status.as_str())
        .bind(&email.folder)
        .bind(email.uid.map(|u| u as i64))
        .bind(&email.message_id)
        .bind(&email.in_reply_to)
        .bind(serde_json::to_value(&email.references)?)
        .bind(&email.thread_id)
        .bind(serde_json::to_value(&email.from)?)
        .bind(serde_json::to_value(&email.to)?)
        .bind(serde_json::to_value(&email.cc)?)
        .bind(serde_json::to_value(&email.bcc)?)
        .bind(serde_json::to_value(&email.reply_to)?)
        .bind(&email.subject)
        .bind(&email.body_text)
        .bind(&email.body_html)
        .bind(&email.raw_headers)
        .bind(email.classification.map(|c| c.as_str()))
        .bind(&email.classification_reason)
        .bind(email.has_attachments)
        .bind(email.sent_at)
        .bind(email.received_at)
        .bind(email.scheduled_for)
        .bind(email.last_attempt_at)
        .bind(email.send_attempts)
        .bind(email.created_at)
        .bind(email.updated_at)
        .fetch_optional(&self.pool)
        .await?;

        if inserted.is_some() {
            return Ok((email.clone(), true));
        }

        // Conflicted: an email with this Message-ID already exists
        let message_id = email
            .message_id
            .as_deref()
            .ok_or_else(|| MailError::internal("upsert conflict without a message id"))?;
        let existing = self
            .get_by_message_id(message_id)
            .await?
            .ok_or_else(|| MailError::internal("conflicting email row disappeared"))?;
        Ok((existing, false))
    }

    pub async fn get_by_id(&self, id: &str) -> MailResult<Email> {
        let row = sqlx::query("SELECT * FROM emails WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => email_from_row(&row),
            None => Err(MailError::not_found("email", id)),
        }
    }

    pub async fn get_by_message_id(&self, message_id: &str) -> MailResult<Option<Email>> {
        let row = sqlx::query("SELECT * FROM emails WHERE message_id = $1")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| email_from_row(&row)).transpose()
    }

    pub async fn get_by_uid(
        &self,
        mailbox_id: &str,
        folder: &str,
        uid: u32,
    ) -> MailResult<Option<Email>> {
        let row =
            sqlx::query("SELECT * FROM emails WHERE mailbox_id = $1 AND folder = $2 AND uid = $3")
                .bind(mailbox_id)
                .bind(folder)
                .bind(uid as i64)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|row| email_from_row(&row)).transpose()
    }

    pub async fn list_by_mailbox(&self, mailbox_id: &str, limit: i64) -> MailResult<Vec<Email>> {
        let rows = sqlx::query(
            "SELECT * FROM emails WHERE mailbox_id = $1 ORDER BY created_at DESC LIMIT $2",
        )
        .bind(mailbox_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(email_from_row).collect()
    }

    pub async fn list_by_folder(
        &self,
        mailbox_id: &str,
        folder: &str,
        limit: i64,
    ) -> MailResult<Vec<Email>> {
        let rows = sqlx::query(
            "SELECT * FROM emails WHERE mailbox_id = $1 AND folder = $2
             ORDER BY uid DESC NULLS LAST LIMIT $3",
        )
        .bind(mailbox_id)
        .bind(folder)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(email_from_row).collect()
    }

    pub async fn list_by_thread(&self, thread_id: &str) -> MailResult<Vec<Email>> {
        let rows = sqlx::query(
            "SELECT * FROM emails WHERE thread_id = $1 ORDER BY COALESCE(received_at, sent_at, created_at)",
        )
        .bind(thread_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(email_from_row).collect()
    }

    /// Simple subject/body search within a mailbox
    pub async fn search(&self, mailbox_id: &str, query: &str, limit: i64) -> MailResult<Vec<Email>> {
        let pattern = format!("%{}%", query);
        let rows = sqlx::query(
            "SELECT * FROM emails
             WHERE mailbox_id = $1 AND (subject ILIKE $2 OR body_text ILIKE $2)
             ORDER BY created_at DESC LIMIT $3",
        )
        .bind(mailbox_id)
        .bind(pattern)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(email_from_row).collect()
    }

    /// Outbound rows ready for dispatch: everything queued, plus
    /// scheduled rows whose time has elapsed.
    pub async fn list_due_for_dispatch(&self, now: DateTime<Utc>, limit: i64) -> MailResult<Vec<Email>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM emails
            WHERE direction = 'outbound'
              AND (status = 'queued' OR (status = 'scheduled' AND scheduled_for <= $1))
              AND (last_attempt_at IS NULL OR last_attempt_at <= $1 - interval '1 minute')
            ORDER BY COALESCE(scheduled_for, created_at)
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(email_from_row).collect()
    }

    /// Record a dispatch outcome
    pub async fn update_status(
        &self,
        id: &str,
        status: EmailStatus,
        send_attempts: i32,
        last_attempt_at: Option<DateTime<Utc>>,
        sent_at: Option<DateTime<Utc>>,
    ) -> MailResult<()> {
        sqlx::query(
            r#"
            UPDATE emails SET
                status = $2,
                send_attempts = $3,
                last_attempt_at = COALESCE($4, last_attempt_at),
                sent_at = COALESCE($5, sent_at),
                updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(send_attempts)
        .bind(last_attempt_at)
        .bind(sent_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Re-home an email onto another thread (orphan resolution)
    pub async fn update_thread(&self, id: &str, thread_id: &str) -> MailResult<()> {
        sqlx::query("UPDATE emails SET thread_id = $2, updated_at = $3 WHERE id = $1")
            .bind(id)
            .bind(thread_id)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Flag that at least one attachment references this email
    pub async fn mark_has_attachments(&self, id: &str) -> MailResult<()> {
        sqlx::query("UPDATE emails SET has_attachments = TRUE, updated_at = $2 WHERE id = $1")
            .bind(id)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn email_from_row(row: &PgRow) -> MailResult<Email> {
    let direction: String = row.try_get("direction")?;
    let status: String = row.try_get("status")?;
    let classification: Option<String> = row.try_get("classification")?;

    Ok(Email {
        id: row.try_get("id")?,
        mailbox_id: row.try_get("mailbox_id")?,
        direction: Direction::from_str(&direction).map_err(MailError::internal)?,
        status: EmailStatus::from_str(&status).map_err(MailError::internal)?,
        folder: row.try_get("folder")?,
        uid: row.try_get::<Option<i64>, _>("uid")?.map(|u| u as u32),
        message_id: row.try_get("message_id")?,
        in_reply_to: row.try_get("in_reply_to")?,
        references: serde_json::from_value(row.try_get("references_list")?)?,
        thread_id: row.try_get("thread_id")?,
        from: serde_json::from_value(row.try_get("from_addr")?)?,
        to: serde_json::from_value(row.try_get("to_addrs")?)?,
        cc: serde_json::from_value(row.try_get("cc_addrs")?)?,
        bcc: serde_json::from_value(row.try_get("bcc_addrs")?)?,
        reply_to: row
            .try_get::<Option<serde_json::Value>, _>("reply_to")?
            .map(serde_json::from_value)
            .transpose()?
            .flatten(),
        subject: row.try_get("subject")?,
        body_text: row.try_get("body_text")?,
        body_html: row.try_get("body_html")?,
        raw_headers: row.try_get("raw_headers")?,
        classification: classification
            .map(|c| Classification::from_str(&c).map_err(MailError::internal))
            .transpose()?,
        classification_reason: row.try_get("classification_reason")?,
        has_attachments: row.try_get("has_attachments")?,
        sent_at: row.try_get("sent_at")?,
        received_at: row.try_get("received_at")?,
        scheduled_for: row.try_get("scheduled_for")?,
        last_attempt_at: row.try_get("last_attempt_at")?,
        send_attempts: row.try_get("send_attempts")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
