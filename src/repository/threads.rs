//! Email thread storage

use crate::error::{MailError, MailResult};
use crate::models::{EmailAddress, EmailThread};
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

#[derive(Clone)]
pub struct EmailThreadRepository {
    pool: PgPool,
}

impl EmailThreadRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, thread: &EmailThread) -> MailResult<()> {
        sqlx::query(
            r#"
            INSERT INTO email_threads (
                id, mailbox_id, subject, participants,
                first_message_at, last_message_at, last_message_id,
                has_attachments, viewed_at, done_at, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(&thread.id)
        .bind(&thread.mailbox_id)
        .bind(&thread.subject)
        .bind(serde_json::to_value(&thread.participants)?)
        .bind(thread.first_message_at)
        .bind(thread.last_message_at)
        .bind(&thread.last_message_id)
        .bind(thread.has_attachments)
        .bind(thread.viewed_at)
        .bind(thread.done_at)
        .bind(thread.created_at)
        .bind(thread.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get(&self, id: &str) -> MailResult<EmailThread> {
        let row = sqlx::query("SELECT * FROM email_threads WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => thread_from_row(&row),
            None => Err(MailError::not_found("thread", id)),
        }
    }

    pub async fn list_by_mailboxes(
        &self,
        mailbox_ids: &[String],
        limit: i64,
    ) -> MailResult<Vec<EmailThread>> {
        let rows = sqlx::query(
            "SELECT * FROM email_threads WHERE mailbox_id = ANY($1)
             ORDER BY last_message_at DESC NULLS LAST LIMIT $2",
        )
        .bind(mailbox_ids)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(thread_from_row).collect()
    }

    /// Most recent thread in the mailbox whose normalized subject matches,
    /// looking back `window_days` from `now`.
    pub async fn find_by_subject_and_mailbox(
        &self,
        mailbox_id: &str,
        normalized_subject: &str,
        now: DateTime<Utc>,
        window_days: i64,
    ) -> MailResult<Option<EmailThread>> {
        let cutoff = now - Duration::days(window_days);
        let row = sqlx::query(
            r#"
            SELECT * FROM email_threads
            WHERE mailbox_id = $1
              AND lower(subject) = lower($2)
              AND last_message_at >= $3
            ORDER BY last_message_at DESC
            LIMIT 1
            "#,
        )
        .bind(mailbox_id)
        .bind(normalized_subject)
        .bind(cutoff)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| thread_from_row(&row)).transpose()
    }

    /// Update a thread after appending a message: timestamps, last message
    /// pointer, participant union, attachment flag.
    pub async fn record_message(
        &self,
        thread_id: &str,
        message_email_id: &str,
        message_at: DateTime<Utc>,
        participants: &[EmailAddress],
        has_attachments: bool,
    ) -> MailResult<()> {
        let thread = self.get(thread_id).await?;

        let mut merged = thread.participants.clone();
        for p in participants {
            if !merged
                .iter()
                .any(|existing| existing.address.eq_ignore_ascii_case(&p.address))
            {
                merged.push(p.clone());
            }
        }

        let first = match thread.first_message_at {
            Some(existing) if existing <= message_at => existing,
            _ => message_at,
        };
        let advance_last = thread
            .last_message_at
            .map_or(true, |existing| message_at >= existing);

        sqlx::query(
            r#"
            UPDATE email_threads SET
                participants = $2,
                first_message_at = $3,
                last_message_at = CASE WHEN $4 THEN $5 ELSE last_message_at END,
                last_message_id = CASE WHEN $4 THEN $6 ELSE last_message_id END,
                has_attachments = has_attachments OR $7,
                updated_at = $8
            WHERE id = $1
            "#,
        )
        .bind(thread_id)
        .bind(serde_json::to_value(&merged)?)
        .bind(first)
        .bind(advance_last)
        .bind(message_at)
        .bind(message_email_id)
        .bind(has_attachments)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn mark_viewed(&self, id: &str) -> MailResult<()> {
        let now = Utc::now();
        sqlx::query("UPDATE email_threads SET viewed_at = $2, updated_at = $2 WHERE id = $1")
            .bind(id)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_done(&self, id: &str) -> MailResult<()> {
        let now = Utc::now();
        sqlx::query("UPDATE email_threads SET done_at = $2, updated_at = $2 WHERE id = $1")
            .bind(id)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn thread_from_row(row: &PgRow) -> MailResult<EmailThread> {
    Ok(EmailThread {
        id: row.try_get("id")?,
        mailbox_id: row.try_get("mailbox_id")?,
        subject: row.try_get("subject")?,
        participants: serde_json::from_value(row.try_get("participants")?)?,
        first_message_at: row.try_get("first_message_at")?,
        last_message_at: row.try_get("last_message_at")?,
        last_message_id: row.try_get("last_message_id")?,
        has_attachments: row.try_get("has_attachments")?,
        viewed_at: row.try_get("viewed_at")?,
        done_at: row.try_get("done_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
