//! Orphaned Message-ID reference storage

use crate::error::MailResult;
use crate::models::OrphanEmail;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

#[derive(Clone)]
pub struct OrphanEmailRepository {
    pool: PgPool,
}

impl OrphanEmailRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record a dangling reference. One row per
    /// (referenced Message-ID, referencing email); duplicates are ignored.
    pub async fn create(&self, orphan: &OrphanEmail) -> MailResult<()> {
        sqlx::query(
            r#"
            INSERT INTO orphan_emails (
                id, mailbox_id, referenced_message_id, referencing_email_id,
                thread_id, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (referenced_message_id, referencing_email_id) DO NOTHING
            "#,
        )
        .bind(&orphan.id)
        .bind(&orphan.mailbox_id)
        .bind(&orphan.referenced_message_id)
        .bind(&orphan.referencing_email_id)
        .bind(&orphan.thread_id)
        .bind(orphan.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Orphans waiting on a particular Message-ID, used when the parent arrives
    pub async fn list_by_referenced_message_id(
        &self,
        message_id: &str,
    ) -> MailResult<Vec<OrphanEmail>> {
        let rows = sqlx::query(
            "SELECT * FROM orphan_emails WHERE referenced_message_id = $1 ORDER BY created_at",
        )
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(orphan_from_row).collect()
    }

    pub async fn list_by_thread(&self, thread_id: &str) -> MailResult<Vec<OrphanEmail>> {
        let rows = sqlx::query("SELECT * FROM orphan_emails WHERE thread_id = $1")
            .bind(thread_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(orphan_from_row).collect()
    }

    pub async fn delete_by_thread(&self, thread_id: &str) -> MailResult<()> {
        sqlx::query("DELETE FROM orphan_emails WHERE thread_id = $1")
            .bind(thread_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete resolved references once the parent has been ingested
    pub async fn delete_by_referenced_message_id(&self, message_id: &str) -> MailResult<()> {
        sqlx::query("DELETE FROM orphan_emails WHERE referenced_message_id = $1")
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// TTL expiry for references whose parent never arrived
    pub async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> MailResult<u64> {
        let result = sqlx::query("DELETE FROM orphan_emails WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn orphan_from_row(row: &PgRow) -> MailResult<OrphanEmail> {
    Ok(OrphanEmail {
        id: row.try_get("id")?,
        mailbox_id: row.try_get("mailbox_id")?,
        referenced_message_id: row.try_get("referenced_message_id")?,
        referencing_email_id: row.try_get("referencing_email_id")?,
        thread_id: row.try_get("thread_id")?,
        created_at: row.try_get("created_at")?,
    })
}
