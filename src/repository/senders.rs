//! Sender profile storage

use crate::error::{MailError, MailResult};
use crate::models::Sender;
use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

#[derive(Clone)]
pub struct SenderRepository {
    pool: PgPool,
}

impl SenderRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, sender: &Sender) -> MailResult<()> {
        sqlx::query(
            r#"
            INSERT INTO senders (
                id, mailbox_id, user_id, display_name, signature,
                is_default, is_active, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&sender.id)
        .bind(&sender.mailbox_id)
        .bind(&sender.user_id)
        .bind(&sender.display_name)
        .bind(&sender.signature)
        .bind(sender.is_default)
        .bind(sender.is_active)
        .bind(sender.created_at)
        .bind(sender.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get(&self, id: &str) -> MailResult<Sender> {
        let row = sqlx::query("SELECT * FROM senders WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => sender_from_row(&row),
            None => Err(MailError::not_found("sender", id)),
        }
    }

    pub async fn list_by_mailbox(&self, mailbox_id: &str) -> MailResult<Vec<Sender>> {
        let rows = sqlx::query("SELECT * FROM senders WHERE mailbox_id = $1 ORDER BY created_at")
            .bind(mailbox_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(sender_from_row).collect()
    }

    pub async fn update(&self, sender: &Sender) -> MailResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE senders SET
                display_name = $2,
                signature = $3,
                is_default = $4,
                is_active = $5,
                updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(&sender.id)
        .bind(&sender.display_name)
        .bind(&sender.signature)
        .bind(sender.is_default)
        .bind(sender.is_active)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(MailError::not_found("sender", &sender.id));
        }
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> MailResult<()> {
        sqlx::query("DELETE FROM senders WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Make one profile the default for its mailbox, clearing the rest
    pub async fn set_default(&self, mailbox_id: &str, sender_id: &str) -> MailResult<()> {
        let now = Utc::now();
        sqlx::query(
            "UPDATE senders SET is_default = (id = $2), updated_at = $3 WHERE mailbox_id = $1",
        )
        .bind(mailbox_id)
        .bind(sender_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_active(&self, id: &str, active: bool) -> MailResult<()> {
        sqlx::query("UPDATE senders SET is_active = $2, updated_at = $3 WHERE id = $1")
            .bind(id)
            .bind(active)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn sender_from_row(row: &PgRow) -> MailResult<Sender> {
    Ok(Sender {
        id: row.try_get("id")?,
        mailbox_id: row.try_get("mailbox_id")?,
        user_id: row.try_get("user_id")?,
        display_name: row.try_get("display_name")?,
        signature: row.try_get("signature")?,
        is_default: row.try_get("is_default")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
