//! Folder sync checkpoint storage

use crate::error::MailResult;
use crate::models::FolderSyncState;
use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

#[derive(Clone)]
pub struct FolderSyncStateRepository {
    pool: PgPool,
}

impl FolderSyncStateRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Checkpoint for one (mailbox, folder) pair, if any
    pub async fn get(&self, mailbox_id: &str, folder: &str) -> MailResult<Option<FolderSyncState>> {
        let row = sqlx::query(
            "SELECT * FROM mailbox_sync_states WHERE mailbox_id = $1 AND folder = $2",
        )
        .bind(mailbox_id)
        .bind(folder)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| state_from_row(&row)).transpose()
    }

    /// Upsert the checkpoint. The synchronizer only calls this after a
    /// batch has fully drained, so `last_uid` is monotonically
    /// non-decreasing except for a deliberate UIDVALIDITY reset.
    pub async fn save(&self, state: &FolderSyncState) -> MailResult<()> {
        sqlx::query(
            r#"
            INSERT INTO mailbox_sync_states (mailbox_id, folder, last_uid, uid_validity, last_synced_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (mailbox_id, folder) DO UPDATE SET
                last_uid = EXCLUDED.last_uid,
                uid_validity = EXCLUDED.uid_validity,
                last_synced_at = EXCLUDED.last_synced_at
            "#,
        )
        .bind(&state.mailbox_id)
        .bind(&state.folder)
        .bind(state.last_uid as i64)
        .bind(state.uid_validity.map(|v| v as i64))
        .bind(state.last_synced_at.unwrap_or_else(Utc::now))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn delete_all_for_mailbox(&self, mailbox_id: &str) -> MailResult<()> {
        sqlx::query("DELETE FROM mailbox_sync_states WHERE mailbox_id = $1")
            .bind(mailbox_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_all(&self) -> MailResult<Vec<FolderSyncState>> {
        let rows = sqlx::query("SELECT * FROM mailbox_sync_states ORDER BY mailbox_id, folder")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(state_from_row).collect()
    }
}

fn state_from_row(row: &PgRow) -> MailResult<FolderSyncState> {
    Ok(FolderSyncState {
        mailbox_id: row.try_get("mailbox_id")?,
        folder: row.try_get("folder")?,
        last_uid: row.try_get::<i64, _>("last_uid")? as u32,
        uid_validity: row
            .try_get::<Option<i64>, _>("uid_validity")?
            .map(|v| v as u32),
        last_synced_at: row.try_get("last_synced_at")?,
    })
}
