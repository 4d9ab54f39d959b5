//! Mailbox configuration storage

use crate::error::{MailError, MailResult};
use crate::models::{ConnectionStatus, Endpoint, Mailbox, Security};
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::str::FromStr;

#[derive(Clone)]
pub struct MailboxRepository {
    pool: PgPool,
}

impl MailboxRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// All mailboxes that have not been soft-deleted
    pub async fn list(&self) -> MailResult<Vec<Mailbox>> {
        let rows = sqlx::query(
            "SELECT * FROM mailboxes WHERE deleted_at IS NULL ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(mailbox_from_row).collect()
    }

    pub async fn get_by_id(&self, id: &str) -> MailResult<Mailbox> {
        let row = sqlx::query("SELECT * FROM mailboxes WHERE id = $1 AND deleted_at IS NULL")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => mailbox_from_row(&row),
            None => Err(MailError::not_found("mailbox", id)),
        }
    }

    pub async fn get_by_address(&self, tenant: &str, address: &str) -> MailResult<Mailbox> {
        let row = sqlx::query(
            "SELECT * FROM mailboxes
             WHERE tenant = $1 AND lower(email_address) = lower($2) AND deleted_at IS NULL",
        )
        .bind(tenant)
        .bind(address)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => mailbox_from_row(&row),
            None => Err(MailError::not_found("mailbox", address)),
        }
    }

    /// Insert or update the full configuration
    pub async fn save(&self, mailbox: &Mailbox) -> MailResult<()> {
        sqlx::query(
            r#"
            INSERT INTO mailboxes (
                id, tenant, user_id, provider, email_address,
                imap_host, imap_port, imap_username, imap_secret, imap_security,
                smtp_host, smtp_port, smtp_username, smtp_secret, smtp_security,
                sync_folders, inbound_enabled, outbound_enabled, sender_id,
                send_quota_daily, send_count, quota_reset_at,
                connection_status, connection_error, last_connected_at,
                created_at, updated_at, deleted_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28
            )
            ON CONFLICT (id) DO UPDATE SET
                tenant = EXCLUDED.tenant,
                user_id = EXCLUDED.user_id,
                provider = EXCLUDED.provider,
                email_address = EXCLUDED.email_address,
                imap_host = EXCLUDED.imap_host,
                imap_port = EXCLUDED.imap_port,
                imap_username = EXCLUDED.imap_username,
                imap_secret = EXCLUDED.imap_secret,
                imap_security = EXCLUDED.imap_security,
                smtp_host = EXCLUDED.smtp_host,
                smtp_port = EXCLUDED.smtp_port,
                smtp_username = EXCLUDED.smtp_username,
                smtp_secret = EXCLUDED.smtp_secret,
                smtp_security = EXCLUDED.smtp_security,
                sync_folders = EXCLUDED.sync_folders,
                inbound_enabled = EXCLUDED.inbound_enabled,
                outbound_enabled = EXCLUDED.outbound_enabled,
                sender_id = EXCLUDED.sender_id,
                send_quota_daily = EXCLUDED.send_quota_daily,
                send_count = EXCLUDED.send_count,
                quota_reset_at = EXCLUDED.quota_reset_at,
                updated_at = EXCLUDED.updated_at,
                deleted_at = EXCLUDED.deleted_at
            "#,
        )
        .bind(&mailbox.id)
        .bind(&mailbox.tenant)
        .bind(&mailbox.user_id)
        .bind(&mailbox.provider)
        .bind(&mailbox.email_address)
        .bind(&mailbox.imap.host)
        .bind(mailbox.imap.port as i32)
        .bind(&mailbox.imap.username)
        .bind(mailbox.imap.secret.expose_secret())
        .bind(mailbox.imap.security.as_str())
        .bind(&mailbox.smtp.host)
        .bind(mailbox.smtp.port as i32)
        .bind(&mailbox.smtp.username)
        .bind(mailbox.smtp.secret.expose_secret())
        .bind(mailbox.smtp.security.as_str())
        .bind(serde_json::to_value(&mailbox.sync_folders)?)
        .bind(mailbox.inbound_enabled)
        .bind(mailbox.outbound_enabled)
        .bind(&mailbox.sender_id)
        .bind(mailbox.send_quota_daily)
        .bind(mailbox.send_count)
        .bind(mailbox.quota_reset_at)
        .bind(mailbox.connection_status.as_str())
        .bind(&mailbox.connection_error)
        .bind(mailbox.last_connected_at)
        .bind(mailbox.created_at)
        .bind(mailbox.updated_at)
        .bind(mailbox.deleted_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Soft delete; supervisors drop the mailbox on their next config pass
    pub async fn delete(&self, id: &str) -> MailResult<()> {
        let result = sqlx::query(
            "UPDATE mailboxes SET deleted_at = $2, updated_at = $2 WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(MailError::not_found("mailbox", id));
        }
        Ok(())
    }

    /// Persist the connection-status snapshot. The supervisor is the only
    /// caller, which keeps these fields single-writer.
    pub async fn update_connection_status(
        &self,
        id: &str,
        status: ConnectionStatus,
        error: Option<&str>,
    ) -> MailResult<()> {
        let now = Utc::now();
        let connected_at = if status == ConnectionStatus::Connected {
            Some(now)
        } else {
            None
        };

        sqlx::query(
            r#"
            UPDATE mailboxes SET
                connection_status = $2,
                connection_error = $3,
                last_connected_at = COALESCE($4, last_connected_at),
                updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(error)
        .bind(connected_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Bump the daily send counter, resetting it when the window rolled over
    pub async fn increment_send_count(&self, id: &str, now: DateTime<Utc>) -> MailResult<()> {
        sqlx::query(
            r#"
            UPDATE mailboxes SET
                send_count = CASE
                    WHEN quota_reset_at IS NULL OR quota_reset_at <= $2 THEN 1
                    ELSE send_count + 1
                END,
                quota_reset_at = CASE
                    WHEN quota_reset_at IS NULL OR quota_reset_at <= $2
                        THEN date_trunc('day', $2) + interval '1 day'
                    ELSE quota_reset_at
                END,
                updated_at = $2
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn mailbox_from_row(row: &PgRow) -> MailResult<Mailbox> {
    let sync_folders: serde_json::Value = row.try_get("sync_folders")?;
    let status: String = row.try_get("connection_status")?;

    Ok(Mailbox {
        id: row.try_get("id")?,
        tenant: row.try_get("tenant")?,
        user_id: row.try_get("user_id")?,
        provider: row.try_get("provider")?,
        email_address: row.try_get("email_address")?,
        imap: Endpoint {
            host: row.try_get("imap_host")?,
            port: row.try_get::<i32, _>("imap_port")? as u16,
            username: row.try_get("imap_username")?,
            secret: SecretString::new(row.try_get("imap_secret")?),
            security: parse_security(row.try_get("imap_security")?)?,
        },
        smtp: Endpoint {
            host: row.try_get("smtp_host")?,
            port: row.try_get::<i32, _>("smtp_port")? as u16,
            username: row.try_get("smtp_username")?,
            secret: SecretString::new(row.try_get("smtp_secret")?),
            security: parse_security(row.try_get("smtp_security")?)?,
        },
        sync_folders: serde_json::from_value(sync_folders)?,
        inbound_enabled: row.try_get("inbound_enabled")?,
        outbound_enabled: row.try_get("outbound_enabled")?,
        sender_id: row.try_get("sender_id")?,
        send_quota_daily: row.try_get("send_quota_daily")?,
        send_count: row.try_get("send_count")?,
        quota_reset_at: row.try_get("quota_reset_at")?,
        connection_status: ConnectionStatus::from_str(&status)
            .map_err(MailError::internal)?,
        connection_error: row.try_get("connection_error")?,
        last_connected_at: row.try_get("last_connected_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        deleted_at: row.try_get("deleted_at")?,
    })
}

fn parse_security(value: String) -> MailResult<Security> {
    Security::from_str(&value).map_err(MailError::internal)
}
