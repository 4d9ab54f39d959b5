//! In-memory per-mailbox health snapshots
//!
//! Best-effort observational state only, never the source of truth.
//! Folder stats are written by the synchronizers, connection state by
//! the supervisors; readers always get a deep copy.

use crate::models::ConnectionStatus;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Health of one synchronized folder
#[derive(Debug, Clone, Default)]
pub struct FolderHealth {
    pub total: u32,
    pub unseen: u32,
    pub last_seen_uid: u32,
    pub last_sync: Option<DateTime<Utc>>,
}

/// Health of one mailbox
#[derive(Debug, Clone)]
pub struct MailboxHealth {
    pub status: ConnectionStatus,
    pub last_error: Option<String>,
    pub last_checked: DateTime<Utc>,
    pub folders: HashMap<String, FolderHealth>,
}

impl MailboxHealth {
    pub fn connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }
}

impl Default for MailboxHealth {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Pending,
            last_error: None,
            last_checked: Utc::now(),
            folders: HashMap::new(),
        }
    }
}

/// Thread-safe registry of mailbox health snapshots
#[derive(Clone, Default)]
pub struct StatusRegistry {
    inner: Arc<RwLock<HashMap<String, MailboxHealth>>>,
}

impl StatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a connection-state change (supervisor only)
    pub async fn set_connection(
        &self,
        mailbox_id: &str,
        status: ConnectionStatus,
        error: Option<String>,
    ) {
        let mut inner = self.inner.write().await;
        let health = inner.entry(mailbox_id.to_string()).or_default();
        health.status = status;
        health.last_error = error;
        health.last_checked = Utc::now();
    }

    /// Record folder counters after a sync pass (synchronizer only)
    pub async fn set_folder(&self, mailbox_id: &str, folder: &str, stats: FolderHealth) {
        let mut inner = self.inner.write().await;
        let health = inner.entry(mailbox_id.to_string()).or_default();
        health.folders.insert(folder.to_string(), stats);
        health.last_checked = Utc::now();
    }

    /// Deep-copied snapshot for one mailbox
    pub async fn get(&self, mailbox_id: &str) -> Option<MailboxHealth> {
        self.inner.read().await.get(mailbox_id).cloned()
    }

    /// Deep-copied snapshot of the whole fleet
    pub async fn snapshot(&self) -> HashMap<String, MailboxHealth> {
        self.inner.read().await.clone()
    }

    /// Remove a mailbox on supervisor shutdown or deletion
    pub async fn unregister(&self, mailbox_id: &str) {
        self.inner.write().await.remove(mailbox_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connection_updates() {
        let registry = StatusRegistry::new();
        registry
            .set_connection("mbox_1", ConnectionStatus::Connected, None)
            .await;

        let health = registry.get("mbox_1").await.unwrap();
        assert!(health.connected());
        assert!(health.last_error.is_none());

        registry
            .set_connection(
                "mbox_1",
                ConnectionStatus::Disconnected,
                Some("connection reset".into()),
            )
            .await;
        let health = registry.get("mbox_1").await.unwrap();
        assert!(!health.connected());
        assert_eq!(health.last_error.as_deref(), Some("connection reset"));
    }

    #[tokio::test]
    async fn test_folder_stats_and_snapshot_isolation() {
        let registry = StatusRegistry::new();
        registry
            .set_folder(
                "mbox_1",
                "INBOX",
                FolderHealth {
                    total: 10,
                    unseen: 2,
                    last_seen_uid: 42,
                    last_sync: Some(Utc::now()),
                },
            )
            .await;

        // Mutating the returned copy must not affect the registry
        let mut copy = registry.get("mbox_1").await.unwrap();
        copy.folders.get_mut("INBOX").unwrap().last_seen_uid = 0;

        let fresh = registry.get("mbox_1").await.unwrap();
        assert_eq!(fresh.folders["INBOX"].last_seen_uid, 42);
    }

    #[tokio::test]
    async fn test_unregister() {
        let registry = StatusRegistry::new();
        registry
            .set_connection("mbox_1", ConnectionStatus::Connected, None)
            .await;
        registry.unregister("mbox_1").await;
        assert!(registry.get("mbox_1").await.is_none());
    }
}
