//! Opaque byte-blob interface for attachment content
//!
//! The real backend is object storage; the core only sees these four
//! operations. An in-memory implementation backs tests and local runs.

use crate::error::{MailError, MailResult};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Byte-blob operations the core consumes
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> MailResult<()>;
    async fn download(&self, key: &str) -> MailResult<Vec<u8>>;
    async fn delete(&self, key: &str) -> MailResult<()>;
    fn public_url(&self, key: &str) -> String;
}

/// In-memory blob store
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, (Vec<u8>, String)>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> MailResult<()> {
        self.blobs
            .write()
            .await
            .insert(key.to_string(), (bytes, content_type.to_string()));
        Ok(())
    }

    async fn download(&self, key: &str) -> MailResult<Vec<u8>> {
        self.blobs
            .read()
            .await
            .get(key)
            .map(|(bytes, _)| bytes.clone())
            .ok_or_else(|| MailError::not_found("blob", key))
    }

    async fn delete(&self, key: &str) -> MailResult<()> {
        self.blobs.write().await.remove(key);
        Ok(())
    }

    fn public_url(&self, key: &str) -> String {
        format!("memory://{}", key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upload_download_delete() {
        let store = MemoryBlobStore::new();
        store
            .upload("attachments/att_1", b"bytes".to_vec(), "application/pdf")
            .await
            .unwrap();
        assert_eq!(store.download("attachments/att_1").await.unwrap(), b"bytes");

        store.delete("attachments/att_1").await.unwrap();
        assert!(store.download("attachments/att_1").await.is_err());
    }
}
