//! Event bus interface consumed by the core
//!
//! The broker wiring lives outside the core; the engine only needs
//! these four operations. A tracing-backed implementation is provided
//! for local runs and tests.

use crate::error::MailResult;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Topic emitted for every ingested message
pub const TOPIC_MAIL_RECEIVED: &str = "mail.received";
/// Topic emitted after an outbound dispatch attempt
pub const TOPIC_MAIL_SENT: &str = "mail.sent";

/// Payload of a `mail.received` event
#[derive(Debug, Clone, Serialize)]
pub struct MailReceived {
    pub mailbox_id: String,
    pub email_id: String,
    pub thread_id: String,
    pub classification: String,
}

/// Handler invoked for each message on a subscribed queue
pub type EventHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// The bus operations the core consumes
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Broadcast to every consumer interested in the entity
    async fn publish_fanout(
        &self,
        entity_id: &str,
        entity_type: &str,
        payload: Value,
    ) -> MailResult<()>;

    /// Deliver to a single named consumer
    async fn publish_direct(
        &self,
        entity_id: &str,
        entity_type: &str,
        payload: Value,
    ) -> MailResult<()>;

    /// User-facing notification channel
    async fn publish_notification(
        &self,
        entity_id: &str,
        entity_type: &str,
        payload: Value,
    ) -> MailResult<()>;

    /// Register a handler on a named queue
    async fn subscribe(&self, queue: &str, handler: EventHandler) -> MailResult<()>;
}

/// Bus implementation that logs every publication and records it in
/// memory. Used when no broker is configured, and by tests to assert
/// on emitted events.
#[derive(Default)]
pub struct LoggingEventBus {
    published: Mutex<Vec<(String, String, Value)>>,
}

impl LoggingEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything published so far as (entity_type, entity_id, payload)
    pub async fn published(&self) -> Vec<(String, String, Value)> {
        self.published.lock().await.clone()
    }
}

#[async_trait]
impl EventBus for LoggingEventBus {
    async fn publish_fanout(
        &self,
        entity_id: &str,
        entity_type: &str,
        payload: Value,
    ) -> MailResult<()> {
        tracing::debug!(entity_id, entity_type, "fanout event");
        self.published
            .lock()
            .await
            .push((entity_type.to_string(), entity_id.to_string(), payload));
        Ok(())
    }

    async fn publish_direct(
        &self,
        entity_id: &str,
        entity_type: &str,
        payload: Value,
    ) -> MailResult<()> {
        tracing::debug!(entity_id, entity_type, "direct event");
        self.published
            .lock()
            .await
            .push((entity_type.to_string(), entity_id.to_string(), payload));
        Ok(())
    }

    async fn publish_notification(
        &self,
        entity_id: &str,
        entity_type: &str,
        payload: Value,
    ) -> MailResult<()> {
        tracing::debug!(entity_id, entity_type, "notification event");
        self.published
            .lock()
            .await
            .push((entity_type.to_string(), entity_id.to_string(), payload));
        Ok(())
    }

    async fn subscribe(&self, queue: &str, _handler: EventHandler) -> MailResult<()> {
        tracing::debug!(queue, "subscribe requested on logging bus");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_logging_bus_records_publications() {
        let bus = LoggingEventBus::new();
        bus.publish_fanout("email_1", TOPIC_MAIL_RECEIVED, json!({"ok": true}))
            .await
            .unwrap();

        let published = bus.published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, TOPIC_MAIL_RECEIVED);
        assert_eq!(published[0].1, "email_1");
    }
}
