// tests/common/mock_inbox.rs
//! Inbox that records every message it is handed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use beadhub_events::outbox::{DeliveredMessage, DeliveryError, InboxDelivery, InboxMessage};

#[derive(Default)]
pub struct MockInbox {
    messages: Mutex<Vec<InboxMessage>>,
    next_id: AtomicUsize,
    /// Simulated delivery latency, giving concurrent workers a chance to overlap.
    pub latency: Option<Duration>,
}

impl MockInbox {
    pub fn slow(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    pub fn messages(&self) -> Vec<InboxMessage> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl InboxDelivery for MockInbox {
    async fn deliver(&self, message: InboxMessage) -> Result<DeliveredMessage, DeliveryError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.messages.lock().unwrap().push(message);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(DeliveredMessage {
            message_id: format!("mock-{id}"),
            created_at: chrono::Utc::now(),
        })
    }
}
