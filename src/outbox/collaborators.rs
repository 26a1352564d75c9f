//! Interfaces to the services the outbox depends on but does not own.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    pub workspace_id: String,
    pub alias: String,
}

/// Identity notifications are sent as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderIdentity {
    pub agent_id: String,
    pub alias: String,
}

impl SenderIdentity {
    pub fn new(agent_id: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            alias: alias.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InboxMessage {
    pub tenant_id: String,
    pub from_agent_id: String,
    pub from_alias: String,
    pub to_workspace_id: String,
    pub subject: String,
    pub body: String,
    pub priority: String,
    pub thread_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredMessage {
    pub message_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("subscriber directory unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Recipient workspace not found or deleted")]
    RecipientMissing,
    #[error("recipient lookup failed: {0}")]
    Directory(#[from] DirectoryError),
    #[error("unreadable notification payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("inbox delivery failed: {0}")]
    Inbox(String),
}

#[async_trait]
pub trait SubscriberDirectory: Send + Sync {
    /// Subscribers of `item_id` for `event_type`, optionally narrowed to a
    /// repository scope.
    async fn subscribers_for_item(
        &self,
        tenant_id: &str,
        item_id: &str,
        event_type: &str,
        scope: Option<&str>,
    ) -> Result<Vec<Subscriber>, DirectoryError>;

    /// False for workspaces that were deleted or never existed.
    async fn is_recipient_active(
        &self,
        tenant_id: &str,
        workspace_id: &str,
    ) -> Result<bool, DirectoryError>;
}

#[async_trait]
pub trait InboxDelivery: Send + Sync {
    async fn deliver(&self, message: InboxMessage) -> Result<DeliveredMessage, DeliveryError>;
}
