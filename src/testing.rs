//! In-memory stand-ins for the outbox's external collaborators.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::outbox::{
    DeliveredMessage, DeliveryError, DirectoryError, InboxDelivery, InboxMessage, Subscriber,
    SubscriberDirectory,
};

type Lookup = (String, String, Option<String>);

#[derive(Default)]
pub struct FakeDirectory {
    subscriptions: Mutex<HashMap<String, Vec<Subscriber>>>,
    inactive: Mutex<HashSet<String>>,
    lookups: Mutex<Vec<Lookup>>,
    failing: Mutex<bool>,
}

impl FakeDirectory {
    pub fn subscribe(&self, item_id: &str, workspace_id: &str, alias: &str) {
        self.subscriptions
            .lock()
            .unwrap()
            .entry(item_id.to_string())
            .or_default()
            .push(Subscriber {
                workspace_id: workspace_id.to_string(),
                alias: alias.to_string(),
            });
    }

    pub fn deactivate(&self, workspace_id: &str) {
        self.inactive.lock().unwrap().insert(workspace_id.to_string());
    }

    pub fn fail_lookups(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    pub fn lookups(&self) -> Vec<Lookup> {
        self.lookups.lock().unwrap().clone()
    }

    fn check(&self) -> Result<(), DirectoryError> {
        if *self.failing.lock().unwrap() {
            return Err(DirectoryError::Unavailable("directory offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl SubscriberDirectory for FakeDirectory {
    async fn subscribers_for_item(
        &self,
        _tenant_id: &str,
        item_id: &str,
        event_type: &str,
        scope: Option<&str>,
    ) -> Result<Vec<Subscriber>, DirectoryError> {
        self.check()?;
        self.lookups.lock().unwrap().push((
            item_id.to_string(),
            event_type.to_string(),
            scope.map(str::to_string),
        ));
        Ok(self
            .subscriptions
            .lock()
            .unwrap()
            .get(item_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn is_recipient_active(
        &self,
        _tenant_id: &str,
        workspace_id: &str,
    ) -> Result<bool, DirectoryError> {
        self.check()?;
        Ok(!self.inactive.lock().unwrap().contains(workspace_id))
    }
}

#[derive(Default)]
pub struct FakeInbox {
    delivered: Mutex<Vec<InboxMessage>>,
    failures: Mutex<HashMap<String, String>>,
}

impl FakeInbox {
    pub fn delivered(&self) -> Vec<InboxMessage> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn fail_for(&self, workspace_id: &str, error: &str) {
        self.failures
            .lock()
            .unwrap()
            .insert(workspace_id.to_string(), error.to_string());
    }

    pub fn clear_failures(&self) {
        self.failures.lock().unwrap().clear();
    }
}

#[async_trait]
impl InboxDelivery for FakeInbox {
    async fn deliver(&self, message: InboxMessage) -> Result<DeliveredMessage, DeliveryError> {
        if let Some(error) = self.failures.lock().unwrap().get(&message.to_workspace_id) {
            return Err(DeliveryError::Inbox(error.clone()));
        }
        let mut delivered = self.delivered.lock().unwrap();
        delivered.push(message);
        Ok(DeliveredMessage {
            message_id: format!("msg-{}", delivered.len()),
            created_at: Utc::now(),
        })
    }
}
