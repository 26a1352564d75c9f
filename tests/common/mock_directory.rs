// tests/common/mock_directory.rs
//! Subscriber directory backed by a fixed subscription table.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use beadhub_events::outbox::{DirectoryError, Subscriber, SubscriberDirectory};

#[derive(Default)]
pub struct MockDirectory {
    by_item: Mutex<HashMap<String, Vec<Subscriber>>>,
    deleted: Mutex<HashSet<String>>,
}

impl MockDirectory {
    pub fn with_subscription(self, item_id: &str, workspace_id: &str, alias: &str) -> Self {
        self.by_item
            .lock()
            .unwrap()
            .entry(item_id.to_string())
            .or_default()
            .push(Subscriber {
                workspace_id: workspace_id.to_string(),
                alias: alias.to_string(),
            });
        self
    }

    pub fn delete_workspace(&self, workspace_id: &str) {
        self.deleted.lock().unwrap().insert(workspace_id.to_string());
    }
}

#[async_trait]
impl SubscriberDirectory for MockDirectory {
    async fn subscribers_for_item(
        &self,
        _tenant_id: &str,
        item_id: &str,
        _event_type: &str,
        _scope: Option<&str>,
    ) -> Result<Vec<Subscriber>, DirectoryError> {
        Ok(self
            .by_item
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
        Ok(!self.deleted.lock().unwrap().contains(workspace_id))
    }
}
