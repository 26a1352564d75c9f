//! Notification outbox.
//!
//! Bead status changes are turned into durable per-subscriber intents as part
//! of the sync that observed them. Delivery happens later, in batches: each
//! entry is claimed (status `processing`, one more attempt) before anything
//! is sent, so a crash mid-delivery leaves a visible row instead of a lost
//! notification. Failed entries are retried until the attempt budget is
//! spent, then left in place for operators.

mod collaborators;
mod message;
mod worker;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::{to_storage, SharedClock};
use crate::config::HubConfig;
use crate::db::queries::{self, OutboxRow, OutboxStatsRow, OutboxStatus};
use crate::db::{Database, DbError};

pub use collaborators::{
    DeliveredMessage, DeliveryError, DirectoryError, InboxDelivery, InboxMessage, SenderIdentity,
    Subscriber, SubscriberDirectory,
};
pub use message::{thread_id_for_bead, truncate_error, StatusChangePayload};
pub use worker::{OutboxWorker, WorkerHandle, WorkerPass};

pub const OUTBOX_EVENT_STATUS_CHANGE: &str = "bead_status_change";
/// Subscription event type looked up for status changes.
pub const SUBSCRIPTION_EVENT_STATUS_CHANGE: &str = "status_change";

const STALE_CLAIM_REASON: &str = "claim expired before delivery finished";

#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("{0}")]
    Db(#[from] DbError),
    #[error("{0}")]
    Directory(#[from] DirectoryError),
    #[error("payload serialization failed: {0}")]
    Payload(#[from] serde_json::Error),
}

/// A status transition observed while syncing beads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeadStatusChange {
    pub bead_id: String,
    pub repo: Option<String>,
    pub branch: Option<String>,
    /// `None` for a bead seen for the first time.
    pub old_status: Option<String>,
    pub new_status: String,
    pub title: Option<String>,
}

impl BeadStatusChange {
    pub fn is_transition(&self) -> bool {
        self.old_status.is_some()
    }

    fn payload(&self) -> StatusChangePayload {
        StatusChangePayload {
            bead_id: Some(self.bead_id.clone()),
            repo: self.repo.clone(),
            branch: self.branch.clone(),
            old_status: self.old_status.clone(),
            new_status: Some(self.new_status.clone()),
            title: self.title.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxSettings {
    pub max_retry_attempts: u32,
    pub batch_limit: u32,
    pub error_max_len: usize,
    pub retention_days: u32,
    pub stale_claim_age: Duration,
}

impl Default for OutboxSettings {
    fn default() -> Self {
        Self::from_config(&HubConfig::default())
    }
}

impl OutboxSettings {
    pub fn from_config(config: &HubConfig) -> Self {
        Self {
            max_retry_attempts: config.max_retry_attempts,
            batch_limit: config.outbox_batch_limit,
            error_max_len: config.outbox_error_max_len,
            retention_days: config.outbox_retention_days,
            stale_claim_age: config.stale_claim_age(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub sent: usize,
    pub failed: usize,
}

impl BatchOutcome {
    pub fn processed(&self) -> usize {
        self.sent + self.failed
    }
}

#[derive(Clone)]
pub struct NotificationOutbox {
    db: Arc<Database>,
    directory: Arc<dyn SubscriberDirectory>,
    inbox: Arc<dyn InboxDelivery>,
    clock: SharedClock,
    settings: OutboxSettings,
}

impl NotificationOutbox {
    pub fn new(
        db: Arc<Database>,
        directory: Arc<dyn SubscriberDirectory>,
        inbox: Arc<dyn InboxDelivery>,
        clock: SharedClock,
        settings: OutboxSettings,
    ) -> Self {
        Self {
            db,
            directory,
            inbox,
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> &OutboxSettings {
        &self.settings
    }

    /// Record one entry per (transition x subscriber). New beads are skipped.
    ///
    /// All entries are written together: a directory or database failure
    /// records nothing and is returned to the caller.
    pub async fn record_intents(
        &self,
        changes: &[BeadStatusChange],
        tenant_id: &str,
    ) -> Result<usize, OutboxError> {
        let created_at = to_storage(self.clock.now());
        let mut rows = Vec::new();

        for change in changes.iter().filter(|c| c.is_transition()) {
            let subscribers = self
                .directory
                .subscribers_for_item(
                    tenant_id,
                    &change.bead_id,
                    SUBSCRIPTION_EVENT_STATUS_CHANGE,
                    change.repo.as_deref(),
                )
                .await?;
            if subscribers.is_empty() {
                continue;
            }

            let payload_json = serde_json::to_string(&change.payload())?;
            rows.extend(subscribers.into_iter().map(|sub| OutboxRow {
                id: Uuid::new_v4().to_string(),
                tenant_id: tenant_id.to_string(),
                event_type: OUTBOX_EVENT_STATUS_CHANGE.to_string(),
                payload_json: payload_json.clone(),
                recipient_workspace_id: sub.workspace_id,
                recipient_alias: sub.alias,
                status: OutboxStatus::Pending,
                attempts: 0,
                last_error: None,
                message_id: None,
                created_at: created_at.clone(),
                claimed_at: None,
                processed_at: None,
            }));
        }

        if rows.is_empty() {
            return Ok(0);
        }
        let created = queries::insert_outbox_entries(&self.db, &rows)?;
        tracing::debug!("recorded {created} notification intents for tenant {tenant_id}");
        Ok(created)
    }

    /// Claim and deliver up to `limit` eligible entries of one tenant.
    ///
    /// A failed delivery marks only its own entry; the rest of the batch
    /// still runs. Database failures abort the batch.
    pub async fn process_batch(
        &self,
        tenant_id: &str,
        sender: &SenderIdentity,
        limit: u32,
    ) -> Result<BatchOutcome, OutboxError> {
        let claimed = queries::claim_outbox_batch(
            &self.db,
            tenant_id,
            self.settings.max_retry_attempts,
            limit,
            &to_storage(self.clock.now()),
        )?;

        let mut outcome = BatchOutcome::default();
        for entry in claimed {
            match self.deliver(&entry, sender).await {
                Ok(delivered) => {
                    queries::mark_outbox_completed(
                        &self.db,
                        &entry.id,
                        &delivered.message_id,
                        &to_storage(self.clock.now()),
                    )?;
                    outcome.sent += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        "notification {} to {} failed (attempt {}/{}): {e}",
                        entry.id,
                        entry.recipient_workspace_id,
                        entry.attempts,
                        self.settings.max_retry_attempts
                    );
                    let error = truncate_error(&e.to_string(), self.settings.error_max_len);
                    queries::mark_outbox_failed(&self.db, &entry.id, &error)?;
                    outcome.failed += 1;
                }
            }
        }

        if outcome.processed() > 0 {
            tracing::info!(
                "outbox batch for tenant {tenant_id}: {} sent, {} failed",
                outcome.sent,
                outcome.failed
            );
        }
        Ok(outcome)
    }

    async fn deliver(
        &self,
        entry: &OutboxRow,
        sender: &SenderIdentity,
    ) -> Result<DeliveredMessage, DeliveryError> {
        let active = self
            .directory
            .is_recipient_active(&entry.tenant_id, &entry.recipient_workspace_id)
            .await?;
        if !active {
            return Err(DeliveryError::RecipientMissing);
        }

        let payload: StatusChangePayload = serde_json::from_str(&entry.payload_json)?;
        let message = InboxMessage {
            tenant_id: entry.tenant_id.clone(),
            from_agent_id: sender.agent_id.clone(),
            from_alias: sender.alias.clone(),
            to_workspace_id: entry.recipient_workspace_id.clone(),
            subject: payload.subject(),
            body: payload.body(),
            priority: "normal".to_string(),
            thread_id: thread_id_for_bead(payload.bead_id()).to_string(),
        };
        self.inbox.deliver(message).await
    }

    /// Delete completed entries processed more than `days_old` days ago.
    pub async fn cleanup(&self, tenant_id: &str, days_old: u32) -> Result<usize, OutboxError> {
        let cutoff = self.clock.now() - chrono::Duration::days(i64::from(days_old));
        let deleted = queries::delete_completed_outbox_before(&self.db, tenant_id, &to_storage(cutoff))?;
        if deleted > 0 {
            tracing::info!("removed {deleted} completed notifications for tenant {tenant_id}");
        }
        Ok(deleted)
    }

    /// Return entries whose claim outlived `stale_claim_age` to the retry pool.
    pub async fn requeue_stale(&self) -> Result<usize, OutboxError> {
        let age = chrono::Duration::from_std(self.settings.stale_claim_age)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let cutoff = to_storage(self.clock.now() - age);
        let requeued = queries::requeue_stale_outbox_claims(&self.db, &cutoff, STALE_CLAIM_REASON)?;
        if requeued > 0 {
            tracing::warn!("requeued {requeued} stale outbox claims");
        }
        Ok(requeued)
    }

    pub async fn tenants_with_work(&self) -> Result<Vec<String>, OutboxError> {
        Ok(queries::tenants_with_eligible_outbox(
            &self.db,
            self.settings.max_retry_attempts,
        )?)
    }

    pub async fn stats(&self, tenant_id: &str) -> Result<OutboxStatsRow, OutboxError> {
        Ok(queries::outbox_stats(
            &self.db,
            tenant_id,
            self.settings.max_retry_attempts,
        )?)
    }

    pub async fn get(&self, id: &str) -> Result<Option<OutboxRow>, OutboxError> {
        Ok(queries::get_outbox_entry(&self.db, id)?)
    }

    pub async fn list(&self, tenant_id: &str) -> Result<Vec<OutboxRow>, OutboxError> {
        Ok(queries::list_outbox_for_tenant(&self.db, tenant_id)?)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::testing::{FakeDirectory, FakeInbox};

    const TENANT: &str = "tenant-1";

    struct Fixture {
        outbox: NotificationOutbox,
        directory: Arc<FakeDirectory>,
        inbox: Arc<FakeInbox>,
        clock: ManualClock,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::starting_now();
        let directory = Arc::new(FakeDirectory::default());
        let inbox = Arc::new(FakeInbox::default());
        let outbox = NotificationOutbox::new(
            Arc::new(Database::open_in_memory().unwrap()),
            directory.clone(),
            inbox.clone(),
            Arc::new(clock.clone()),
            OutboxSettings::default(),
        );
        Fixture {
            outbox,
            directory,
            inbox,
            clock,
        }
    }

    fn sender() -> SenderIdentity {
        SenderIdentity::new("hub-agent", "beadhub")
    }

    fn change(bead_id: &str, old: Option<&str>, new: &str) -> BeadStatusChange {
        BeadStatusChange {
            bead_id: bead_id.to_string(),
            repo: Some("acme/api".to_string()),
            branch: Some("main".to_string()),
            old_status: old.map(str::to_string),
            new_status: new.to_string(),
            title: Some("Fix login".to_string()),
        }
    }

    #[tokio::test]
    async fn new_beads_never_notify() {
        let fx = fixture();
        fx.directory.subscribe("bd-1", "w1", "alice");
        let created = fx
            .outbox
            .record_intents(&[change("bd-1", None, "open")], TENANT)
            .await
            .unwrap();
        assert_eq!(created, 0);
        assert!(fx.outbox.list(TENANT).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn one_intent_per_change_and_subscriber() {
        let fx = fixture();
        fx.directory.subscribe("bd-1", "w1", "alice");
        fx.directory.subscribe("bd-1", "w2", "bob");
        fx.directory.subscribe("bd-2", "w1", "alice");

        let created = fx
            .outbox
            .record_intents(
                &[
                    change("bd-1", Some("open"), "in_progress"),
                    change("bd-2", Some("open"), "closed"),
                    change("bd-3", Some("open"), "closed"),
                ],
                TENANT,
            )
            .await
            .unwrap();
        assert_eq!(created, 3);

        let rows = fx.outbox.list(TENANT).await.unwrap();
        assert!(rows.iter().all(|r| r.status == OutboxStatus::Pending && r.attempts == 0));
        assert!(rows.iter().all(|r| r.event_type == OUTBOX_EVENT_STATUS_CHANGE));
        let payload: serde_json::Value = serde_json::from_str(&rows[0].payload_json).unwrap();
        assert_eq!(
            payload,
            serde_json::json!({
                "bead_id": "bd-1",
                "repo": "acme/api",
                "branch": "main",
                "old_status": "open",
                "new_status": "in_progress",
                "title": "Fix login"
            })
        );
        assert_eq!(
            fx.directory.lookups(),
            vec![
                ("bd-1".to_string(), "status_change".to_string(), Some("acme/api".to_string())),
                ("bd-2".to_string(), "status_change".to_string(), Some("acme/api".to_string())),
                ("bd-3".to_string(), "status_change".to_string(), Some("acme/api".to_string())),
            ]
        );
    }

    #[tokio::test]
    async fn directory_failure_records_nothing() {
        let fx = fixture();
        fx.directory.subscribe("bd-1", "w1", "alice");
        fx.directory.fail_lookups(true);
        let result = fx
            .outbox
            .record_intents(&[change("bd-1", Some("open"), "closed")], TENANT)
            .await;
        assert!(matches!(result, Err(OutboxError::Directory(_))));
        assert!(fx.outbox.list(TENANT).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn successful_delivery_completes_entry() {
        let fx = fixture();
        fx.directory.subscribe("bd-1", "w1", "alice");
        fx.outbox
            .record_intents(&[change("bd-1", Some("open"), "closed")], TENANT)
            .await
            .unwrap();

        let outcome = fx.outbox.process_batch(TENANT, &sender(), 100).await.unwrap();
        assert_eq!(outcome, BatchOutcome { sent: 1, failed: 0 });

        let delivered = fx.inbox.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].subject, "Bead status changed: bd-1");
        assert_eq!(delivered[0].to_workspace_id, "w1");
        assert_eq!(delivered[0].from_alias, "beadhub");
        assert_eq!(delivered[0].thread_id, thread_id_for_bead("bd-1").to_string());

        let row = &fx.outbox.list(TENANT).await.unwrap()[0];
        assert_eq!(row.status, OutboxStatus::Completed);
        assert_eq!(row.attempts, 1);
        assert!(row.message_id.is_some());
        assert!(row.processed_at.is_some());
    }

    #[tokio::test]
    async fn deleted_recipient_exhausts_retry_budget() {
        let fx = fixture();
        fx.directory.subscribe("bd-1", "w1", "alice");
        fx.outbox
            .record_intents(&[change("bd-1", Some("open"), "closed")], TENANT)
            .await
            .unwrap();
        fx.directory.deactivate("w1");

        for attempt in 1..=3u32 {
            let outcome = fx.outbox.process_batch(TENANT, &sender(), 100).await.unwrap();
            assert_eq!(outcome, BatchOutcome { sent: 0, failed: 1 });
            let row = &fx.outbox.list(TENANT).await.unwrap()[0];
            assert_eq!(row.status, OutboxStatus::Failed);
            assert_eq!(row.attempts, attempt);
            assert_eq!(
                row.last_error.as_deref(),
                Some("Recipient workspace not found or deleted")
            );
        }

        let outcome = fx.outbox.process_batch(TENANT, &sender(), 100).await.unwrap();
        assert_eq!(outcome, BatchOutcome::default());
        assert!(fx.inbox.delivered().is_empty());
        assert_eq!(fx.outbox.stats(TENANT).await.unwrap().exhausted, 1);
    }

    #[tokio::test]
    async fn one_bad_entry_does_not_block_the_batch() {
        let fx = fixture();
        fx.directory.subscribe("bd-1", "w1", "alice");
        fx.directory.subscribe("bd-1", "w2", "bob");
        fx.outbox
            .record_intents(&[change("bd-1", Some("open"), "closed")], TENANT)
            .await
            .unwrap();
        fx.inbox.fail_for("w1", &"x".repeat(800));

        let outcome = fx.outbox.process_batch(TENANT, &sender(), 100).await.unwrap();
        assert_eq!(outcome, BatchOutcome { sent: 1, failed: 1 });

        let rows = fx.outbox.list(TENANT).await.unwrap();
        let failed = rows.iter().find(|r| r.recipient_workspace_id == "w1").unwrap();
        assert_eq!(failed.last_error.as_ref().map(|e| e.chars().count()), Some(500));
    }

    #[tokio::test]
    async fn retry_after_failure_clears_error() {
        let fx = fixture();
        fx.directory.subscribe("bd-1", "w1", "alice");
        fx.outbox
            .record_intents(&[change("bd-1", Some("open"), "closed")], TENANT)
            .await
            .unwrap();
        fx.inbox.fail_for("w1", "temporarily down");
        fx.outbox.process_batch(TENANT, &sender(), 100).await.unwrap();

        fx.inbox.clear_failures();
        let outcome = fx.outbox.process_batch(TENANT, &sender(), 100).await.unwrap();
        assert_eq!(outcome.sent, 1);
        let row = &fx.outbox.list(TENANT).await.unwrap()[0];
        assert_eq!(row.status, OutboxStatus::Completed);
        assert_eq!(row.attempts, 2);
        assert_eq!(row.last_error, None);
    }

    #[tokio::test]
    async fn batch_limit_is_respected() {
        let fx = fixture();
        for ws in ["w1", "w2", "w3"] {
            fx.directory.subscribe("bd-1", ws, ws);
        }
        fx.outbox
            .record_intents(&[change("bd-1", Some("open"), "closed")], TENANT)
            .await
            .unwrap();

        let outcome = fx.outbox.process_batch(TENANT, &sender(), 2).await.unwrap();
        assert_eq!(outcome.processed(), 2);
        assert_eq!(fx.outbox.stats(TENANT).await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn cleanup_removes_only_old_completed_entries() {
        let fx = fixture();
        fx.directory.subscribe("bd-1", "w1", "alice");
        fx.directory.subscribe("bd-2", "w1", "alice");
        fx.outbox
            .record_intents(&[change("bd-1", Some("open"), "closed")], TENANT)
            .await
            .unwrap();
        fx.outbox.process_batch(TENANT, &sender(), 100).await.unwrap();

        fx.clock.advance_secs(8 * 24 * 3600);
        fx.outbox
            .record_intents(&[change("bd-2", Some("open"), "closed")], TENANT)
            .await
            .unwrap();

        assert_eq!(fx.outbox.cleanup(TENANT, 7).await.unwrap(), 1);
        let rows = fx.outbox.list(TENANT).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, OutboxStatus::Pending);
    }

    #[tokio::test]
    async fn stale_claims_return_to_the_pool() {
        let fx = fixture();
        fx.directory.subscribe("bd-1", "w1", "alice");
        fx.outbox
            .record_intents(&[change("bd-1", Some("open"), "closed")], TENANT)
            .await
            .unwrap();
        let claimed = queries::claim_outbox_batch(
            &fx.outbox.db,
            TENANT,
            3,
            10,
            &to_storage(fx.clock.now()),
        )
        .unwrap();
        assert_eq!(claimed.len(), 1);

        assert_eq!(fx.outbox.requeue_stale().await.unwrap(), 0);
        fx.clock.advance_secs(301);
        assert_eq!(fx.outbox.requeue_stale().await.unwrap(), 1);

        let outcome = fx.outbox.process_batch(TENANT, &sender(), 100).await.unwrap();
        assert_eq!(outcome.sent, 1);
        assert_eq!(fx.outbox.get(&claimed[0].id).await.unwrap().unwrap().attempts, 2);
    }
}
