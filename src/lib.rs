//! Event distribution and reliable notification for BeadHub.
//!
//! This crate carries state changes from the coordination server to the
//! agents and dashboards watching it. It handles:
//! - Publishing workspace and chat events on the shared broker
//! - Streaming those events to connected clients with keepalives
//! - Tracking which peers are waiting in a chat session, with deadlines
//! - Durable, retried delivery of bead status notifications to inboxes
//!
//! # Architecture
//!
//! - `bus`: event model, channel naming, publishing and client streams
//! - `store`: shared broker and key-value seams, with an in-memory backend
//! - `presence`: heartbeat-scored waiting tracker and wait deadlines
//! - `db`: SQLite storage for the notification outbox
//! - `outbox`: intent recording, batch delivery, cleanup and the worker
//! - `mutation`: mutation-to-event translation
//! - `rate_limit`: fixed-window limiter on the shared store
//! - `config`, `telemetry`, `clock`: ambient plumbing

pub mod bus;
pub mod clock;
pub mod config;
pub mod db;
pub mod mutation;
pub mod outbox;
pub mod presence;
pub mod rate_limit;
pub mod store;
pub mod telemetry;

#[cfg(test)]
mod testing;
#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::time::Duration;

use bus::{
    open_chat_stream, open_workspace_stream, BusError, ChannelEvent, ChatStreamOptions,
    DisconnectCheck, EventBus, EventCategory, EventError, FrameStream, StreamOptions,
    WorkspaceEvent, WorkspacePayload,
};
use clock::SharedClock;
use config::{ConfigError, HubConfig};
use db::{Database, DbError};
use mutation::{MutationContext, MutationHandler, MutationOutcome};
use outbox::{
    BeadStatusChange, InboxDelivery, NotificationOutbox, OutboxError, OutboxSettings,
    OutboxWorker, SenderIdentity, SubscriberDirectory, WorkerHandle,
};
use presence::WaitingTracker;
use rate_limit::RateLimiter;
use store::{Broker, KeyValueStore, MemoryStore, StoreError};

// ---------------------------------------------------------------------------
// Shared error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("{0}")]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Store(#[from] StoreError),
    #[error("{0}")]
    Bus(#[from] BusError),
    #[error("{0}")]
    Event(#[from] EventError),
    #[error("{0}")]
    Db(#[from] DbError),
    #[error("{0}")]
    Outbox(#[from] OutboxError),
}

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

/// The subsystem's collaborators, wired together once per process.
#[derive(Clone)]
pub struct Hub {
    config: HubConfig,
    bus: EventBus,
    presence: WaitingTracker,
    outbox: NotificationOutbox,
    mutations: MutationHandler,
    rate_limiter: RateLimiter,
}

impl Hub {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: HubConfig,
        broker: Arc<dyn Broker>,
        store: Arc<dyn KeyValueStore>,
        db: Arc<Database>,
        directory: Arc<dyn SubscriberDirectory>,
        inbox: Arc<dyn InboxDelivery>,
        clock: SharedClock,
    ) -> Self {
        let bus = EventBus::new(broker);
        let presence = WaitingTracker::new(store.clone(), clock.clone(), config.keepalive());
        let outbox = NotificationOutbox::new(
            db,
            directory,
            inbox,
            clock.clone(),
            OutboxSettings::from_config(&config),
        );
        let mutations = MutationHandler::new(bus.clone(), clock);
        let rate_limiter = RateLimiter::new(store);
        Self {
            config,
            bus,
            presence,
            outbox,
            mutations,
            rate_limiter,
        }
    }

    /// Single-process hub: in-memory broker and store, outbox database at
    /// `config.database_path`.
    pub fn open(
        config: HubConfig,
        directory: Arc<dyn SubscriberDirectory>,
        inbox: Arc<dyn InboxDelivery>,
    ) -> Result<Self, HubError> {
        let db = Arc::new(Database::open(&config.database_path)?);
        Ok(Self::with_memory_store(config, db, directory, inbox, clock::system()))
    }

    pub fn with_memory_store(
        config: HubConfig,
        db: Arc<Database>,
        directory: Arc<dyn SubscriberDirectory>,
        inbox: Arc<dyn InboxDelivery>,
        clock: SharedClock,
    ) -> Self {
        let store = Arc::new(MemoryStore::new(clock.clone()));
        Self::new(config, store.clone(), store, db, directory, inbox, clock)
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn presence(&self) -> &WaitingTracker {
        &self.presence
    }

    pub fn outbox(&self) -> &NotificationOutbox {
        &self.outbox
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub async fn publish<E: ChannelEvent + Sync>(&self, event: &E) -> Result<usize, HubError> {
        Ok(self.bus.publish(event).await?)
    }

    pub async fn stream_workspaces(
        &self,
        workspace_ids: &[String],
        categories: Option<Vec<EventCategory>>,
        disconnect: Option<DisconnectCheck>,
    ) -> Result<FrameStream, HubError> {
        let mut options = StreamOptions::from_config(&self.config);
        options.categories = categories;
        options.disconnect = disconnect;
        Ok(open_workspace_stream(&self.bus, workspace_ids, options).await?)
    }

    pub async fn stream_chat(
        &self,
        session_id: &str,
        peer_id: &str,
        wait: Option<Duration>,
        disconnect: Option<DisconnectCheck>,
    ) -> Result<FrameStream, HubError> {
        let mut options = ChatStreamOptions::from_config(&self.config);
        options.wait = wait;
        options.disconnect = disconnect;
        Ok(open_chat_stream(&self.bus, &self.presence, session_id, peer_id, options).await?)
    }

    /// Waiting check using the configured maximum heartbeat age.
    pub async fn is_waiting(&self, session_id: &str, peer_id: &str) -> Result<bool, HubError> {
        Ok(self
            .presence
            .is_waiting(session_id, peer_id, self.config.waiting_max_age())
            .await?)
    }

    pub async fn on_mutation(&self, tag: &str, ctx: &MutationContext) -> MutationOutcome {
        self.mutations.on_mutation(tag, ctx).await
    }

    /// Record notification intents for a sync's status changes, then tell
    /// the watching workspaces.
    ///
    /// Recording failures are returned. Live updates are best effort.
    pub async fn dispatch_status_changes(
        &self,
        changes: &[BeadStatusChange],
        tenant_id: &str,
        workspace_ids: &[String],
    ) -> Result<usize, HubError> {
        let recorded = self.outbox.record_intents(changes, tenant_id).await?;

        for change in changes {
            for workspace_id in workspace_ids {
                let event = WorkspaceEvent::at(
                    workspace_id.clone(),
                    WorkspacePayload::BeadStatusChanged {
                        project_id: tenant_id.to_string(),
                        bead_id: change.bead_id.clone(),
                        repo: change.repo.clone().unwrap_or_default(),
                        old_status: change.old_status.clone().unwrap_or_default(),
                        new_status: change.new_status.clone(),
                    },
                    self.presence.now(),
                );
                if let Err(e) = self.bus.publish(&event).await {
                    tracing::warn!(
                        "status change for {} not published to {workspace_id}: {e}",
                        change.bead_id
                    );
                }
            }
        }
        Ok(recorded)
    }

    pub fn start_outbox_worker(&self, sender: SenderIdentity) -> WorkerHandle {
        OutboxWorker::start(self.outbox.clone(), sender, self.config.poll_interval())
    }
}
