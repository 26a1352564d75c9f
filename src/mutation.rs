//! Translates domain mutation notifications into bus events.
//!
//! The mutation layer reports `(tag, context)` after each successful write.
//! [`translate`] is a pure mapping from that pair to at most one event;
//! [`MutationHandler`] publishes the result and never lets a publish problem
//! reach the mutation that triggered it.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::bus::{
    ChannelEvent, ChatEvent, ChatPayload, EventBus, WorkspaceEvent, WorkspacePayload,
};
use crate::clock::SharedClock;

pub type MutationContext = Map<String, Value>;

pub const MUTATION_MESSAGE_SENT: &str = "message.sent";
pub const MUTATION_MESSAGE_ACKNOWLEDGED: &str = "message.acknowledged";
pub const MUTATION_RESERVATION_ACQUIRED: &str = "reservation.acquired";
pub const MUTATION_RESERVATION_RELEASED: &str = "reservation.released";
pub const MUTATION_CHAT_MESSAGE_SENT: &str = "chat.message_sent";
pub const MUTATION_CHAT_MESSAGE_READ: &str = "chat.message_read";
pub const MUTATION_ESCALATION_CREATED: &str = "escalation.created";
pub const MUTATION_ESCALATION_RESPONDED: &str = "escalation.responded";
pub const MUTATION_BEAD_STATUS_CHANGED: &str = "bead.status_changed";

#[derive(Debug, Clone, PartialEq)]
pub enum TranslatedEvent {
    Workspace(WorkspaceEvent),
    Chat(ChatEvent),
}

impl TranslatedEvent {
    /// Workspace or session id the event is routed by. Empty when the
    /// context did not carry one.
    pub fn scope_id(&self) -> &str {
        match self {
            Self::Workspace(event) => &event.workspace_id,
            Self::Chat(event) => &event.session_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Workspace(event) => event.event_type(),
            Self::Chat(event) => event.event_type(),
        }
    }
}

fn text(ctx: &MutationContext, key: &str) -> String {
    match ctx.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn optional_text(ctx: &MutationContext, key: &str) -> Option<String> {
    Some(text(ctx, key)).filter(|s| !s.is_empty())
}

fn number(ctx: &MutationContext, key: &str) -> u64 {
    match ctx.get(key) {
        Some(Value::Number(n)) => n.as_u64().unwrap_or_default(),
        Some(Value::String(s)) => s.parse().unwrap_or_default(),
        _ => 0,
    }
}

fn resource_paths(ctx: &MutationContext) -> Vec<String> {
    optional_text(ctx, "resource_key").into_iter().collect()
}

fn workspace(
    ctx: &MutationContext,
    scope_key: &str,
    payload: WorkspacePayload,
    now: DateTime<Utc>,
) -> TranslatedEvent {
    let mut event = WorkspaceEvent::at(text(ctx, scope_key), payload, now);
    if let Some(slug) = optional_text(ctx, "project_slug") {
        event = event.with_project_slug(slug);
    }
    TranslatedEvent::Workspace(event)
}

fn chat(ctx: &MutationContext, payload: ChatPayload, now: DateTime<Utc>) -> TranslatedEvent {
    TranslatedEvent::Chat(ChatEvent {
        session_id: text(ctx, "session_id"),
        timestamp: now,
        payload,
    })
}

/// Map a mutation to the event it should produce, or `None` for tags that
/// have no live-stream counterpart.
pub fn translate(tag: &str, ctx: &MutationContext, now: DateTime<Utc>) -> Option<TranslatedEvent> {
    let event = match tag {
        MUTATION_MESSAGE_SENT => workspace(
            ctx,
            "to_agent_id",
            WorkspacePayload::MessageDelivered {
                message_id: text(ctx, "message_id"),
                from_workspace: text(ctx, "from_agent_id"),
                from_alias: text(ctx, "from_alias"),
                subject: text(ctx, "subject"),
                priority: optional_text(ctx, "priority").unwrap_or_else(|| "normal".to_string()),
            },
            now,
        ),
        MUTATION_MESSAGE_ACKNOWLEDGED => workspace(
            ctx,
            "agent_id",
            WorkspacePayload::MessageAcknowledged {
                message_id: text(ctx, "message_id"),
            },
            now,
        ),
        MUTATION_RESERVATION_ACQUIRED => workspace(
            ctx,
            "holder_agent_id",
            WorkspacePayload::ReservationAcquired {
                paths: resource_paths(ctx),
                alias: text(ctx, "holder_alias"),
                ttl_seconds: number(ctx, "ttl_seconds"),
                bead_id: optional_text(ctx, "bead_id"),
                reason: optional_text(ctx, "reason"),
                exclusive: ctx.get("exclusive").and_then(Value::as_bool).unwrap_or(true),
            },
            now,
        ),
        MUTATION_RESERVATION_RELEASED => workspace(
            ctx,
            "holder_agent_id",
            WorkspacePayload::ReservationReleased {
                paths: resource_paths(ctx),
                alias: text(ctx, "holder_alias"),
            },
            now,
        ),
        MUTATION_CHAT_MESSAGE_SENT => chat(
            ctx,
            ChatPayload::Message {
                message_id: text(ctx, "message_id"),
                from_workspace: text(ctx, "from_agent_id"),
                from_alias: text(ctx, "from_alias"),
                body: optional_text(ctx, "body"),
            },
            now,
        ),
        MUTATION_CHAT_MESSAGE_READ => chat(
            ctx,
            ChatPayload::ReadReceipt {
                message_id: text(ctx, "message_id"),
                reader_workspace: text(ctx, "reader_agent_id"),
                reader_alias: text(ctx, "reader_alias"),
            },
            now,
        ),
        MUTATION_ESCALATION_CREATED => workspace(
            ctx,
            "agent_id",
            WorkspacePayload::EscalationCreated {
                escalation_id: text(ctx, "escalation_id"),
                alias: text(ctx, "alias"),
                subject: text(ctx, "subject"),
            },
            now,
        ),
        MUTATION_ESCALATION_RESPONDED => workspace(
            ctx,
            "agent_id",
            WorkspacePayload::EscalationResponded {
                escalation_id: text(ctx, "escalation_id"),
                response: text(ctx, "response"),
            },
            now,
        ),
        MUTATION_BEAD_STATUS_CHANGED => workspace(
            ctx,
            "workspace_id",
            WorkspacePayload::BeadStatusChanged {
                project_id: text(ctx, "project_id"),
                bead_id: text(ctx, "bead_id"),
                repo: text(ctx, "repo"),
                old_status: text(ctx, "old_status"),
                new_status: text(ctx, "new_status"),
            },
            now,
        ),
        _ => return None,
    };
    Some(event)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOutcome {
    Published { subscribers: usize },
    /// Tag has no event mapping.
    Ignored,
    /// Context lacked the routing id.
    MissingScope,
    PublishFailed,
}

/// Publishes translated mutations on the bus.
#[derive(Clone)]
pub struct MutationHandler {
    bus: EventBus,
    clock: SharedClock,
}

impl MutationHandler {
    pub fn new(bus: EventBus, clock: SharedClock) -> Self {
        Self { bus, clock }
    }

    /// Never fails: publish errors are logged and reported in the outcome.
    pub async fn on_mutation(&self, tag: &str, ctx: &MutationContext) -> MutationOutcome {
        let Some(event) = translate(tag, ctx, self.clock.now()) else {
            return MutationOutcome::Ignored;
        };
        if event.scope_id().is_empty() {
            tracing::warn!("skipping {tag} event: no routing id in mutation context");
            return MutationOutcome::MissingScope;
        }

        let published = match &event {
            TranslatedEvent::Workspace(event) => self.bus.publish(event).await,
            TranslatedEvent::Chat(event) => self.bus.publish(event).await,
        };
        match published {
            Ok(subscribers) => MutationOutcome::Published { subscribers },
            Err(e) => {
                tracing::warn!("failed to publish event for {tag}: {e}");
                MutationOutcome::PublishFailed
            }
        }
    }
}
