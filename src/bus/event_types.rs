//! Event model: categories, workspace events and chat events.
//!
//! Single source of truth for event type strings. The category of a
//! workspace event is fixed by its variant; [`EventCategory::from_event_type`]
//! is the only place a type string is split, and it rejects anything that
//! does not name a known category.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::channel::Channel;
use super::EventError;

// ---------------------------------------------------------------------------
// Categories
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Reservation,
    Message,
    Escalation,
    Bead,
}

impl EventCategory {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Reservation => "reservation",
            Self::Message => "message",
            Self::Escalation => "escalation",
            Self::Bead => "bead",
        }
    }

    pub const fn all() -> &'static [EventCategory] {
        &[
            EventCategory::Reservation,
            EventCategory::Message,
            EventCategory::Escalation,
            EventCategory::Bead,
        ]
    }

    /// `"message.delivered"` -> `Message`. A type without a dot, or whose
    /// prefix is not a known category, is an error.
    pub fn from_event_type(event_type: &str) -> Result<Self, EventError> {
        let Some((category, _verb)) = event_type.split_once('.') else {
            return Err(EventError::MissingCategory(event_type.to_string()));
        };
        category.parse()
    }
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventCategory {
    type Err = EventError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "reservation" => Ok(Self::Reservation),
            "message" => Ok(Self::Message),
            "escalation" => Ok(Self::Escalation),
            "bead" => Ok(Self::Bead),
            other => Err(EventError::UnknownCategory(other.to_string())),
        }
    }
}

/// Parse a client-supplied category filter such as `"message,bead"`.
pub fn parse_category_filter(raw: &str) -> Result<Vec<EventCategory>, EventError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::parse)
        .collect()
}

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

pub const EVENT_RESERVATION_ACQUIRED: &str = "reservation.acquired";
pub const EVENT_RESERVATION_RELEASED: &str = "reservation.released";
pub const EVENT_RESERVATION_RENEWED: &str = "reservation.renewed";
pub const EVENT_MESSAGE_DELIVERED: &str = "message.delivered";
pub const EVENT_MESSAGE_ACKNOWLEDGED: &str = "message.acknowledged";
pub const EVENT_ESCALATION_CREATED: &str = "escalation.created";
pub const EVENT_ESCALATION_RESPONDED: &str = "escalation.responded";
pub const EVENT_BEAD_STATUS_CHANGED: &str = "bead.status_changed";

pub const CHAT_EVENT_MESSAGE: &str = "message";
pub const CHAT_EVENT_READ_RECEIPT: &str = "read_receipt";

/// Anything that can be put on a bus channel.
pub trait ChannelEvent: Serialize {
    fn channel(&self) -> Channel;

    fn event_type(&self) -> &'static str;

    fn to_json(&self) -> Result<String, EventError> {
        Ok(serde_json::to_string(self)?)
    }
}

// ---------------------------------------------------------------------------
// Workspace events
// ---------------------------------------------------------------------------

fn default_priority() -> String {
    "normal".to_string()
}

fn default_exclusive() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkspacePayload {
    #[serde(rename = "reservation.acquired")]
    ReservationAcquired {
        paths: Vec<String>,
        #[serde(default)]
        alias: String,
        #[serde(default)]
        ttl_seconds: u64,
        #[serde(default)]
        bead_id: Option<String>,
        #[serde(default)]
        reason: Option<String>,
        #[serde(default = "default_exclusive")]
        exclusive: bool,
    },
    #[serde(rename = "reservation.released")]
    ReservationReleased {
        paths: Vec<String>,
        #[serde(default)]
        alias: String,
    },
    #[serde(rename = "reservation.renewed")]
    ReservationRenewed {
        paths: Vec<String>,
        #[serde(default)]
        alias: String,
        #[serde(default)]
        ttl_seconds: u64,
    },
    #[serde(rename = "message.delivered")]
    MessageDelivered {
        message_id: String,
        #[serde(default)]
        from_workspace: String,
        #[serde(default)]
        from_alias: String,
        #[serde(default)]
        subject: String,
        #[serde(default = "default_priority")]
        priority: String,
    },
    #[serde(rename = "message.acknowledged")]
    MessageAcknowledged { message_id: String },
    #[serde(rename = "escalation.created")]
    EscalationCreated {
        escalation_id: String,
        #[serde(default)]
        alias: String,
        #[serde(default)]
        subject: String,
    },
    #[serde(rename = "escalation.responded")]
    EscalationResponded {
        escalation_id: String,
        #[serde(default)]
        response: String,
    },
    #[serde(rename = "bead.status_changed")]
    BeadStatusChanged {
        #[serde(default)]
        project_id: String,
        bead_id: String,
        #[serde(default)]
        repo: String,
        #[serde(default)]
        old_status: String,
        new_status: String,
    },
}

impl WorkspacePayload {
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::ReservationAcquired { .. } => EVENT_RESERVATION_ACQUIRED,
            Self::ReservationReleased { .. } => EVENT_RESERVATION_RELEASED,
            Self::ReservationRenewed { .. } => EVENT_RESERVATION_RENEWED,
            Self::MessageDelivered { .. } => EVENT_MESSAGE_DELIVERED,
            Self::MessageAcknowledged { .. } => EVENT_MESSAGE_ACKNOWLEDGED,
            Self::EscalationCreated { .. } => EVENT_ESCALATION_CREATED,
            Self::EscalationResponded { .. } => EVENT_ESCALATION_RESPONDED,
            Self::BeadStatusChanged { .. } => EVENT_BEAD_STATUS_CHANGED,
        }
    }

    pub const fn category(&self) -> EventCategory {
        match self {
            Self::ReservationAcquired { .. }
            | Self::ReservationReleased { .. }
            | Self::ReservationRenewed { .. } => EventCategory::Reservation,
            Self::MessageDelivered { .. } | Self::MessageAcknowledged { .. } => {
                EventCategory::Message
            }
            Self::EscalationCreated { .. } | Self::EscalationResponded { .. } => {
                EventCategory::Escalation
            }
            Self::BeadStatusChanged { .. } => EventCategory::Bead,
        }
    }
}

/// An event routed to `events:<workspace_id>`.
///
/// The payload is declared first so the `type` discriminator leads the JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceEvent {
    #[serde(flatten)]
    pub payload: WorkspacePayload,
    pub workspace_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub project_slug: Option<String>,
}

impl WorkspaceEvent {
    pub fn new(workspace_id: impl Into<String>, payload: WorkspacePayload) -> Self {
        Self::at(workspace_id, payload, Utc::now())
    }

    pub fn at(
        workspace_id: impl Into<String>,
        payload: WorkspacePayload,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            timestamp,
            project_slug: None,
            payload,
        }
    }

    pub fn with_project_slug(mut self, slug: impl Into<String>) -> Self {
        self.project_slug = Some(slug.into());
        self
    }

    pub fn category(&self) -> EventCategory {
        self.payload.category()
    }
}

impl ChannelEvent for WorkspaceEvent {
    fn channel(&self) -> Channel {
        Channel::workspace(self.workspace_id.clone())
    }

    fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }
}

// ---------------------------------------------------------------------------
// Chat events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatPayload {
    Message {
        message_id: String,
        #[serde(default)]
        from_workspace: String,
        #[serde(default)]
        from_alias: String,
        #[serde(default)]
        body: Option<String>,
    },
    ReadReceipt {
        message_id: String,
        #[serde(default)]
        reader_workspace: String,
        #[serde(default)]
        reader_alias: String,
    },
}

impl ChatPayload {
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::Message { .. } => CHAT_EVENT_MESSAGE,
            Self::ReadReceipt { .. } => CHAT_EVENT_READ_RECEIPT,
        }
    }
}

/// An event routed to `chat:<session_id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatEvent {
    #[serde(flatten)]
    pub payload: ChatPayload,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatEvent {
    pub fn new(session_id: impl Into<String>, payload: ChatPayload) -> Self {
        Self {
            session_id: session_id.into(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

impl ChannelEvent for ChatEvent {
    fn channel(&self) -> Channel {
        Channel::chat(self.session_id.clone())
    }

    fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }
}
