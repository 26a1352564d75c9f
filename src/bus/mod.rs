//! Event distribution over the shared broker.
//!
//! - `event_types`: the event model, categories and JSON shapes
//! - `channel`: channel naming and presence key naming
//! - `event_bus`: publish and subscribe primitive
//! - `stream`: per-client frame streams with keepalive and filtering
//!
//! # Architecture
//!
//! Producers publish a [`WorkspaceEvent`] or [`ChatEvent`] onto its channel.
//! Each connected client owns one stream that subscribes to its channels,
//! filters by category and interleaves keepalive frames while idle. Nothing
//! is buffered for absent subscribers; reliable delivery goes through the
//! outbox instead.

mod channel;
mod event_bus;
mod event_types;
pub mod stream;

pub use channel::{deadline_key, waiting_key, Channel};
pub use event_bus::EventBus;
pub use event_types::*;
pub use stream::{
    open_chat_stream, open_workspace_stream, ChatStreamOptions, DisconnectCheck, Frame,
    FrameStream, StreamOptions,
};

use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("event type {0:?} has no category prefix")]
    MissingCategory(String),
    #[error("unknown event category {0:?}")]
    UnknownCategory(String),
    #[error("event serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("{0}")]
    Store(#[from] StoreError),
    #[error("{0}")]
    Event(#[from] EventError),
}
