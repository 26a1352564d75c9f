//! Per-connection frame streams.
//!
//! A stream owns exactly one broker subscription, taken when it is opened and
//! released on every exit path. Graceful ends (disconnect reported, wait
//! deadline passed, empty-stream bound reached) run teardown inline before
//! the stream returns `None`. A stream dropped mid-flight is treated as
//! cancelled: the guard's `Drop` releases the subscription and schedules the
//! presence cleanup on the current runtime.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::Stream;
use tokio::time::Instant;

use crate::config::HubConfig;
use crate::presence::WaitingTracker;
use crate::store::{BrokerMessage, Subscription};

use super::channel::Channel;
use super::event_bus::EventBus;
use super::event_types::EventCategory;
use super::BusError;

pub type FrameStream = Pin<Box<dyn Stream<Item = Frame> + Send>>;

/// Async predicate reporting whether the client has gone away.
pub type DisconnectCheck = Arc<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;

pub fn disconnect_check<F, Fut>(check: F) -> DisconnectCheck
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    Arc::new(move || Box::pin(check()))
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Keepalive,
    Data(String),
    /// Event name carried out-of-band, used on chat streams.
    Typed { event: String, data: String },
}

impl Frame {
    pub fn is_keepalive(&self) -> bool {
        matches!(self, Self::Keepalive)
    }

    pub fn encode(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Keepalive => f.write_str(": keepalive\n\n"),
            Self::Data(data) => write!(f, "data: {data}\n\n"),
            Self::Typed { event, data } => write!(f, "event: {event}\ndata: {data}\n\n"),
        }
    }
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct StreamOptions {
    pub keepalive: Duration,
    /// Lifetime of a stream opened with no channels at all.
    pub empty_max_duration: Duration,
    /// `None` forwards every well-formed event.
    pub categories: Option<Vec<EventCategory>>,
    pub disconnect: Option<DisconnectCheck>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self::from_config(&HubConfig::default())
    }
}

impl StreamOptions {
    pub fn from_config(config: &HubConfig) -> Self {
        Self {
            keepalive: config.keepalive(),
            empty_max_duration: config.empty_stream_max(),
            categories: None,
            disconnect: None,
        }
    }

    pub fn with_categories(mut self, categories: Vec<EventCategory>) -> Self {
        self.categories = Some(categories);
        self
    }

    pub fn with_disconnect_check(mut self, check: DisconnectCheck) -> Self {
        self.disconnect = Some(check);
        self
    }

    fn max_empty_keepalives(&self) -> u64 {
        let keepalive = self.keepalive.as_secs().max(1);
        self.empty_max_duration.as_secs() / keepalive
    }
}

#[derive(Clone)]
pub struct ChatStreamOptions {
    pub keepalive: Duration,
    /// Wait timeout; sets the peer's deadline on open.
    pub wait: Option<Duration>,
    pub disconnect: Option<DisconnectCheck>,
}

impl ChatStreamOptions {
    pub fn from_config(config: &HubConfig) -> Self {
        Self {
            keepalive: config.keepalive(),
            wait: None,
            disconnect: None,
        }
    }

    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = Some(wait);
        self
    }

    pub fn with_disconnect_check(mut self, check: DisconnectCheck) -> Self {
        self.disconnect = Some(check);
        self
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Init,
    Subscribed,
    Emitting,
    Idle,
    Unsubscribing,
    Closed,
}

impl StreamPhase {
    pub fn can_advance_to(self, next: StreamPhase) -> bool {
        use StreamPhase::*;
        matches!(
            (self, next),
            (Init, Subscribed)
                | (Subscribed, Emitting | Idle | Unsubscribing | Closed)
                | (Emitting | Idle, Emitting | Idle | Unsubscribing)
                | (Unsubscribing, Closed)
        )
    }
}

struct PresenceLease {
    tracker: WaitingTracker,
    session_id: String,
    peer_id: String,
}

struct StreamGuard {
    label: String,
    phase: StreamPhase,
    subscription: Option<Subscription>,
    presence: Option<PresenceLease>,
}

impl StreamGuard {
    fn new(label: String, subscription: Option<Subscription>) -> Self {
        let mut guard = Self {
            label,
            phase: StreamPhase::Init,
            subscription,
            presence: None,
        };
        guard.advance(StreamPhase::Subscribed);
        guard
    }

    fn with_presence(mut self, lease: PresenceLease) -> Self {
        self.presence = Some(lease);
        self
    }

    fn advance(&mut self, next: StreamPhase) {
        if self.phase == next {
            return;
        }
        debug_assert!(
            self.phase.can_advance_to(next),
            "invalid stream transition {:?} -> {next:?}",
            self.phase
        );
        self.phase = next;
    }

    async fn next_message(&mut self) -> Option<BrokerMessage> {
        match self.subscription.as_mut() {
            Some(subscription) => subscription.recv().await,
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) {
        if self.phase == StreamPhase::Closed {
            return;
        }
        self.advance(StreamPhase::Unsubscribing);
        if let Some(mut subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        if let Some(lease) = self.presence.take() {
            if let Err(e) = lease.tracker.clear_waiting(&lease.session_id, &lease.peer_id).await {
                tracing::warn!("failed to clear waiting state for {}: {e}", lease.peer_id);
            }
        }
        self.advance(StreamPhase::Closed);
        tracing::debug!("{} closed", self.label);
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if self.phase == StreamPhase::Closed {
            return;
        }
        tracing::debug!("{} cancelled", self.label);
        self.subscription.take();
        if let Some(lease) = self.presence.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Err(e) =
                            lease.tracker.clear_waiting(&lease.session_id, &lease.peer_id).await
                        {
                            tracing::warn!("failed to clear waiting state for {}: {e}", lease.peer_id);
                        }
                    });
                }
                Err(_) => tracing::warn!(
                    "no runtime to clear waiting state for {}; it will lapse with its TTL",
                    lease.peer_id
                ),
            }
        }
        self.phase = StreamPhase::Closed;
    }
}

async fn disconnected(check: &Option<DisconnectCheck>) -> bool {
    match check {
        Some(check) => check().await,
        None => false,
    }
}

// ---------------------------------------------------------------------------
// Workspace streams
// ---------------------------------------------------------------------------

/// Data frame for a bus payload, or `None` when it is malformed or filtered out.
fn workspace_frame(payload: &str, categories: Option<&[EventCategory]>) -> Option<Frame> {
    let value: serde_json::Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!("skipping malformed event payload ({e}): {payload}");
            return None;
        }
    };
    if let Some(categories) = categories {
        let event_type = value.get("type").and_then(|t| t.as_str()).unwrap_or_default();
        let prefix = event_type.split('.').next().unwrap_or_default();
        let category = prefix.parse::<EventCategory>().ok()?;
        if !categories.contains(&category) {
            return None;
        }
    }
    Some(Frame::Data(payload.to_string()))
}

/// Open a stream over the workspace channels of `workspace_ids`.
///
/// Subscribes before returning, so events published after this call are
/// delivered even if the stream has not been polled yet. With no
/// workspaces the stream emits keepalives for at most
/// `empty_max_duration` and then ends.
pub async fn open_workspace_stream(
    bus: &EventBus,
    workspace_ids: &[String],
    options: StreamOptions,
) -> Result<FrameStream, BusError> {
    if workspace_ids.is_empty() {
        return Ok(empty_stream(options));
    }

    let channels: Vec<Channel> = workspace_ids.iter().map(Channel::workspace).collect();
    let subscription = bus.subscribe(&channels).await?;
    let label = format!("workspace stream over {} channels", channels.len());
    let guard = StreamGuard::new(label, Some(subscription));

    Ok(Box::pin(async_stream::stream! {
        let mut guard = guard;
        let keepalive = options.keepalive;
        let mut last_emit = Instant::now();

        loop {
            let wake_at = last_emit + keepalive;
            let received = tokio::select! {
                message = guard.next_message() => Some(message),
                _ = tokio::time::sleep_until(wake_at) => None,
            };

            if disconnected(&options.disconnect).await {
                tracing::debug!("client disconnected from {}", guard.label);
                break;
            }

            match received {
                Some(None) => break,
                Some(Some(message)) => {
                    if let Some(frame) = workspace_frame(&message.payload, options.categories.as_deref()) {
                        guard.advance(StreamPhase::Emitting);
                        yield frame;
                        last_emit = Instant::now();
                    }
                }
                None => {
                    guard.advance(StreamPhase::Idle);
                    yield Frame::Keepalive;
                    last_emit = Instant::now();
                }
            }
        }

        guard.close().await;
    }))
}

fn empty_stream(options: StreamOptions) -> FrameStream {
    let guard = StreamGuard::new("empty workspace stream".to_string(), None);
    let max_keepalives = options.max_empty_keepalives();

    Box::pin(async_stream::stream! {
        let mut guard = guard;
        let mut sent = 0;
        while sent < max_keepalives {
            if disconnected(&options.disconnect).await {
                tracing::debug!("client disconnected from {}", guard.label);
                break;
            }
            tokio::time::sleep(options.keepalive).await;
            guard.advance(StreamPhase::Idle);
            yield Frame::Keepalive;
            sent += 1;
        }
        if sent == max_keepalives {
            tracing::debug!("empty workspace stream reached its maximum duration");
        }
        guard.close().await;
    })
}

// ---------------------------------------------------------------------------
// Chat streams
// ---------------------------------------------------------------------------

fn chat_frame(payload: &str) -> Option<Frame> {
    let value: serde_json::Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!("skipping malformed chat payload ({e}): {payload}");
            return None;
        }
    };
    let Some(event) = value.get("type").and_then(|t| t.as_str()) else {
        tracing::warn!("skipping chat payload without a type: {payload}");
        return None;
    };
    Some(Frame::Typed {
        event: event.to_string(),
        data: payload.to_string(),
    })
}

/// Open a chat stream for `peer_id` waiting in `session_id`.
///
/// The peer is marked waiting on open, and given a deadline when
/// `options.wait` is set. Each keepalive refreshes the heartbeat. The stored
/// deadline is re-read every cycle, so extensions made by other
/// participants lengthen the wait. The stream ends once that deadline
/// passes.
pub async fn open_chat_stream(
    bus: &EventBus,
    tracker: &WaitingTracker,
    session_id: &str,
    peer_id: &str,
    options: ChatStreamOptions,
) -> Result<FrameStream, BusError> {
    let subscription = bus.subscribe(&[Channel::chat(session_id)]).await?;
    let lease = PresenceLease {
        tracker: tracker.clone(),
        session_id: session_id.to_string(),
        peer_id: peer_id.to_string(),
    };
    let label = format!("chat stream {session_id}/{peer_id}");
    let guard = StreamGuard::new(label, Some(subscription)).with_presence(lease);

    tracker.begin_wait(session_id, peer_id, options.wait).await?;

    let tracker = tracker.clone();
    let session_id = session_id.to_string();
    let peer_id = peer_id.to_string();

    Ok(Box::pin(async_stream::stream! {
        let mut guard = guard;
        let keepalive = options.keepalive;
        let mut last_emit = Instant::now();
        let mut last_heartbeat = Instant::now();

        loop {
            // Busy streams never hit the idle keepalive arm, so the heartbeat
            // has its own cadence.
            if Instant::now() >= last_heartbeat + keepalive {
                if let Err(e) = tracker.mark_waiting(&session_id, &peer_id).await {
                    tracing::warn!("heartbeat refresh failed for {peer_id}: {e}");
                }
                last_heartbeat = Instant::now();
            }

            let deadline = match tracker.get_deadline(&session_id, &peer_id).await {
                Ok(deadline) => deadline,
                Err(e) => {
                    tracing::warn!("could not read deadline for {peer_id}: {e}");
                    None
                }
            };
            let mut wake_at = (last_emit + keepalive).min(last_heartbeat + keepalive);
            if let Some(deadline) = deadline {
                let remaining = (deadline - tracker.now()).to_std().unwrap_or(Duration::ZERO);
                if remaining.is_zero() {
                    tracing::debug!("wait deadline passed for {}", guard.label);
                    break;
                }
                wake_at = wake_at.min(Instant::now() + remaining);
            }

            let received = tokio::select! {
                message = guard.next_message() => Some(message),
                _ = tokio::time::sleep_until(wake_at) => None,
            };

            if disconnected(&options.disconnect).await {
                tracing::debug!("client disconnected from {}", guard.label);
                break;
            }

            match received {
                Some(None) => break,
                Some(Some(message)) => {
                    if let Some(frame) = chat_frame(&message.payload) {
                        guard.advance(StreamPhase::Emitting);
                        yield frame;
                        last_emit = Instant::now();
                    }
                }
                None if Instant::now() >= last_emit + keepalive => {
                    if let Err(e) = tracker.mark_waiting(&session_id, &peer_id).await {
                        tracing::warn!("heartbeat refresh failed for {peer_id}: {e}");
                    }
                    last_heartbeat = Instant::now();
                    guard.advance(StreamPhase::Idle);
                    yield Frame::Keepalive;
                    last_emit = Instant::now();
                }
                // Woken for the deadline or a heartbeat; both handled at the top of the loop.
                None => {}
            }
        }

        guard.close().await;
    }))
}
