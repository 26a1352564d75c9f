use std::sync::Arc;

use crate::store::{Broker, Subscription};

use super::channel::Channel;
use super::event_types::ChannelEvent;
use super::BusError;

/// Publish primitive over the shared broker.
///
/// Nothing is buffered or retried here: an event published while nobody is
/// subscribed is simply gone.
#[derive(Clone)]
pub struct EventBus {
    broker: Arc<dyn Broker>,
}

impl EventBus {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    /// Serialize and publish an event on its own channel. Returns how many
    /// subscriptions received it; zero is normal.
    pub async fn publish<E: ChannelEvent>(&self, event: &E) -> Result<usize, BusError> {
        let channel = event.channel();
        let message = event.to_json()?;
        let count = self.broker.publish(&channel.name(), message).await?;
        tracing::debug!(
            "published {} to {channel}, {count} subscribers",
            event.event_type()
        );
        Ok(count)
    }

    /// Publish an already-serialized payload.
    pub async fn publish_raw(&self, channel: &Channel, payload: String) -> Result<usize, BusError> {
        Ok(self.broker.publish(&channel.name(), payload).await?)
    }

    pub async fn subscribe(&self, channels: &[Channel]) -> Result<Subscription, BusError> {
        let names: Vec<String> = channels.iter().map(Channel::name).collect();
        let subscription = self.broker.subscribe(&names).await?;
        tracing::debug!("subscribed to {} channels", subscription.channels().len());
        Ok(subscription)
    }

    pub async fn subscriber_count(&self, channel: &Channel) -> Result<usize, BusError> {
        Ok(self.broker.subscriber_count(&channel.name()).await?)
    }
}
