//! Realtime bus: typed publish/subscribe over the shared broker.
//!
//! One channel per workspace; topics partition concerns inside it. The
//! broker channel for a topic is `{channel}:{topic}`.
//!
//! Publishing is fire-and-forget. Ordering holds only within one topic from
//! one publisher. Nothing here is durable; task and execution status in the
//! store remain the record of truth.

mod broker;
mod events;
pub mod sse;
mod token;

pub use broker::{Broker, BrokerMessage, BrokerStream, InMemoryBroker, pattern_matches};
pub use events::{AgentEvent, AgentEventType, Topic};
pub use token::SubscriptionToken;

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use futures::Stream;
use serde::Serialize;
use tokio_stream::StreamExt;

use crate::config::BusConfig;
use crate::error::BusError;

/// A message delivered to a subscriber.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BusMessage {
    pub channel: String,
    pub topic: String,
    pub payload: serde_json::Value,
}

/// Broker channel name for a topic within a workspace channel.
pub fn channel_key(channel: &str, topic: &Topic) -> String {
    format!("{}:{}", channel, topic.as_str())
}

/// Typed fan-out on top of a [`Broker`].
pub struct RealtimeBus {
    broker: Arc<dyn Broker>,
    config: BusConfig,
    subscriber_count: Arc<AtomicU64>,
}

impl RealtimeBus {
    /// Create a bus over a broker.
    pub fn new(broker: Arc<dyn Broker>, config: BusConfig) -> Self {
        Self {
            broker,
            config,
            subscriber_count: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Bus over a fresh in-memory broker with default settings.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryBroker::new()), BusConfig::default())
    }

    /// The broker underneath, shared with components that keep TTL state.
    pub fn broker(&self) -> Arc<dyn Broker> {
        Arc::clone(&self.broker)
    }

    /// Publish a JSON payload on a topic. Errors are logged, never returned.
    pub async fn publish(&self, channel: &str, topic: &Topic, payload: &serde_json::Value) {
        let key = channel_key(channel, topic);
        let body = payload.to_string();
        if let Err(e) = self.broker.publish(&key, &body).await {
            tracing::warn!("Dropped realtime message on {}: {}", key, e);
        }
    }

    /// Publish a lifecycle event on the topic its type maps to.
    pub async fn publish_event(&self, channel: &str, event: &AgentEvent) {
        match serde_json::to_value(event) {
            Ok(payload) => {
                self.publish(channel, &event.event_type.topic(), &payload)
                    .await
            }
            Err(e) => tracing::warn!("Failed to serialize {} event: {}", event.event_type, e),
        }
    }

    /// Publisher bound to one workspace channel.
    pub fn channel(self: &Arc<Self>, channel: impl Into<String>) -> ChannelPublisher {
        ChannelPublisher {
            bus: Arc::clone(self),
            channel: channel.into(),
        }
    }

    /// Mint a read token for `topics` on `channel`.
    pub fn issue_token(&self, channel: &str, topics: &[Topic]) -> String {
        SubscriptionToken::new(channel, topics, self.config.token_ttl).encode()
    }

    /// Current number of open subscriptions.
    pub fn subscriber_count(&self) -> u64 {
        self.subscriber_count.load(Ordering::Relaxed)
    }

    /// Open a subscription restricted to the topics a token grants.
    pub async fn subscribe(&self, token: &str) -> Result<Subscription, BusError> {
        let grant = SubscriptionToken::decode(token)?;
        grant.validate()?;

        // Atomically increment only if below the limit.
        let counter = Arc::clone(&self.subscriber_count);
        let max = self.config.max_subscribers;
        counter
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                (current < max).then_some(current + 1)
            })
            .map_err(|_| BusError::TooManySubscribers(max))?;
        let guard = CountGuard(Arc::clone(&counter));

        let patterns: Vec<String> = grant
            .topics
            .iter()
            .map(|t| format!("{}:{}", grant.channel, t))
            .collect();
        let raw = self.broker.subscribe(&patterns).await?;

        let inner = raw.filter_map(|msg| {
            let (channel, topic) = msg.channel.rsplit_once(':')?;
            let payload = serde_json::from_str(&msg.payload)
                .unwrap_or(serde_json::Value::String(msg.payload.clone()));
            Some(BusMessage {
                channel: channel.to_string(),
                topic: topic.to_string(),
                payload,
            })
        });

        tracing::debug!(
            "Opened subscription on {} for {:?}",
            grant.channel,
            grant.topics
        );

        Ok(Subscription {
            inner: Box::pin(inner),
            _guard: guard,
        })
    }
}

/// Publisher bound to one channel.
#[derive(Clone)]
pub struct ChannelPublisher {
    bus: Arc<RealtimeBus>,
    channel: String,
}

impl ChannelPublisher {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Publish a lifecycle event.
    pub async fn emit(&self, event_type: AgentEventType, data: serde_json::Value) {
        let event = AgentEvent::new(event_type, data);
        self.bus.publish_event(&self.channel, &event).await;
    }

    /// Publish a raw payload on a topic.
    pub async fn publish(&self, topic: Topic, payload: serde_json::Value) {
        self.bus.publish(&self.channel, &topic, &payload).await;
    }
}

struct CountGuard(Arc<AtomicU64>);

impl Drop for CountGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Stream of messages for one subscriber.
///
/// Dropping it releases the subscriber slot.
pub struct Subscription {
    inner: Pin<Box<dyn Stream<Item = BusMessage> + Send>>,
    _guard: CountGuard,
}

impl Stream for Subscription {
    type Item = BusMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}
