//! External key-value and pub/sub broker.
//!
//! The engine treats the broker as a shared service reachable from every
//! managing process: a TTL-aware key-value store (session descriptors, send
//! leases) plus channel fan-out (realtime events). [`InMemoryBroker`] is the
//! single-process implementation.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::PoisonError;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use tokio::sync::{Mutex, broadcast};
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::error::BrokerError;

/// A message delivered on a broker channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub channel: String,
    pub payload: String,
}

/// Stream of messages matching a subscription.
pub type BrokerStream = Pin<Box<dyn Stream<Item = BrokerMessage> + Send>>;

/// Key-value and pub/sub operations consumed from the external broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Set a key, replacing any previous value. `None` means no expiry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), BrokerError>;

    /// Set a key only if it is absent. Returns whether the key was set.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, BrokerError>;

    /// Get a key's value.
    async fn get(&self, key: &str) -> Result<Option<String>, BrokerError>;

    /// Delete a key. Returns whether it existed.
    async fn del(&self, key: &str) -> Result<bool, BrokerError>;

    /// Delete a key only if it still holds `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, BrokerError>;

    /// Publish a payload on a channel. Delivery is best-effort.
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BrokerError>;

    /// Subscribe to channels matching any of the patterns.
    ///
    /// A pattern is an exact channel name or a prefix ending in `*`.
    async fn subscribe(&self, patterns: &[String]) -> Result<BrokerStream, BrokerError>;
}

/// Check whether a channel matches a subscription pattern.
pub fn pattern_matches(pattern: &str, channel: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => channel.starts_with(prefix),
        None => pattern == channel,
    }
}

fn validate_pattern(pattern: &str) -> Result<(), BrokerError> {
    let body = pattern.strip_suffix('*').unwrap_or(pattern);
    if pattern.is_empty() || body.contains('*') {
        return Err(BrokerError::InvalidPattern(pattern.to_string()));
    }
    Ok(())
}

/// How often a write also drops every expired key.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// Single-process broker with broadcast fan-out.
///
/// Expired keys read as absent immediately and are removed on access or by
/// a periodic sweep piggybacked on writes.
pub struct InMemoryBroker {
    entries: Mutex<HashMap<String, Entry>>,
    next_sweep: std::sync::Mutex<Instant>,
    tx: broadcast::Sender<BrokerMessage>,
}

impl InMemoryBroker {
    /// Create a new broker.
    pub fn new() -> Self {
        // Slow subscribers miss messages once they lag this far behind.
        let (tx, _) = broadcast::channel(1024);
        Self {
            entries: Mutex::new(HashMap::new()),
            next_sweep: std::sync::Mutex::new(Instant::now() + SWEEP_INTERVAL),
            tx,
        }
    }

    fn sweep_if_due(&self, entries: &mut HashMap<String, Entry>, now: Instant) {
        {
            let mut next = self.next_sweep.lock().unwrap_or_else(PoisonError::into_inner);
            if now < *next {
                return;
            }
            *next = now + SWEEP_INTERVAL;
        }
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        let swept = before - entries.len();
        if swept > 0 {
            tracing::debug!("Swept {} expired broker keys", swept);
        }
    }

    /// Remaining time-to-live of a key, if it exists and expires.
    pub async fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        entries
            .get(key)
            .filter(|e| e.is_live(now))
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    /// Number of live subscribers on the fan-out channel.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), BrokerError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        self.sweep_if_due(&mut entries, now);
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|t| now + t),
            },
        );
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, BrokerError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        self.sweep_if_due(&mut entries, now);
        if entries.get(key).is_some_and(|e| e.is_live(now)) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|t| now + t),
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BrokerError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn del(&self, key: &str) -> Result<bool, BrokerError> {
        let now = Instant::now();
        Ok(self
            .entries
            .lock()
            .await
            .remove(key)
            .is_some_and(|e| e.is_live(now)))
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, BrokerError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let matches = entries
            .get(key)
            .is_some_and(|e| e.is_live(now) && e.value == expected);
        if matches {
            entries.remove(key);
        }
        Ok(matches)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BrokerError> {
        // No receivers is fine: publish is fire-and-forget.
        let _ = self.tx.send(BrokerMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }

    async fn subscribe(&self, patterns: &[String]) -> Result<BrokerStream, BrokerError> {
        for pattern in patterns {
            validate_pattern(pattern)?;
        }
        let patterns = patterns.to_vec();
        let stream = BroadcastStream::new(self.tx.subscribe()).filter_map(move |result| {
            match result {
                Ok(msg) if patterns.iter().any(|p| pattern_matches(p, &msg.channel)) => Some(msg),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(n)) => {
                    tracing::warn!("Broker subscriber lagged, dropped {} messages", n);
                    None
                }
            }
        });
        Ok(Box::pin(stream))
    }
}
