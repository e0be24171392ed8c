//! Subscription tokens.
//!
//! A token is a base64-encoded JSON bundle `{channel, topics, exp}` that a
//! client presents to read the topics it was granted. It is a read
//! capability only; publishing never consults it.
//!
//! Tokens are not signed. Anyone able to construct the JSON can mint one, so
//! the endpoint that serves them must sit behind the dashboard's own
//! authentication.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::bus::Topic;
use crate::error::BusError;

/// Decoded subscription grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionToken {
    pub channel: String,
    pub topics: Vec<String>,
    /// Expiry as unix seconds.
    pub exp: i64,
}

impl SubscriptionToken {
    /// Create a grant for `topics` on `channel` that expires after `ttl`.
    pub fn new(channel: impl Into<String>, topics: &[Topic], ttl: Duration) -> Self {
        Self {
            channel: channel.into(),
            topics: topics.iter().map(|t| t.as_str().to_string()).collect(),
            exp: Utc::now().timestamp() + ttl.as_secs() as i64,
        }
    }

    /// Encode to the opaque wire form.
    pub fn encode(&self) -> String {
        // Serializing a struct of strings and an integer cannot fail.
        let json = serde_json::to_vec(self).unwrap_or_default();
        STANDARD.encode(json)
    }

    /// Decode from the wire form without checking expiry.
    pub fn decode(token: &str) -> Result<Self, BusError> {
        let bytes = STANDARD
            .decode(token.trim())
            .map_err(|e| BusError::MalformedToken(format!("base64: {}", e)))?;
        serde_json::from_slice(&bytes).map_err(|e| BusError::MalformedToken(format!("json: {}", e)))
    }

    /// Check the grant is usable at `now` (unix seconds).
    pub fn validate_at(&self, now: i64) -> Result<(), BusError> {
        if self.exp <= now {
            return Err(BusError::TokenExpired);
        }
        if self.topics.is_empty() {
            return Err(BusError::NoTopics);
        }
        Ok(())
    }

    /// Check the grant is usable now.
    pub fn validate(&self) -> Result<(), BusError> {
        self.validate_at(Utc::now().timestamp())
    }

    /// Whether the grant covers a topic.
    pub fn grants(&self, topic: &str) -> bool {
        self.topics.iter().any(|t| t == topic)
    }
}
