//! Per-workspace send lease held in the broker.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use crate::bus::Broker;
use crate::error::SessionError;
use crate::session::lease_key;

const RETRY_INTERVAL: Duration = Duration::from_millis(25);

/// Exclusive right to write to a workspace's process input.
///
/// The lease expires on its own after its TTL, so a holder that dies never
/// wedges the workspace.
pub struct SendLease {
    broker: Arc<dyn Broker>,
    key: String,
    token: String,
}

impl SendLease {
    /// Acquire the lease, polling until `wait` elapses.
    pub async fn acquire(
        broker: Arc<dyn Broker>,
        workspace_id: &str,
        ttl: Duration,
        wait: Duration,
    ) -> Result<Self, SessionError> {
        let key = lease_key(workspace_id);
        let token = Uuid::new_v4().to_string();
        let deadline = Instant::now() + wait;

        loop {
            if broker.set_if_absent(&key, &token, Some(ttl)).await? {
                return Ok(Self { broker, key, token });
            }
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!("Send lease for {} not acquired within {:?}", workspace_id, wait);
                return Err(SessionError::SessionBusy(workspace_id.to_string()));
            }
            tokio::time::sleep(RETRY_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Release the lease if this holder still owns it.
    pub async fn release(self) {
        match self.broker.compare_and_delete(&self.key, &self.token).await {
            Ok(true) => {}
            Ok(false) => tracing::debug!("Send lease {} expired before release", self.key),
            Err(e) => tracing::warn!("Failed to release send lease {}: {}", self.key, e),
        }
    }
}
