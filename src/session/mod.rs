//! Interactive sessions: one long-lived, stdin-addressable process per
//! workspace.
//!
//! Session state lives in two tiers. The in-process map is a cache; the
//! broker holds a descriptor (`session-pid:{workspace}` -> pid) with a TTL so
//! any managing process can reconstruct a handle after a restart. Sends for
//! one workspace are serialized by a short broker lease
//! (`session-lock:{workspace}`).
//!
//! ```text
//!   absent ──start──▶ starting ──▶ running ──stop──▶ stopped
//!                                     │
//!                                     └──send hits NotFound──▶ crashed
//! ```

mod lease;
mod manager;

pub use lease::SendLease;
pub use manager::SessionManager;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Broker key of a workspace's session descriptor.
pub fn descriptor_key(workspace_id: &str) -> String {
    format!("session-pid:{}", workspace_id)
}

/// Broker key of a workspace's send lease.
pub fn lease_key(workspace_id: &str) -> String {
    format!("session-lock:{}", workspace_id)
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Starting,
    Running,
    Crashed,
    Stopped,
}

/// Snapshot of a tracked session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub workspace_id: String,
    pub pid: u32,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Rebuilt from the descriptor rather than started here.
    pub recovered: bool,
}

impl Session {
    fn new(workspace_id: &str, pid: u32, recovered: bool) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workspace_id: workspace_id.to_string(),
            pid,
            state: SessionState::Running,
            started_at: now,
            last_activity: now,
            recovered,
        }
    }

    /// Running and younger than `max_age`.
    pub fn is_healthy(&self, max_age: Duration) -> bool {
        self.is_healthy_at(Utc::now(), max_age)
    }

    fn is_healthy_at(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        let age = (now - self.started_at).to_std().unwrap_or_default();
        self.state == SessionState::Running && age < max_age
    }
}
