//! Persistence for tasks, executions and custom agents.
//!
//! The relational schema lives outside this crate; [`Store`] is the seam it
//! plugs into. [`InMemoryStore`] backs tests and the local CLI.

mod memory;

pub use memory::InMemoryStore;

use async_trait::async_trait;
use uuid::Uuid;

use crate::agent::{Agent, Execution, Task};
use crate::error::StoreError;

/// Record storage keyed by id.
#[async_trait]
pub trait Store: Send + Sync {
    // --- Tasks ---

    async fn create_task(&self, task: &Task) -> Result<(), StoreError>;

    async fn get_task(&self, id: Uuid) -> Result<Task, StoreError>;

    /// Overwrite a task record.
    async fn update_task(&self, task: &Task) -> Result<(), StoreError>;

    // --- Executions ---

    async fn create_execution(&self, execution: &Execution) -> Result<(), StoreError>;

    async fn get_execution(&self, id: Uuid) -> Result<Execution, StoreError>;

    async fn update_execution(&self, execution: &Execution) -> Result<(), StoreError>;

    // --- Custom agents ---

    async fn create_custom_agent(&self, agent: &Agent) -> Result<(), StoreError>;

    async fn get_custom_agent(&self, id: Uuid) -> Result<Agent, StoreError>;

    /// Custom agents owned by a team, oldest first.
    async fn list_custom_agents(&self, team_id: &str) -> Result<Vec<Agent>, StoreError>;
}
