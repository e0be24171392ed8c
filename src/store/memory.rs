//! In-memory [`Store`].

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::agent::{Agent, AgentRef, Execution, Task};
use crate::error::StoreError;
use crate::store::Store;

/// Store backed by hash maps. Records are cloned in and out.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tasks: RwLock<HashMap<Uuid, Task>>,
    executions: RwLock<HashMap<Uuid, Execution>>,
    agents: RwLock<HashMap<Uuid, Agent>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn task_count(&self) -> usize {
        self.tasks.read().await.len()
    }
}

fn custom_id(agent: &Agent) -> Result<Uuid, StoreError> {
    match &agent.reference {
        AgentRef::Custom(id) => Ok(*id),
        AgentRef::System(id) => Err(StoreError::Backend(format!(
            "system agent {} cannot be stored",
            id
        ))),
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn create_task(&self, task: &Task) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(StoreError::Conflict {
                entity: "task",
                id: task.id.to_string(),
            });
        }
        tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Task, StoreError> {
        self.tasks
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                entity: "task",
                id: id.to_string(),
            })
    }

    async fn update_task(&self, task: &Task) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(&task.id) {
            Some(existing) => {
                *existing = task.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound {
                entity: "task",
                id: task.id.to_string(),
            }),
        }
    }

    async fn create_execution(&self, execution: &Execution) -> Result<(), StoreError> {
        let mut executions = self.executions.write().await;
        if executions.contains_key(&execution.id) {
            return Err(StoreError::Conflict {
                entity: "execution",
                id: execution.id.to_string(),
            });
        }
        executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> Result<Execution, StoreError> {
        self.executions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                entity: "execution",
                id: id.to_string(),
            })
    }

    async fn update_execution(&self, execution: &Execution) -> Result<(), StoreError> {
        let mut executions = self.executions.write().await;
        match executions.get_mut(&execution.id) {
            Some(existing) => {
                *existing = execution.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound {
                entity: "execution",
                id: execution.id.to_string(),
            }),
        }
    }

    async fn create_custom_agent(&self, agent: &Agent) -> Result<(), StoreError> {
        let id = custom_id(agent)?;
        let mut agents = self.agents.write().await;
        if agents.contains_key(&id) {
            return Err(StoreError::Conflict {
                entity: "agent",
                id: id.to_string(),
            });
        }
        agents.insert(id, agent.clone());
        Ok(())
    }

    async fn get_custom_agent(&self, id: Uuid) -> Result<Agent, StoreError> {
        self.agents
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                entity: "agent",
                id: id.to_string(),
            })
    }

    async fn list_custom_agents(&self, team_id: &str) -> Result<Vec<Agent>, StoreError> {
        let mut agents: Vec<Agent> = self
            .agents
            .read()
            .await
            .values()
            .filter(|a| a.team_id.as_deref() == Some(team_id))
            .cloned()
            .collect();
        agents.sort_by_key(|a| a.created_at);
        Ok(agents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentRegistry, NewAgent, TaskStatus};

    fn custom(team: &str, name: &str) -> Agent {
        Agent::custom(
            team,
            NewAgent {
                name: name.to_string(),
                role: String::new(),
                system_prompt: String::new(),
                tools: vec![],
                model: None,
            },
            "claude-x",
        )
    }

    #[tokio::test]
    async fn test_task_round_trip_and_update() {
        let store = InMemoryStore::new();
        let mut task = Task::new(AgentRef::System("coder".to_string()), "ws", "x");
        store.create_task(&task).await.unwrap();
        assert!(matches!(
            store.create_task(&task).await,
            Err(StoreError::Conflict { .. })
        ));

        task.transition(TaskStatus::Running).unwrap();
        store.update_task(&task).await.unwrap();
        assert_eq!(store.get_task(task.id).await.unwrap().status, TaskStatus::Running);
        assert_eq!(store.task_count().await, 1);
    }

    #[tokio::test]
    async fn test_update_unknown_task_fails() {
        let store = InMemoryStore::new();
        let task = Task::new(AgentRef::System("coder".to_string()), "ws", "x");
        assert!(matches!(
            store.update_task(&task).await,
            Err(StoreError::NotFound { entity: "task", .. })
        ));
    }

    #[tokio::test]
    async fn test_custom_agents_scoped_by_team() {
        let store = InMemoryStore::new();
        store.create_custom_agent(&custom("a", "one")).await.unwrap();
        store.create_custom_agent(&custom("a", "two")).await.unwrap();
        store.create_custom_agent(&custom("b", "three")).await.unwrap();

        let names: Vec<String> = store
            .list_custom_agents("a")
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.name)
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"one".to_string()));
        assert!(store.list_custom_agents("c").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_system_agents_are_not_stored() {
        let store = InMemoryStore::new();
        let system = AgentRegistry::builtin("claude-x").get("coder").unwrap();
        assert!(store.create_custom_agent(&system).await.is_err());
    }
}
