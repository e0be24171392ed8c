//! Tasks and executions.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ExecutorError, NetworkError};

/// Which agent a task is assigned to. Exactly one, by construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "origin", content = "id", rename_all = "lowercase")]
pub enum AgentRef {
    /// A system agent, by registry id.
    System(String),
    /// A custom agent, by stored id.
    Custom(Uuid),
}

impl fmt::Display for AgentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentRef::System(id) => write!(f, "system:{}", id),
            AgentRef::Custom(id) => write!(f, "custom:{}", id),
        }
    }
}

/// Status of a task.
///
/// Only moves forward: `pending -> running -> completed | failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work for one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub agent: AgentRef,
    /// Workspace whose sandbox and channel the task uses.
    pub workspace_id: String,
    pub input: String,
    pub status: TaskStatus,
    /// Failed attempts so far.
    pub attempts: u32,
    pub output: Option<String>,
    pub result_type: Option<String>,
    /// Message of the most recent failure.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(agent: AgentRef, workspace_id: impl Into<String>, input: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            agent,
            workspace_id: workspace_id.into(),
            input: input.into(),
            status: TaskStatus::Pending,
            attempts: 0,
            output: None,
            result_type: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `next`, rejecting backward or skipping moves.
    pub fn transition(&mut self, next: TaskStatus) -> Result<(), ExecutorError> {
        if !self.status.can_transition_to(next) {
            return Err(ExecutorError::IllegalTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Status of a multi-step run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    /// Waiting on a human; resumes to `running`.
    Paused,
}

impl ExecutionStatus {
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Paused)
                | (Paused, Running)
                | (Paused, Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Paused => "paused",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A higher-level run spanning many agent turns and tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub team_id: String,
    /// Realtime channel the run reports on.
    pub channel: String,
    pub instruction: String,
    pub status: ExecutionStatus,
    pub task_ids: Vec<Uuid>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Execution {
    pub fn new(
        team_id: impl Into<String>,
        channel: impl Into<String>,
        instruction: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            team_id: team_id.into(),
            channel: channel.into(),
            instruction: instruction.into(),
            status: ExecutionStatus::Pending,
            task_ids: Vec::new(),
            output: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn transition(&mut self, next: ExecutionStatus) -> Result<(), NetworkError> {
        if !self.status.can_transition_to(next) {
            return Err(NetworkError::IllegalExecutionTransition(
                self.id,
                self.status.to_string(),
                next.to_string(),
            ));
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Pause for human input.
    pub fn pause(&mut self) -> Result<(), NetworkError> {
        self.transition(ExecutionStatus::Paused)
    }

    /// Resume after a pause.
    pub fn resume(&mut self) -> Result<(), NetworkError> {
        self.transition(ExecutionStatus::Running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_status_is_monotonic() {
        use TaskStatus::*;
        let all = [Pending, Running, Completed, Failed];
        for from in all {
            for to in all {
                let allowed = from.can_transition_to(to);
                let expected = matches!(
                    (from, to),
                    (Pending, Running) | (Running, Completed) | (Running, Failed)
                );
                assert_eq!(allowed, expected, "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_task_cannot_skip_running() {
        let mut task = Task::new(AgentRef::System("coder".to_string()), "ws", "do it");
        let err = task.transition(TaskStatus::Completed).unwrap_err();
        assert!(matches!(
            err,
            ExecutorError::IllegalTransition {
                from: TaskStatus::Pending,
                to: TaskStatus::Completed
            }
        ));
        task.transition(TaskStatus::Running).unwrap();
        task.transition(TaskStatus::Failed).unwrap();
        assert!(task.status.is_terminal());
        assert!(task.transition(TaskStatus::Running).is_err());
    }

    #[test]
    fn test_agent_ref_serde() {
        let r = AgentRef::System("coder".to_string());
        assert_eq!(
            serde_json::to_value(&r).unwrap(),
            serde_json::json!({"origin": "system", "id": "coder"})
        );
        assert_eq!(r.to_string(), "system:coder");
    }

    #[test]
    fn test_execution_pause_resume() {
        let mut exec = Execution::new("team", "ws", "build it");
        assert!(exec.pause().is_err());
        exec.transition(ExecutionStatus::Running).unwrap();
        exec.pause().unwrap();
        assert_eq!(exec.status, ExecutionStatus::Paused);
        exec.resume().unwrap();
        exec.transition(ExecutionStatus::Completed).unwrap();
        assert!(exec.resume().is_err());
    }
}
