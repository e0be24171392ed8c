//! Agents, tasks and the single-agent executor.

mod definition;
mod executor;
mod task;

pub use definition::{
    Agent, AgentDefinition, AgentOrigin, AgentRegistry, NewAgent, ORCHESTRATOR, load_dir,
};
pub use executor::{ExecutorDeps, TaskExecutor};
pub use task::{AgentRef, Execution, ExecutionStatus, Task, TaskStatus};
