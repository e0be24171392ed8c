//! Task executor: runs one agent against one task.
//!
//! The effective prompt is the agent's template with `{{input}}` substituted
//! (or the raw input). The adapter comes from the agent's resolved
//! [`ProviderKind`](crate::llm::ProviderKind). Tool-use payloads are run
//! through the [`ToolRunner`] and their results fed back until the model
//! answers in text or the round limit is hit.
//!
//! Every status and attempt change is written to the store before moving on,
//! so observers polling the task see monotonic progress.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::agent::{Agent, AgentRef, AgentRegistry, Task, TaskStatus};
use crate::bus::{AgentEventType, ChannelPublisher, RealtimeBus};
use crate::config::ExecutorConfig;
use crate::error::{ExecutorError, LlmError, StoreError};
use crate::llm::{ProviderRequest, ProviderResponse, ProviderSet, ToolDefinition};
use crate::sandbox::Sandbox;
use crate::store::Store;
use crate::tools::{ToolContext, ToolResult, ToolRunner};

/// Everything the executor needs.
pub struct ExecutorDeps {
    pub providers: Arc<ProviderSet>,
    pub tools: ToolRunner,
    pub sandbox: Arc<dyn Sandbox>,
    pub store: Arc<dyn Store>,
    pub registry: Arc<AgentRegistry>,
    /// Where step and tool events go. `None` keeps the executor silent.
    pub bus: Option<Arc<RealtimeBus>>,
    pub config: ExecutorConfig,
}

/// Runs tasks with bounded retries.
pub struct TaskExecutor {
    deps: ExecutorDeps,
}

impl TaskExecutor {
    pub fn new(deps: ExecutorDeps) -> Self {
        Self { deps }
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.deps.registry
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.deps.store
    }

    pub fn tools(&self) -> &ToolRunner {
        &self.deps.tools
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.deps.config
    }

    /// Tool context for a workspace.
    pub fn tool_context(&self, workspace_id: &str) -> ToolContext {
        ToolContext::new(workspace_id, Arc::clone(&self.deps.sandbox))
    }

    fn events_for(&self, workspace_id: &str) -> Option<ChannelPublisher> {
        self.deps.bus.as_ref().map(|bus| bus.channel(workspace_id))
    }

    /// Persist a new pending task.
    pub async fn submit(
        &self,
        agent: AgentRef,
        workspace_id: &str,
        input: &str,
    ) -> Result<Task, ExecutorError> {
        let task = Task::new(agent, workspace_id, input);
        self.deps.store.create_task(&task).await?;
        tracing::debug!("Submitted task {} for {}", task.id, task.agent);
        Ok(task)
    }

    /// Look up the agent a task points at.
    pub async fn resolve_agent(&self, agent: &AgentRef) -> Result<Arc<Agent>, ExecutorError> {
        match agent {
            AgentRef::System(id) => self
                .deps
                .registry
                .get(id)
                .ok_or_else(|| ExecutorError::Config(format!("unknown system agent '{}'", id))),
            AgentRef::Custom(id) => match self.deps.store.get_custom_agent(*id).await {
                Ok(agent) => Ok(Arc::new(agent)),
                Err(StoreError::NotFound { .. }) => Err(ExecutorError::Config(format!(
                    "custom agent {} not found",
                    id
                ))),
                Err(e) => Err(e.into()),
            },
        }
    }

    /// Reject agents whose allowlist names tools nobody provides.
    pub fn check_tools(&self, agent: &Agent) -> Result<(), ExecutorError> {
        let missing = self.deps.tools.registry().missing(&agent.tools);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ExecutorError::Config(format!(
                "agent '{}' allows unknown tools: {}",
                agent.name,
                missing.join(", ")
            )))
        }
    }

    /// One provider call for `agent`, under the shared rate limiter.
    ///
    /// Tool-calling agents are offered their allowlisted tools plus `extra`.
    /// With `events` set, text deltas are streamed as `text.delta` and all of
    /// them are published before this returns.
    pub async fn call_model(
        &self,
        agent: &Agent,
        prompt: String,
        extra: Vec<ToolDefinition>,
        events: Option<&ChannelPublisher>,
    ) -> Result<ProviderResponse, LlmError> {
        let mut request = ProviderRequest::new(&agent.model, &agent.system_prompt, prompt);
        if agent.provider.supports_tools() {
            let mut tools = self.deps.tools.registry().definitions(&agent.tools);
            tools.extend(extra);
            request = request.with_tools(tools);
        }

        let Some(events) = events.filter(|_| agent.provider.supports_tools()) else {
            return self
                .deps
                .providers
                .complete(agent.provider, request, None)
                .await;
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let publisher = events.clone();
        let agent_name = agent.name.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(delta) = rx.recv().await {
                publisher
                    .emit(
                        AgentEventType::TextDelta,
                        serde_json::json!({"agent": agent_name, "delta": delta}),
                    )
                    .await;
            }
        });

        let result = self
            .deps
            .providers
            .complete(agent.provider, request, Some(tx))
            .await;
        if let Err(e) = forwarder.await {
            tracing::warn!("Delta forwarder for {} ended abnormally: {}", agent.name, e);
        }
        result
    }

    /// Run `agent` on `task` once, including any tool round trips.
    pub async fn execute(&self, agent: &Agent, task: &Task) -> Result<String, ExecutorError> {
        self.check_tools(agent)?;

        let events = self.events_for(&task.workspace_id);
        let ctx = self.tool_context(&task.workspace_id);
        let max_rounds = self.deps.config.max_tool_rounds;
        let mut prompt = agent.render_prompt(&task.input);
        let mut round = 0;

        loop {
            let response = self
                .call_model(agent, prompt.clone(), Vec::new(), events.as_ref())
                .await?;
            let text = response.joined_text();
            let calls = response.tool_uses();

            if calls.is_empty() {
                return text.ok_or(ExecutorError::EmptyOutput);
            }
            if round >= max_rounds {
                return Err(ExecutorError::ToolRoundsExceeded(max_rounds));
            }
            round += 1;

            let mut results = Vec::with_capacity(calls.len());
            for call in &calls {
                results.push(
                    self.deps
                        .tools
                        .run(call, &agent.tools, &ctx, events.as_ref())
                        .await,
                );
            }
            append_transcript(&mut prompt, text.as_deref(), &results);
        }
    }

    /// Run with up to `max_attempts` sequential attempts.
    ///
    /// Configuration errors end the task as failed without consuming an
    /// attempt. After the last failed attempt the task is failed, keeps the
    /// last error message, and that error is returned.
    pub async fn execute_with_retry(
        &self,
        agent: &Agent,
        task: &mut Task,
        max_attempts: u32,
    ) -> Result<String, ExecutorError> {
        let events = self.events_for(&task.workspace_id);
        let max_attempts = max_attempts.max(1);
        self.begin_task(task, events.as_ref()).await?;

        loop {
            match self.execute(agent, task).await {
                Ok(output) => {
                    self.complete_task(task, agent, &output, events.as_ref())
                        .await?;
                    return Ok(output);
                }
                Err(e) if e.is_configuration() => {
                    tracing::error!("Task {} cannot run: {}", task.id, e);
                    self.fail_task(task, &e.to_string(), events.as_ref())
                        .await?;
                    return Err(e);
                }
                Err(e) => {
                    task.attempts += 1;
                    task.error = Some(e.to_string());
                    task.updated_at = Utc::now();
                    self.deps.store.update_task(task).await?;

                    if task.attempts >= max_attempts {
                        tracing::error!(
                            "Task {} failed after {} attempts: {}",
                            task.id,
                            task.attempts,
                            e
                        );
                        self.fail_task(task, &e.to_string(), events.as_ref())
                            .await?;
                        return Err(e);
                    }
                    tracing::warn!(
                        "Task {} attempt {}/{} failed, retrying: {}",
                        task.id,
                        task.attempts,
                        max_attempts,
                        e
                    );
                }
            }
        }
    }

    /// Load a stored task, resolve its agent and run it with retries.
    pub async fn run_task(&self, task_id: Uuid) -> Result<String, ExecutorError> {
        let mut task = self.deps.store.get_task(task_id).await?;
        let agent = match self.resolve_agent(&task.agent).await {
            Ok(agent) => agent,
            Err(e) => {
                let events = self.events_for(&task.workspace_id);
                self.begin_task(&mut task, events.as_ref()).await?;
                self.fail_task(&mut task, &e.to_string(), events.as_ref())
                    .await?;
                return Err(e);
            }
        };
        self.execute_with_retry(&agent, &mut task, self.deps.config.max_attempts)
            .await
    }

    /// `pending -> running`, persisted.
    pub(crate) async fn begin_task(
        &self,
        task: &mut Task,
        events: Option<&ChannelPublisher>,
    ) -> Result<(), ExecutorError> {
        task.transition(TaskStatus::Running)?;
        match self.deps.store.update_task(task).await {
            Err(StoreError::NotFound { .. }) => self.deps.store.create_task(task).await?,
            other => other?,
        }
        if let Some(events) = events {
            events
                .emit(
                    AgentEventType::StepStarted,
                    serde_json::json!({"task_id": task.id, "agent": task.agent.to_string()}),
                )
                .await;
        }
        Ok(())
    }

    /// `running -> completed` with output, persisted.
    pub(crate) async fn complete_task(
        &self,
        task: &mut Task,
        agent: &Agent,
        output: &str,
        events: Option<&ChannelPublisher>,
    ) -> Result<(), ExecutorError> {
        task.output = Some(output.to_string());
        if matches!(task.agent, AgentRef::System(_)) {
            task.result_type = agent.result_type.clone();
        }
        task.transition(TaskStatus::Completed)?;
        self.deps.store.update_task(task).await?;
        tracing::info!("Task {} completed by {}", task.id, agent.name);
        if let Some(events) = events {
            events
                .emit(
                    AgentEventType::StepCompleted,
                    serde_json::json!({
                        "task_id": task.id,
                        "agent": task.agent.to_string(),
                        "attempts": task.attempts,
                        "result_type": task.result_type,
                    }),
                )
                .await;
        }
        Ok(())
    }

    /// `running -> failed` keeping `error`, persisted.
    pub(crate) async fn fail_task(
        &self,
        task: &mut Task,
        error: &str,
        events: Option<&ChannelPublisher>,
    ) -> Result<(), ExecutorError> {
        task.error = Some(error.to_string());
        task.transition(TaskStatus::Failed)?;
        self.deps.store.update_task(task).await?;
        if let Some(events) = events {
            events
                .emit(
                    AgentEventType::StepFailed,
                    serde_json::json!({
                        "task_id": task.id,
                        "agent": task.agent.to_string(),
                        "attempts": task.attempts,
                        "error": error,
                    }),
                )
                .await;
        }
        Ok(())
    }
}

/// Append a model turn and its tool results to a flattened prompt.
fn append_transcript(prompt: &mut String, text: Option<&str>, results: &[ToolResult]) {
    if let Some(text) = text {
        prompt.push_str("\n\nAssistant:\n");
        prompt.push_str(text);
    }
    for result in results {
        prompt.push_str("\n\n");
        prompt.push_str(&result.render());
    }
}
