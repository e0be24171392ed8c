//! Orchestration network: a root orchestrator plus a pool of system and
//! team-owned custom agents, driven turn by turn under a [`Router`].
//!
//! The orchestrator gets two extra actions on top of its tool allowlist:
//! `create_agent` adds a custom agent to the team (reused by name, bounded
//! in number) and `delegate_task` runs a routed sub-loop with another agent
//! and returns its answer. Every run is recorded as an [`Execution`] and
//! reported on the workspace channel.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::agent::{
    Agent, AgentOrigin, AgentRef, Execution, ExecutionStatus, NewAgent, ORCHESTRATOR, Task,
    TaskExecutor,
};
use crate::bus::{AgentEventType, ChannelPublisher, RealtimeBus};
use crate::config::NetworkConfig;
use crate::error::{NetworkError, StoreError};
use crate::llm::{ProviderResponse, ToolDefinition, ToolUse};
use crate::orchestrator::router::{
    DefaultRouter, NetworkState, RouteDecision, Router, StopReason, Turn,
};
use crate::tools::{BUILTIN_TOOLS, ToolError, ToolRunner};

/// Orchestrator action that defines a new custom agent.
pub const CREATE_AGENT: &str = "create_agent";
/// Orchestrator action that hands a subtask to another agent.
pub const DELEGATE_TASK: &str = "delegate_task";

pub struct NetworkDeps {
    pub executor: Arc<TaskExecutor>,
    pub bus: Arc<RealtimeBus>,
    pub config: NetworkConfig,
}

/// Outcome of a network run.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkRun {
    pub execution_id: Uuid,
    /// Recorded final answer, if the router found one.
    pub answer: Option<String>,
    /// The answer, or the latest text when the run was cut off.
    pub output: String,
    pub turns: usize,
    pub stop: StopReason,
}

struct LoopOutcome {
    answer: Option<String>,
    partial: Option<String>,
    turns: usize,
    stop: StopReason,
}

impl LoopOutcome {
    fn new(state: NetworkState, stop: StopReason) -> Self {
        Self {
            partial: state.last_text().map(String::from),
            turns: state.turns.len(),
            answer: state.final_answer,
            stop,
        }
    }

    fn output(&self) -> Option<String> {
        self.answer.clone().or_else(|| self.partial.clone())
    }
}

/// Agents reachable in one run, keyed by system id or custom name.
#[derive(Default)]
struct AgentPool {
    agents: HashMap<String, Arc<Agent>>,
    order: Vec<String>,
    custom: usize,
}

impl AgentPool {
    async fn load(executor: &TaskExecutor, team_id: &str) -> Result<Self, StoreError> {
        let mut pool = Self::default();
        for agent in executor.registry().all() {
            if let AgentRef::System(id) = &agent.reference {
                pool.insert(id.clone(), agent.clone());
            }
        }
        for agent in executor.store().list_custom_agents(team_id).await? {
            let name = agent.name.clone();
            if !pool.insert(name.clone(), Arc::new(agent)) {
                tracing::warn!("Custom agent {} is shadowed by a system agent", name);
            }
        }
        Ok(pool)
    }

    fn insert(&mut self, key: String, agent: Arc<Agent>) -> bool {
        if self.agents.contains_key(&key) {
            return false;
        }
        if agent.origin() == AgentOrigin::Custom {
            self.custom += 1;
        }
        self.agents.insert(key.clone(), agent);
        self.order.push(key);
        true
    }

    fn get(&self, key: &str) -> Option<Arc<Agent>> {
        self.agents.get(key).cloned()
    }

    fn roster(&self) -> impl Iterator<Item = (&str, &Agent)> {
        self.order
            .iter()
            .filter_map(|key| self.agents.get(key).map(|a| (key.as_str(), a.as_ref())))
    }
}

struct RunContext {
    execution: Execution,
    pool: AgentPool,
    events: ChannelPublisher,
}

#[derive(Debug, Deserialize)]
struct DelegateParams {
    agent: String,
    task: String,
}

/// Drives multi-agent runs.
pub struct Network {
    executor: Arc<TaskExecutor>,
    bus: Arc<RealtimeBus>,
    config: NetworkConfig,
    router: Arc<dyn Router>,
}

impl Network {
    pub fn new(deps: NetworkDeps) -> Self {
        Self {
            executor: deps.executor,
            bus: deps.bus,
            config: deps.config,
            router: Arc::new(DefaultRouter),
        }
    }

    /// Replace the routing policy.
    pub fn with_router(mut self, router: Arc<dyn Router>) -> Self {
        self.router = router;
        self
    }

    /// Run `instruction` for a team, reporting on the workspace channel.
    pub async fn run(
        &self,
        team_id: &str,
        workspace_id: &str,
        instruction: &str,
    ) -> Result<NetworkRun, NetworkError> {
        let store = self.executor.store();
        let mut execution = Execution::new(team_id, workspace_id, instruction);
        store.create_execution(&execution).await?;
        execution.transition(ExecutionStatus::Running)?;
        store.update_execution(&execution).await?;

        let events = self.bus.channel(workspace_id);
        events
            .emit(
                AgentEventType::RunStarted,
                serde_json::json!({
                    "execution_id": execution.id,
                    "team_id": team_id,
                    "instruction": instruction,
                }),
            )
            .await;
        tracing::info!("Execution {} started for team {}", execution.id, team_id);

        let mut ctx = RunContext {
            execution,
            pool: AgentPool::default(),
            events,
        };
        let result = match AgentPool::load(&self.executor, team_id).await {
            Ok(pool) => {
                ctx.pool = pool;
                self.drive(&mut ctx, instruction, ORCHESTRATOR, 0).await
            }
            Err(e) => Err(e.into()),
        };
        self.finish(ctx, result).await
    }

    async fn finish(
        &self,
        mut ctx: RunContext,
        result: Result<LoopOutcome, NetworkError>,
    ) -> Result<NetworkRun, NetworkError> {
        let store = self.executor.store();
        let execution_id = ctx.execution.id;

        match result {
            Ok(outcome) => {
                let output = outcome.output().unwrap_or_default();
                ctx.execution.output = Some(output.clone());
                ctx.execution.transition(ExecutionStatus::Completed)?;
                store.update_execution(&ctx.execution).await?;
                ctx.events
                    .emit(
                        AgentEventType::RunCompleted,
                        serde_json::json!({
                            "execution_id": execution_id,
                            "output": output,
                            "answer": outcome.answer,
                            "turns": outcome.turns,
                            "stop_reason": outcome.stop.as_str(),
                        }),
                    )
                    .await;
                tracing::info!(
                    "Execution {} completed after {} turns ({})",
                    execution_id,
                    outcome.turns,
                    outcome.stop.as_str()
                );
                Ok(NetworkRun {
                    execution_id,
                    answer: outcome.answer,
                    output,
                    turns: outcome.turns,
                    stop: outcome.stop,
                })
            }
            Err(e) => {
                tracing::error!("Execution {} failed: {}", execution_id, e);
                ctx.execution.error = Some(e.to_string());
                ctx.execution.transition(ExecutionStatus::Failed)?;
                store.update_execution(&ctx.execution).await?;
                ctx.events
                    .emit(
                        AgentEventType::RunFailed,
                        serde_json::json!({
                            "execution_id": execution_id,
                            "error": e.to_string(),
                        }),
                    )
                    .await;
                Err(e)
            }
        }
    }

    /// Route and run turns until the router stops or the ceiling is hit.
    async fn drive(
        &self,
        ctx: &mut RunContext,
        input: &str,
        default_agent: &str,
        depth: usize,
    ) -> Result<LoopOutcome, NetworkError> {
        let mut state = NetworkState::new(default_agent);

        loop {
            match self.router.route(&state) {
                RouteDecision::Stop { reason, answer } => {
                    if answer.is_some() {
                        state.final_answer = answer;
                    }
                    return Ok(LoopOutcome::new(state, reason));
                }
                RouteDecision::Next(key) => {
                    if state.turns.len() >= self.config.max_iter {
                        tracing::warn!(
                            "Execution {} reached {} turns without an answer, returning partial output",
                            ctx.execution.id,
                            self.config.max_iter
                        );
                        return Ok(LoopOutcome::new(state, StopReason::MaxIterations));
                    }
                    let agent = ctx
                        .pool
                        .get(&key)
                        .ok_or_else(|| NetworkError::UnknownAgent(key.clone()))?;
                    let turn = self.turn(ctx, &key, &agent, input, &state, depth).await?;
                    state.turns.push(turn);
                }
            }
        }
    }

    async fn turn(
        &self,
        ctx: &mut RunContext,
        key: &str,
        agent: &Agent,
        input: &str,
        state: &NetworkState,
        depth: usize,
    ) -> Result<Turn, NetworkError> {
        let number = state.turns.len() + 1;
        let execution_id = ctx.execution.id;
        let events = ctx.events.clone();
        let is_orchestrator = key == ORCHESTRATOR;

        events
            .emit(
                AgentEventType::StepStarted,
                serde_json::json!({
                    "execution_id": execution_id,
                    "agent": key,
                    "turn": number,
                    "depth": depth,
                }),
            )
            .await;

        let extra = if is_orchestrator {
            self.network_tools(depth)
        } else {
            Vec::new()
        };
        let prompt = build_prompt(&ctx.pool, agent, is_orchestrator, input, &state.turns);

        let response = match self.call(agent, prompt, extra, &events).await {
            Ok(response) => response,
            Err(e) => {
                events
                    .emit(
                        AgentEventType::StepFailed,
                        serde_json::json!({
                            "execution_id": execution_id,
                            "agent": key,
                            "turn": number,
                            "error": e.to_string(),
                        }),
                    )
                    .await;
                return Err(e);
            }
        };

        let text = response.joined_text();
        if let Some(text) = &text {
            events
                .emit(
                    AgentEventType::TextCompleted,
                    serde_json::json!({"execution_id": execution_id, "agent": key, "text": text}),
                )
                .await;
            events
                .emit(
                    AgentEventType::PartCreated,
                    serde_json::json!({
                        "execution_id": execution_id,
                        "agent": key,
                        "part": {"type": "text", "content": text},
                    }),
                )
                .await;
        }

        let calls = response.tool_uses();
        let tool_ctx = self.executor.tool_context(&ctx.execution.channel);
        let mut results = Vec::with_capacity(calls.len());
        for call in &calls {
            events
                .emit(
                    AgentEventType::PartCreated,
                    serde_json::json!({
                        "execution_id": execution_id,
                        "agent": key,
                        "part": {"type": "tool_call", "id": call.id, "name": call.name},
                    }),
                )
                .await;
            let result = match call.name.as_str() {
                CREATE_AGENT if is_orchestrator => {
                    ToolRunner::observe(call, Some(&events), self.create_agent(ctx, call)).await
                }
                DELEGATE_TASK if is_orchestrator => {
                    ToolRunner::observe(call, Some(&events), self.delegate(ctx, call, depth))
                        .await
                }
                _ => {
                    self.executor
                        .tools()
                        .run(call, &agent.tools, &tool_ctx, Some(&events))
                        .await
                }
            };
            results.push(result);
        }

        events
            .emit(
                AgentEventType::StepCompleted,
                serde_json::json!({
                    "execution_id": execution_id,
                    "agent": key,
                    "turn": number,
                    "tool_calls": calls.len(),
                }),
            )
            .await;

        Ok(Turn {
            agent: key.to_string(),
            text,
            tool_calls: calls.iter().map(|c| c.name.clone()).collect(),
            results,
        })
    }

    async fn call(
        &self,
        agent: &Agent,
        prompt: String,
        extra: Vec<ToolDefinition>,
        events: &ChannelPublisher,
    ) -> Result<ProviderResponse, NetworkError> {
        self.executor.check_tools(agent)?;
        Ok(self
            .executor
            .call_model(agent, prompt, extra, Some(events))
            .await?)
    }

    async fn create_agent(&self, ctx: &mut RunContext, call: &ToolUse) -> Result<String, ToolError> {
        let spec: NewAgent = serde_json::from_value(call.input.clone())
            .map_err(|e| ToolError::InvalidParameters(e.to_string()))?;
        let name = spec.name.trim().to_string();
        if name.is_empty() {
            return Err(ToolError::InvalidParameters(
                "agent name must not be empty".to_string(),
            ));
        }
        if let Some(unknown) = spec
            .tools
            .iter()
            .find(|t| !BUILTIN_TOOLS.contains(&t.as_str()))
        {
            return Err(ToolError::InvalidParameters(format!(
                "unknown tool '{}'",
                unknown
            )));
        }

        if let Some(existing) = ctx.pool.get(&name) {
            return match existing.origin() {
                AgentOrigin::Custom => {
                    tracing::info!("Reusing custom agent {} for team {}", name, ctx.execution.team_id);
                    Ok(serde_json::json!({
                        "id": existing.reference.to_string(),
                        "name": name,
                        "model": existing.model,
                        "reused": true,
                    })
                    .to_string())
                }
                AgentOrigin::System => Err(ToolError::InvalidParameters(format!(
                    "'{}' is the name of a system agent",
                    name
                ))),
            };
        }

        if ctx.pool.custom >= self.config.max_custom_agents {
            return Err(ToolError::ExecutionFailed(format!(
                "team {} already has {} custom agents; reuse one of them",
                ctx.execution.team_id, self.config.max_custom_agents
            )));
        }

        let agent = Agent::custom(
            ctx.execution.team_id.clone(),
            NewAgent {
                name: name.clone(),
                ..spec
            },
            &self.config.default_model,
        );
        self.executor
            .store()
            .create_custom_agent(&agent)
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;

        let reply = serde_json::json!({
            "id": agent.reference.to_string(),
            "name": name,
            "model": agent.model,
            "reused": false,
        })
        .to_string();
        tracing::info!("Created custom agent {} for team {}", name, ctx.execution.team_id);
        ctx.pool.insert(name, Arc::new(agent));
        Ok(reply)
    }

    async fn delegate(
        &self,
        ctx: &mut RunContext,
        call: &ToolUse,
        depth: usize,
    ) -> Result<String, ToolError> {
        let params: DelegateParams = serde_json::from_value(call.input.clone())
            .map_err(|e| ToolError::InvalidParameters(e.to_string()))?;
        if depth >= self.config.max_delegation_depth {
            return Err(ToolError::NotAuthorized(format!(
                "delegation depth limit {} reached",
                self.config.max_delegation_depth
            )));
        }
        if params.agent == ORCHESTRATOR {
            return Err(ToolError::InvalidParameters(
                "cannot delegate to the orchestrator".to_string(),
            ));
        }
        let agent = ctx.pool.get(&params.agent).ok_or_else(|| {
            ToolError::InvalidParameters(format!("unknown agent '{}'", params.agent))
        })?;

        let failed = |e: &dyn std::fmt::Display| ToolError::ExecutionFailed(e.to_string());
        let store = self.executor.store();
        let events = ctx.events.clone();

        let mut task = Task::new(
            agent.reference.clone(),
            ctx.execution.channel.clone(),
            params.task.clone(),
        );
        store.create_task(&task).await.map_err(|e| failed(&e))?;
        ctx.execution.task_ids.push(task.id);
        ctx.execution.updated_at = Utc::now();
        store
            .update_execution(&ctx.execution)
            .await
            .map_err(|e| failed(&e))?;
        self.executor
            .begin_task(&mut task, Some(&events))
            .await
            .map_err(|e| failed(&e))?;
        tracing::debug!("Delegating task {} to {}", task.id, params.agent);

        let outcome = Box::pin(self.drive(ctx, &params.task, &params.agent, depth + 1)).await;
        match outcome.map(|o| o.output()) {
            Ok(Some(output)) => {
                self.executor
                    .complete_task(&mut task, &agent, &output, Some(&events))
                    .await
                    .map_err(|e| failed(&e))?;
                Ok(output)
            }
            Ok(None) => {
                let message = format!("{} finished without an answer", params.agent);
                self.executor
                    .fail_task(&mut task, &message, Some(&events))
                    .await
                    .map_err(|e| failed(&e))?;
                Err(ToolError::ExecutionFailed(message))
            }
            Err(e) => {
                let message = e.to_string();
                self.executor
                    .fail_task(&mut task, &message, Some(&events))
                    .await
                    .map_err(|e| failed(&e))?;
                Err(ToolError::ExecutionFailed(message))
            }
        }
    }

    fn network_tools(&self, depth: usize) -> Vec<ToolDefinition> {
        let mut tools = vec![ToolDefinition {
            name: CREATE_AGENT.to_string(),
            description: "Define a specialist agent for this team. An existing custom agent \
                          with the same name is reused."
                .to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string", "description": "Unique agent name"},
                    "role": {"type": "string", "description": "What the agent is for"},
                    "system_prompt": {"type": "string"},
                    "tools": {
                        "type": "array",
                        "items": {"type": "string", "enum": BUILTIN_TOOLS},
                    },
                    "model": {"type": "string", "description": "Optional model override"}
                },
                "required": ["name", "role", "system_prompt"]
            }),
        }];
        if depth < self.config.max_delegation_depth {
            tools.push(ToolDefinition {
                name: DELEGATE_TASK.to_string(),
                description: "Hand a subtask to a named agent and get its answer back.".to_string(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "agent": {"type": "string", "description": "Agent name or id"},
                        "task": {"type": "string", "description": "Self-contained instructions"}
                    },
                    "required": ["agent", "task"]
                }),
            });
        }
        tools
    }
}

/// Flatten the run so far into one prompt for the next agent.
fn build_prompt(
    pool: &AgentPool,
    agent: &Agent,
    is_orchestrator: bool,
    input: &str,
    turns: &[Turn],
) -> String {
    let mut prompt = agent.render_prompt(input);

    if is_orchestrator {
        let roster: Vec<String> = pool
            .roster()
            .filter(|(key, _)| *key != ORCHESTRATOR)
            .map(|(key, a)| format!("- {}: {}", key, a.role))
            .collect();
        if !roster.is_empty() {
            prompt.push_str("\n\nAgents you can delegate to:\n");
            prompt.push_str(&roster.join("\n"));
        }
    }

    for turn in turns {
        if let Some(text) = &turn.text {
            prompt.push_str(&format!("\n\n[{}]\n{}", turn.agent, text));
        }
        for result in &turn.results {
            prompt.push_str("\n\n");
            prompt.push_str(&result.render());
        }
    }
    prompt
}
