//! Agent definitions and the read-only system agent registry.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::AgentRef;
use crate::error::ConfigError;
use crate::llm::ProviderKind;

/// Id of the coordinating agent every network starts with.
pub const ORCHESTRATOR: &str = "orchestrator";

const PLACEHOLDER: &str = "{{input}}";

/// Where an agent came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentOrigin {
    System,
    Custom,
}

/// A reusable behavior: prompt, model and tool allowlist.
///
/// Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub reference: AgentRef,
    pub name: String,
    /// Short description of what the agent is for.
    pub role: String,
    pub model: String,
    /// Resolved from `model` when the agent is loaded or created.
    pub provider: ProviderKind,
    pub system_prompt: String,
    /// User-prompt template with an `{{input}}` placeholder.
    pub prompt_template: Option<String>,
    pub tools: Vec<String>,
    /// Tag recorded on tasks completed by this (system) agent.
    pub result_type: Option<String>,
    /// Owning team, for custom agents.
    pub team_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Agent {
    pub fn origin(&self) -> AgentOrigin {
        match self.reference {
            AgentRef::System(_) => AgentOrigin::System,
            AgentRef::Custom(_) => AgentOrigin::Custom,
        }
    }

    /// Build a custom agent for a team.
    pub fn custom(team_id: impl Into<String>, spec: NewAgent, default_model: &str) -> Self {
        let model = spec
            .model
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| default_model.to_string());
        Self {
            reference: AgentRef::Custom(Uuid::new_v4()),
            name: spec.name,
            role: spec.role,
            provider: ProviderKind::for_model(&model),
            model,
            system_prompt: spec.system_prompt,
            prompt_template: None,
            tools: spec.tools,
            result_type: None,
            team_id: Some(team_id.into()),
            created_at: Utc::now(),
        }
    }

    /// Effective user prompt for a task input: the template with every
    /// `{{input}}` replaced, or the input itself when there is no template.
    pub fn render_prompt(&self, input: &str) -> String {
        match &self.prompt_template {
            Some(template) => template.replace(PLACEHOLDER, input),
            None => input.to_string(),
        }
    }
}

/// Parameters for a custom agent, as requested by the orchestrator.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NewAgent {
    pub name: String,
    pub role: String,
    pub system_prompt: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub model: Option<String>,
}

/// On-disk form of a system agent.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentDefinition {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub role: String,
    pub model: String,
    pub system_prompt: String,
    #[serde(default)]
    pub prompt_template: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub result_type: Option<String>,
}

impl AgentDefinition {
    /// A template that never mentions the input would drop it silently.
    pub fn validate(&self) -> Result<(), String> {
        match &self.prompt_template {
            Some(template) if !template.contains(PLACEHOLDER) => Err(format!(
                "agent {}: prompt_template must contain {}",
                self.id, PLACEHOLDER
            )),
            _ => Ok(()),
        }
    }

    pub fn into_agent(self) -> Agent {
        Agent {
            name: self.name.unwrap_or_else(|| self.id.clone()),
            provider: ProviderKind::for_model(&self.model),
            reference: AgentRef::System(self.id),
            role: self.role,
            model: self.model,
            system_prompt: self.system_prompt,
            prompt_template: self.prompt_template,
            tools: self.tools,
            result_type: self.result_type,
            team_id: None,
            created_at: Utc::now(),
        }
    }
}

/// System agents, built once at startup and shared read-only.
#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<Agent>>,
    order: Vec<String>,
}

impl AgentRegistry {
    /// Registry with only the built-in agents.
    pub fn builtin(model: &str) -> Self {
        let mut registry = Self::default();
        for def in builtin_definitions(model) {
            registry.insert(def.into_agent());
        }
        registry
    }

    /// Built-ins plus every `*.json` definition in `dir`. Files override
    /// built-ins with the same id.
    pub fn load(model: &str, dir: Option<&Path>) -> Result<Self, ConfigError> {
        let mut registry = Self::builtin(model);
        if let Some(dir) = dir {
            for agent in load_dir(dir)? {
                registry.insert(agent);
            }
        }
        tracing::info!("Loaded {} system agents", registry.len());
        Ok(registry)
    }

    fn insert(&mut self, agent: Agent) {
        let id = match &agent.reference {
            AgentRef::System(id) => id.clone(),
            AgentRef::Custom(id) => id.to_string(),
        };
        if self.agents.insert(id.clone(), Arc::new(agent)).is_none() {
            self.order.push(id);
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Agent>> {
        self.agents.get(id).cloned()
    }

    /// Agents in load order.
    pub fn all(&self) -> Vec<Arc<Agent>> {
        self.order
            .iter()
            .filter_map(|id| self.agents.get(id).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

/// Read agent definitions from a directory. A missing directory is empty.
pub fn load_dir(dir: &Path) -> Result<Vec<Agent>, ConfigError> {
    let err = |reason: String| ConfigError::AgentDefinitions {
        path: dir.display().to_string(),
        reason,
    };

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No agents directory at {}", dir.display());
            return Ok(Vec::new());
        }
        Err(e) => return Err(err(e.to_string())),
    };

    let mut paths: Vec<_> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();

    let mut agents = Vec::with_capacity(paths.len());
    for path in paths {
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| err(format!("{}: {}", path.display(), e)))?;
        let def: AgentDefinition = serde_json::from_str(&raw)
            .map_err(|e| err(format!("{}: {}", path.display(), e)))?;
        def.validate()
            .map_err(|e| err(format!("{}: {}", path.display(), e)))?;
        tracing::debug!("Loaded agent {} from {}", def.id, path.display());
        agents.push(def.into_agent());
    }
    Ok(agents)
}

fn builtin_definitions(model: &str) -> Vec<AgentDefinition> {
    let all_tools: Vec<String> = crate::tools::BUILTIN_TOOLS
        .iter()
        .map(|s| s.to_string())
        .collect();
    let read_tools: Vec<String> = ["read_file", "list_files", "search_files"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    vec![
        AgentDefinition {
            id: ORCHESTRATOR.to_string(),
            name: Some("Orchestrator".to_string()),
            role: "Plans the work, delegates to specialists, and writes the final answer".to_string(),
            model: model.to_string(),
            system_prompt: "You coordinate a team of agents working in a software workspace. \
                Break the request down, use create_agent to add a specialist when none of the \
                existing agents fits, and delegate_task to hand them subtasks. When the work is \
                done, reply with the result wrapped in <final_answer></final_answer>."
                .to_string(),
            prompt_template: None,
            tools: all_tools.clone(),
            result_type: Some("answer".to_string()),
        },
        AgentDefinition {
            id: "coder".to_string(),
            name: Some("Coder".to_string()),
            role: "Writes and edits code, runs commands and tests".to_string(),
            model: model.to_string(),
            system_prompt: "You are a careful software engineer. Inspect the workspace before \
                changing it, keep edits minimal, and run the relevant checks."
                .to_string(),
            prompt_template: Some("Task:\n{{input}}".to_string()),
            tools: all_tools,
            result_type: Some("code_change".to_string()),
        },
        AgentDefinition {
            id: "researcher".to_string(),
            name: Some("Researcher".to_string()),
            role: "Reads the codebase and answers questions about it".to_string(),
            model: model.to_string(),
            system_prompt: "You answer questions about the workspace by reading files. \
                Cite file paths in your answer."
                .to_string(),
            prompt_template: None,
            tools: read_tools,
            result_type: Some("report".to_string()),
        },
    ]
}
