//! Routing policy for the orchestration network.
//!
//! After every turn the router looks at the run so far and either names the
//! agent that goes next or stops the run.

use std::sync::OnceLock;

use regex::Regex;

use crate::tools::ToolResult;

/// One completed agent turn.
#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    /// Network key of the agent that ran.
    pub agent: String,
    pub text: Option<String>,
    /// Names of the tools the agent called, in order.
    pub tool_calls: Vec<String>,
    pub results: Vec<ToolResult>,
}

/// What the router sees.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkState {
    /// Agent that runs first and receives control back.
    pub default_agent: String,
    pub turns: Vec<Turn>,
    pub final_answer: Option<String>,
}

impl NetworkState {
    pub fn new(default_agent: impl Into<String>) -> Self {
        Self {
            default_agent: default_agent.into(),
            turns: Vec::new(),
            final_answer: None,
        }
    }

    /// Most recent non-empty text, for partial output.
    pub fn last_text(&self) -> Option<&str> {
        self.turns.iter().rev().find_map(|t| t.text.as_deref())
    }
}

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// An answer was already recorded.
    Answered,
    /// The latest text carried a delimited final answer.
    FinalAnswer,
    /// The latest turn was plain text with no tool call.
    Conversational,
    /// Turn ceiling reached without a conclusion.
    MaxIterations,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::Answered => "answered",
            StopReason::FinalAnswer => "final_answer",
            StopReason::Conversational => "conversational",
            StopReason::MaxIterations => "max_iterations",
        }
    }
}

/// A routing decision.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteDecision {
    /// Run this agent next.
    Next(String),
    /// Stop, recording `answer` if given.
    Stop {
        reason: StopReason,
        answer: Option<String>,
    },
}

/// Routing policy seam.
pub trait Router: Send + Sync {
    fn route(&self, state: &NetworkState) -> RouteDecision;
}

/// The standard policy:
///
/// 1. an answer is already recorded: stop
/// 2. latest text has `<final_answer>...</final_answer>`: record the trimmed
///    inner content and stop
/// 3. latest turn is text without tool calls: record it verbatim and stop
/// 4. latest turn has tool results but no text: same agent again
/// 5. anything else, including the first turn: the default agent
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRouter;

impl Router for DefaultRouter {
    fn route(&self, state: &NetworkState) -> RouteDecision {
        if state.final_answer.is_some() {
            return RouteDecision::Stop {
                reason: StopReason::Answered,
                answer: None,
            };
        }

        let Some(last) = state.turns.last() else {
            return RouteDecision::Next(state.default_agent.clone());
        };

        if let Some(text) = &last.text {
            if let Some(answer) = extract_final_answer(text) {
                return RouteDecision::Stop {
                    reason: StopReason::FinalAnswer,
                    answer: Some(answer),
                };
            }
            if last.tool_calls.is_empty() {
                return RouteDecision::Stop {
                    reason: StopReason::Conversational,
                    answer: Some(text.clone()),
                };
            }
        } else if !last.results.is_empty() {
            return RouteDecision::Next(last.agent.clone());
        }

        RouteDecision::Next(state.default_agent.clone())
    }
}

/// Inner content of the first `<final_answer>` block, trimmed.
pub fn extract_final_answer(text: &str) -> Option<String> {
    static FINAL_ANSWER: OnceLock<Regex> = OnceLock::new();
    let re = FINAL_ANSWER.get_or_init(|| {
        Regex::new(r"(?s)<final_answer>(.*?)</final_answer>").expect("final answer pattern")
    });
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
}
