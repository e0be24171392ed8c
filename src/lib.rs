//! Agent session and orchestration engine.
//!
//! Runs coding agents against language-model providers inside remote
//! sandboxes, keeps interactive sandbox sessions recoverable across managing
//! processes, coordinates networks of agents that delegate to one another,
//! and fans lifecycle events out to realtime subscribers.
//!
//! - [`agent`]: agent definitions, tasks and the retrying [`agent::TaskExecutor`]
//! - [`session`]: interactive sessions with broker-replicated descriptors
//! - [`orchestrator`]: the routed multi-agent [`orchestrator::Network`]
//! - [`bus`]: typed pub/sub over the shared broker, plus the SSE endpoint
//! - [`llm`], [`tools`], [`sandbox`], [`store`]: the seams the above run on

pub mod agent;
pub mod bus;
pub mod config;
pub mod error;
pub mod llm;
pub mod orchestrator;
pub mod sandbox;
pub mod session;
pub mod store;
pub mod tools;

#[cfg(test)]
mod testing;
