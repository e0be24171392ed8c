//! Multi-agent orchestration.

mod network;
mod router;

pub use network::{CREATE_AGENT, DELEGATE_TASK, Network, NetworkDeps, NetworkRun};
pub use router::{
    DefaultRouter, NetworkState, RouteDecision, Router, StopReason, Turn, extract_final_answer,
};
