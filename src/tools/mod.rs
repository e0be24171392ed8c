//! Tool system.
//!
//! Tools are the agent's hands inside the workspace sandbox: running
//! commands, reading and writing files, searching, and driving git. The
//! [`ToolRunner`] is the only path from a model's tool-use payload to a
//! tool, so event emission and allowlist checks happen in one place.

pub mod builtin;

mod registry;
mod runner;
mod tool;

pub use registry::{BUILTIN_TOOLS, ToolRegistry};
pub use runner::{ToolResult, ToolRunner};
pub use tool::{Tool, ToolContext, ToolError, ToolOutput};
