//! Built-in tool catalog available to every agent, subject to its allowlist.

mod file;
mod git;
mod search;
mod shell;

pub use file::{ListFilesTool, ReadFileTool, WriteFileTool};
pub use git::GitTool;
pub use search::SearchFilesTool;
pub use shell::ExecuteCommandTool;

/// Maximum output size handed back to the model (64KB).
pub(crate) const MAX_OUTPUT_SIZE: usize = 64 * 1024;

/// Quote a string for POSIX `sh`.
pub(crate) fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c))
    {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// Truncate output to [`MAX_OUTPUT_SIZE`] on a char boundary.
pub(crate) fn truncate_output(s: &str) -> String {
    if s.len() <= MAX_OUTPUT_SIZE {
        return s.to_string();
    }
    let mut end = MAX_OUTPUT_SIZE;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!(
        "{}\n\n... [truncated, {} bytes total]",
        &s[..end],
        s.len()
    )
}
