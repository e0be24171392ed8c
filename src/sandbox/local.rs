//! Host-backed sandbox confined to a root directory.
//!
//! Used for local development and the CLI. Commands run through the
//! configured shell with the root as working directory, interactive
//! processes are plain child processes with piped stdio, and directory
//! watching is backed by `notify`.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;

use crate::sandbox::config::SandboxConfig;
use crate::sandbox::error::{Result, SandboxError};
use crate::sandbox::{
    CommandOutput, FileChange, FileChangeKind, OutputCallback, ProcessOptions, Sandbox,
    WatchCallback, WatchHandle,
};

struct LocalProcess {
    child: Child,
    /// Locked per process so a blocked write never holds the table.
    stdin: Arc<Mutex<ChildStdin>>,
}

type ProcessTable = Arc<Mutex<HashMap<u32, LocalProcess>>>;

/// Sandbox that executes on the host inside a root directory.
pub struct LocalSandbox {
    config: SandboxConfig,
    root: PathBuf,
    processes: ProcessTable,
}

impl std::fmt::Debug for LocalSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSandbox")
            .field("root", &self.root)
            .field("shell", &self.config.shell)
            .finish()
    }
}

impl LocalSandbox {
    /// Create a sandbox from configuration.
    pub fn new(config: SandboxConfig) -> Self {
        let root = config
            .root
            .canonicalize()
            .unwrap_or_else(|_| config.root.clone());
        Self {
            config,
            root,
            processes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Create a sandbox rooted at a directory with default settings.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self::new(SandboxConfig::with_root(root))
    }

    /// The canonical root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of interactive processes still tracked.
    pub async fn process_count(&self) -> usize {
        self.processes.lock().await.len()
    }

    /// Resolve a sandbox path to a host path, rejecting escapes.
    fn resolve(&self, path_str: &str) -> Result<PathBuf> {
        let path = Path::new(path_str);
        let joined = if path.is_absolute() {
            if !path.starts_with(&self.root) {
                return Err(SandboxError::PathEscape {
                    path: path_str.to_string(),
                });
            }
            path.to_path_buf()
        } else {
            self.root.join(path)
        };

        // Lexical normalization so files that don't exist yet can be checked.
        let mut normalized = PathBuf::new();
        for component in joined.components() {
            match component {
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(SandboxError::PathEscape {
                            path: path_str.to_string(),
                        });
                    }
                }
                Component::CurDir => {}
                other => normalized.push(other.as_os_str()),
            }
        }

        if !normalized.starts_with(&self.root) {
            return Err(SandboxError::PathEscape {
                path: path_str.to_string(),
            });
        }
        Ok(normalized)
    }

    fn shell_command(&self, script: Option<&str>) -> Command {
        let mut command = Command::new(&self.config.shell);
        if let Some(script) = script {
            if cfg!(target_os = "windows") {
                command.args(["/C", script]);
            } else {
                command.args(["-c", script]);
            }
        }
        command
    }

    fn truncate(&self, bytes: &[u8]) -> String {
        let text = String::from_utf8_lossy(bytes);
        if text.len() <= self.config.max_output_bytes {
            return text.into_owned();
        }
        let mut end = self.config.max_output_bytes;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!(
            "{}\n\n... [truncated, showing first {} bytes]",
            &text[..end],
            end
        )
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    async fn run_command(&self, cmd: &str, timeout: Option<Duration>) -> Result<CommandOutput> {
        let mut command = self.shell_command(Some(cmd));
        command
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        tracing::debug!("Running command in {}: {}", self.root.display(), cmd);

        let output = match timeout {
            Some(limit) => tokio::time::timeout(limit, command.output())
                .await
                .map_err(|_| SandboxError::Timeout(limit))?,
            None => command.output().await,
        }
        .map_err(|e| SandboxError::ExecutionFailed {
            reason: e.to_string(),
        })?;

        Ok(CommandOutput {
            stdout: self.truncate(&output.stdout),
            stderr: self.truncate(&output.stderr),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn open_interactive_process(
        &self,
        options: ProcessOptions,
        on_data: Option<OutputCallback>,
    ) -> Result<u32> {
        let cwd = self.resolve(&options.cwd)?;
        let mut command = self.shell_command(None);
        command
            .current_dir(&cwd)
            .env("COLUMNS", options.cols.to_string())
            .env("LINES", options.rows.to_string())
            .env("TERM", "xterm-256color")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| SandboxError::SpawnFailed {
            reason: e.to_string(),
        })?;
        let pid = child.id().ok_or_else(|| SandboxError::SpawnFailed {
            reason: "process exited before reporting a pid".to_string(),
        })?;
        let stdin = child.stdin.take().ok_or_else(|| SandboxError::SpawnFailed {
            reason: "stdin not captured".to_string(),
        })?;

        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, on_data.clone(), Some((pid, Arc::clone(&self.processes))));
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, on_data, None);
        }

        self.processes
            .lock()
            .await
            .insert(
                pid,
                LocalProcess {
                    child,
                    stdin: Arc::new(Mutex::new(stdin)),
                },
            );

        tracing::info!("Opened interactive process {} in {}", pid, cwd.display());
        Ok(pid)
    }

    async fn send_input(&self, pid: u32, data: &[u8]) -> Result<()> {
        let stdin = self
            .processes
            .lock()
            .await
            .get(&pid)
            .map(|p| Arc::clone(&p.stdin))
            .ok_or_else(|| SandboxError::process_not_found(pid))?;

        let result = {
            let mut stdin = stdin.lock().await;
            match stdin.write_all(data).await {
                Ok(()) => stdin.flush().await,
                Err(e) => Err(e),
            }
        };

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                self.processes.lock().await.remove(&pid);
                Err(SandboxError::process_not_found(pid))
            }
            Err(e) => Err(SandboxError::Io(e)),
        }
    }

    async fn kill_process(&self, pid: u32) -> Result<()> {
        let LocalProcess { mut child, .. } = self
            .processes
            .lock()
            .await
            .remove(&pid)
            .ok_or_else(|| SandboxError::process_not_found(pid))?;

        if let Err(e) = child.kill().await {
            tracing::debug!("Kill of process {} reported: {}", pid, e);
        }
        tracing::info!("Killed interactive process {}", pid);
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<String> {
        let resolved = self.resolve(path)?;
        tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|e| map_io_error(e, path))
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let resolved = self.resolve(path)?;
        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&resolved, content)
            .await
            .map_err(|e| map_io_error(e, path))
    }

    async fn watch_directory(
        &self,
        path: &str,
        recursive: bool,
        on_event: WatchCallback,
    ) -> Result<Box<dyn WatchHandle>> {
        let resolved = self.resolve(path)?;
        if !resolved.exists() {
            return Err(SandboxError::NotFound {
                target: path.to_string(),
            });
        }

        let root = self.root.clone();
        let mut watcher = notify::recommended_watcher(
            move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    let kind = match event.kind {
                        EventKind::Create(_) => FileChangeKind::Create,
                        EventKind::Modify(_) => FileChangeKind::Modify,
                        EventKind::Remove(_) => FileChangeKind::Delete,
                        _ => return,
                    };
                    for changed in event.paths {
                        let relative = changed
                            .strip_prefix(&root)
                            .map(Path::to_path_buf)
                            .unwrap_or(changed);
                        on_event(FileChange {
                            kind,
                            path: relative.to_string_lossy().into_owned(),
                        });
                    }
                }
                Err(e) => tracing::warn!("Directory watcher error: {}", e),
            },
        )?;

        let mode = if recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        watcher.watch(&resolved, mode)?;

        Ok(Box::new(NotifyWatch {
            watcher: std::sync::Mutex::new(Some(watcher)),
        }))
    }
}

/// Forward a process stream to the output callback until EOF.
///
/// The stdout reader also drops the process from the table when the stream
/// closes, so later writes see the process as gone.
fn spawn_reader<R>(
    mut stream: R,
    on_data: Option<OutputCallback>,
    owner: Option<(u32, ProcessTable)>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if let Some(ref cb) = on_data {
                        cb(&buf[..n]);
                    }
                }
                Err(e) => {
                    tracing::debug!("Process stream read error: {}", e);
                    break;
                }
            }
        }
        if let Some((pid, processes)) = owner {
            if processes.lock().await.remove(&pid).is_some() {
                tracing::info!("Interactive process {} exited", pid);
            }
        }
    });
}

fn map_io_error(err: std::io::Error, path: &str) -> SandboxError {
    if err.kind() == std::io::ErrorKind::NotFound {
        SandboxError::NotFound {
            target: path.to_string(),
        }
    } else {
        SandboxError::Io(err)
    }
}

struct NotifyWatch {
    watcher: std::sync::Mutex<Option<RecommendedWatcher>>,
}

impl WatchHandle for NotifyWatch {
    fn stop(&self) {
        if let Ok(mut guard) = self.watcher.lock() {
            guard.take();
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sandbox() -> (tempfile::TempDir, LocalSandbox) {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = LocalSandbox::with_root(dir.path());
        (dir, sandbox)
    }

    #[tokio::test]
    async fn test_run_command_captures_output() {
        let (_dir, sandbox) = sandbox();
        let out = sandbox.run_command("echo hello; echo oops >&2; exit 3", None).await.unwrap();
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
        assert_eq!(out.exit_code, 3);
    }

    #[tokio::test]
    async fn test_run_command_timeout() {
        let (_dir, sandbox) = sandbox();
        let err = sandbox
            .run_command("sleep 5", Some(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_write_then_read_nested_file() {
        let (_dir, sandbox) = sandbox();
        sandbox.write_file("src/lib.rs", "pub fn x() {}").await.unwrap();
        let content = sandbox.read_file("src/lib.rs").await.unwrap();
        assert_eq!(content, "pub fn x() {}");
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let (_dir, sandbox) = sandbox();
        let err = sandbox.read_file("nope.txt").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_path_escape_rejected() {
        let (_dir, sandbox) = sandbox();
        let err = sandbox.read_file("../../etc/passwd").await.unwrap_err();
        assert!(matches!(err, SandboxError::PathEscape { .. }));

        let err = sandbox.write_file("/etc/evil", "x").await.unwrap_err();
        assert!(matches!(err, SandboxError::PathEscape { .. }));
    }

    #[tokio::test]
    async fn test_interactive_process_round_trip() {
        let (_dir, sandbox) = sandbox();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Vec<u8>>();
        let on_data: OutputCallback = Arc::new(move |chunk: &[u8]| {
            let _ = tx.send(chunk.to_vec());
        });

        let pid = sandbox
            .open_interactive_process(
                ProcessOptions {
                    cols: 80,
                    rows: 24,
                    cwd: ".".to_string(),
                },
                Some(on_data),
            )
            .await
            .unwrap();

        sandbox.send_input(pid, b"echo \"ping $COLUMNS\"\n").await.unwrap();

        let mut collected = String::new();
        while !collected.contains("ping 80") {
            let chunk = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("output within timeout")
                .expect("channel open");
            collected.push_str(&String::from_utf8_lossy(&chunk));
        }

        sandbox.kill_process(pid).await.unwrap();
        let err = sandbox.send_input(pid, b"echo again\n").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_kill_unknown_process_is_not_found() {
        let (_dir, sandbox) = sandbox();
        let err = sandbox.kill_process(999_999).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_kill_does_not_wait_for_blocked_writer() {
        let (_dir, sandbox) = sandbox();
        let sandbox = Arc::new(sandbox);
        let pid = sandbox
            .open_interactive_process(
                ProcessOptions {
                    cols: 80,
                    rows: 24,
                    cwd: ".".to_string(),
                },
                None,
            )
            .await
            .unwrap();
        sandbox.send_input(pid, b"sleep 5\n").await.unwrap();

        // The shell is busy, so nothing drains stdin and the pipe fills up.
        let writer = tokio::spawn({
            let sandbox = Arc::clone(&sandbox);
            async move { sandbox.send_input(pid, &vec![b'x'; 1 << 20]).await }
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!writer.is_finished());

        tokio::time::timeout(Duration::from_secs(3), sandbox.kill_process(pid))
            .await
            .expect("kill blocked behind a writer")
            .unwrap();
        let err = tokio::time::timeout(Duration::from_secs(3), sandbox.send_input(pid, b"ls\n"))
            .await
            .expect("send blocked behind a writer")
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(sandbox.process_count().await, 0);
        writer.abort();
    }
}
