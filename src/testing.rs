//! Test doubles shared by the unit test suites.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::agent::{Agent, Execution, Task, TaskStatus};
use crate::error::{LlmError, StoreError};
use crate::llm::{
    AgentProvider, DeltaSender, ProviderKind, ProviderMessage, ProviderRequest, ProviderResponse,
};
use crate::sandbox::{
    CommandOutput, FileChange, OutputCallback, ProcessOptions, Result as SandboxResult, Sandbox,
    SandboxError, WatchCallback, WatchHandle,
};
use crate::store::{InMemoryStore, Store};

// --- Sandbox ---

struct Watcher {
    path: String,
    recursive: bool,
    on_event: WatchCallback,
    stopped: Arc<AtomicBool>,
}

struct MockWatchHandle(Arc<AtomicBool>);

impl WatchHandle for MockWatchHandle {
    fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Scriptable in-memory sandbox.
///
/// Unknown commands succeed with empty output. Processes stay live until
/// killed or [`crash`](Self::crash)ed.
pub struct MockSandbox {
    outputs: Mutex<HashMap<String, CommandOutput>>,
    commands: Mutex<Vec<(String, Option<Duration>)>>,
    files: Mutex<HashMap<String, String>>,
    next_pid: AtomicU32,
    live: Mutex<HashSet<u32>>,
    callbacks: Mutex<HashMap<u32, OutputCallback>>,
    opened: Mutex<Vec<ProcessOptions>>,
    inputs: Mutex<Vec<(u32, Vec<u8>)>>,
    kills: Mutex<Vec<u32>>,
    watchers: Mutex<Vec<Watcher>>,
    input_delay: Mutex<Option<Duration>>,
    spawn_delay: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockSandbox {
    pub fn new() -> Self {
        Self {
            outputs: Mutex::new(HashMap::new()),
            commands: Mutex::new(Vec::new()),
            files: Mutex::new(HashMap::new()),
            next_pid: AtomicU32::new(100),
            live: Mutex::new(HashSet::new()),
            callbacks: Mutex::new(HashMap::new()),
            opened: Mutex::new(Vec::new()),
            inputs: Mutex::new(Vec::new()),
            kills: Mutex::new(Vec::new()),
            watchers: Mutex::new(Vec::new()),
            input_delay: Mutex::new(None),
            spawn_delay: Mutex::new(None),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn set_command_output(&self, cmd: &str, stdout: &str, exit_code: i32) {
        self.outputs.lock().unwrap().insert(
            cmd.to_string(),
            CommandOutput {
                stdout: stdout.to_string(),
                stderr: String::new(),
                exit_code,
            },
        );
    }

    pub fn commands(&self) -> Vec<(String, Option<Duration>)> {
        self.commands.lock().unwrap().clone()
    }

    pub fn set_file(&self, path: &str, content: &str) {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), content.to_string());
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.files.lock().unwrap().get(path).cloned()
    }

    /// Make a process vanish without a kill, as a sandbox restart would.
    pub fn crash(&self, pid: u32) {
        self.live.lock().unwrap().remove(&pid);
    }

    pub fn is_live(&self, pid: u32) -> bool {
        self.live.lock().unwrap().contains(&pid)
    }

    pub fn opened(&self) -> Vec<ProcessOptions> {
        self.opened.lock().unwrap().clone()
    }

    /// Everything written to a process, decoded as text.
    pub fn inputs(&self, pid: u32) -> Vec<String> {
        self.inputs
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| *p == pid)
            .map(|(_, data)| String::from_utf8_lossy(data).into_owned())
            .collect()
    }

    pub fn kills(&self) -> Vec<u32> {
        self.kills.lock().unwrap().clone()
    }

    /// Deliver an output chunk to a process's callback, if it has one.
    pub fn emit_output(&self, pid: u32, data: &[u8]) {
        let callback = self.callbacks.lock().unwrap().get(&pid).cloned();
        if let Some(callback) = callback {
            callback(data);
        }
    }

    /// Deliver a change to every active watcher.
    pub fn emit_change(&self, change: FileChange) {
        let callbacks: Vec<WatchCallback> = self
            .watchers
            .lock()
            .unwrap()
            .iter()
            .filter(|w| !w.stopped.load(Ordering::SeqCst))
            .map(|w| Arc::clone(&w.on_event))
            .collect();
        for callback in callbacks {
            callback(change.clone());
        }
    }

    /// Active watchers as `(path, recursive)`.
    pub fn active_watchers(&self) -> Vec<(String, bool)> {
        self.watchers
            .lock()
            .unwrap()
            .iter()
            .filter(|w| !w.stopped.load(Ordering::SeqCst))
            .map(|w| (w.path.clone(), w.recursive))
            .collect()
    }

    /// Hold each `send_input` for `delay` so overlapping writers show up.
    pub fn set_input_delay(&self, delay: Duration) {
        *self.input_delay.lock().unwrap() = Some(delay);
    }

    /// Hold each `open_interactive_process` for `delay`.
    pub fn set_spawn_delay(&self, delay: Duration) {
        *self.spawn_delay.lock().unwrap() = Some(delay);
    }

    /// Highest number of `send_input` calls ever in progress at once.
    pub fn max_concurrent_inputs(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sandbox for MockSandbox {
    async fn run_command(&self, cmd: &str, timeout: Option<Duration>) -> SandboxResult<CommandOutput> {
        self.commands
            .lock()
            .unwrap()
            .push((cmd.to_string(), timeout));
        Ok(self
            .outputs
            .lock()
            .unwrap()
            .get(cmd)
            .cloned()
            .unwrap_or_default())
    }

    async fn open_interactive_process(
        &self,
        options: ProcessOptions,
        on_data: Option<OutputCallback>,
    ) -> SandboxResult<u32> {
        let delay = *self.spawn_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.live.lock().unwrap().insert(pid);
        self.opened.lock().unwrap().push(options);
        if let Some(on_data) = on_data {
            self.callbacks.lock().unwrap().insert(pid, on_data);
        }
        Ok(pid)
    }

    async fn send_input(&self, pid: u32, data: &[u8]) -> SandboxResult<()> {
        if !self.is_live(pid) {
            return Err(SandboxError::process_not_found(pid));
        }
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = *self.input_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.inputs.lock().unwrap().push((pid, data.to_vec()));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    async fn kill_process(&self, pid: u32) -> SandboxResult<()> {
        self.kills.lock().unwrap().push(pid);
        if self.live.lock().unwrap().remove(&pid) {
            self.callbacks.lock().unwrap().remove(&pid);
            Ok(())
        } else {
            Err(SandboxError::process_not_found(pid))
        }
    }

    async fn read_file(&self, path: &str) -> SandboxResult<String> {
        self.file(path).ok_or_else(|| SandboxError::NotFound {
            target: path.to_string(),
        })
    }

    async fn write_file(&self, path: &str, content: &str) -> SandboxResult<()> {
        self.set_file(path, content);
        Ok(())
    }

    async fn watch_directory(
        &self,
        path: &str,
        recursive: bool,
        on_event: WatchCallback,
    ) -> SandboxResult<Box<dyn WatchHandle>> {
        let stopped = Arc::new(AtomicBool::new(false));
        self.watchers.lock().unwrap().push(Watcher {
            path: path.to_string(),
            recursive,
            on_event,
            stopped: Arc::clone(&stopped),
        });
        Ok(Box::new(MockWatchHandle(stopped)))
    }
}

// --- Provider ---

/// Provider that replays a fixed script of responses.
///
/// Text of streamed responses is forwarded word by word. An exhausted script
/// answers with a transient error.
pub struct ScriptedProvider {
    kind: ProviderKind,
    script: Mutex<VecDeque<Result<ProviderResponse, LlmError>>>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<ProviderResponse>) -> Self {
        Self::from_results(responses.into_iter().map(Ok).collect())
    }

    pub fn from_results(script: Vec<Result<ProviderResponse, LlmError>>) -> Self {
        Self {
            kind: ProviderKind::ToolCalling,
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_kind(mut self, kind: ProviderKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentProvider for ScriptedProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(
        &self,
        request: ProviderRequest,
        deltas: Option<DeltaSender>,
    ) -> Result<ProviderResponse, LlmError> {
        self.requests.lock().unwrap().push(request);
        let next = self.script.lock().unwrap().pop_front();
        let response = next.unwrap_or_else(|| {
            Err(LlmError::RequestFailed {
                provider: "scripted".to_string(),
                reason: "script exhausted".to_string(),
            })
        })?;

        if let Some(deltas) = deltas {
            for message in &response.messages {
                if let ProviderMessage::Text(text) = message {
                    for word in text.split_inclusive(' ') {
                        let _ = deltas.send(word.to_string());
                    }
                }
            }
        }
        Ok(response)
    }
}

// --- Store ---

/// [`InMemoryStore`] that also records every task write.
pub struct RecordingStore {
    inner: InMemoryStore,
    writes: Mutex<Vec<(Uuid, TaskStatus, u32)>>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self {
            inner: InMemoryStore::new(),
            writes: Mutex::new(Vec::new()),
        }
    }

    pub fn inner(&self) -> &InMemoryStore {
        &self.inner
    }

    /// Statuses written for a task, consecutive repeats collapsed.
    pub fn statuses(&self, id: Uuid) -> Vec<TaskStatus> {
        let mut statuses: Vec<TaskStatus> = self
            .writes
            .lock()
            .unwrap()
            .iter()
            .filter(|(task, _, _)| *task == id)
            .map(|(_, status, _)| *status)
            .collect();
        statuses.dedup();
        // Creation writes the initial pending state.
        if statuses.first() == Some(&TaskStatus::Pending) {
            statuses.remove(0);
        }
        statuses
    }

    /// Attempt counts in write order.
    pub fn attempts(&self, id: Uuid) -> Vec<u32> {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .filter(|(task, _, _)| *task == id)
            .map(|(_, _, attempts)| *attempts)
            .collect()
    }

    fn record(&self, task: &Task) {
        self.writes
            .lock()
            .unwrap()
            .push((task.id, task.status, task.attempts));
    }
}

#[async_trait]
impl Store for RecordingStore {
    async fn create_task(&self, task: &Task) -> Result<(), StoreError> {
        self.inner.create_task(task).await?;
        self.record(task);
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Task, StoreError> {
        self.inner.get_task(id).await
    }

    async fn update_task(&self, task: &Task) -> Result<(), StoreError> {
        self.inner.update_task(task).await?;
        self.record(task);
        Ok(())
    }

    async fn create_execution(&self, execution: &Execution) -> Result<(), StoreError> {
        self.inner.create_execution(execution).await
    }

    async fn get_execution(&self, id: Uuid) -> Result<Execution, StoreError> {
        self.inner.get_execution(id).await
    }

    async fn update_execution(&self, execution: &Execution) -> Result<(), StoreError> {
        self.inner.update_execution(execution).await
    }

    async fn create_custom_agent(&self, agent: &Agent) -> Result<(), StoreError> {
        self.inner.create_custom_agent(agent).await
    }

    async fn get_custom_agent(&self, id: Uuid) -> Result<Agent, StoreError> {
        self.inner.get_custom_agent(id).await
    }

    async fn list_custom_agents(&self, team_id: &str) -> Result<Vec<Agent>, StoreError> {
        self.inner.list_custom_agents(team_id).await
    }
}
