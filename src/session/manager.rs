//! Session lifecycle: start, send, stop, restart, recovery and health.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, Weak};

use chrono::Utc;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::bus::{Broker, ChannelPublisher, RealtimeBus, Topic};
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::sandbox::{FileChange, OutputCallback, ProcessOptions, Sandbox, WatchCallback, WatchHandle};
use crate::session::{SendLease, Session, SessionState, descriptor_key};

/// In-process half of a session.
struct Tracked {
    session: Session,
    watcher: Option<Box<dyn WatchHandle>>,
    /// Output forwarders and the health monitor.
    tasks: Vec<JoinHandle<()>>,
}

impl Tracked {
    fn teardown(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.stop();
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

type SessionMap = RwLock<HashMap<String, Tracked>>;

/// Per-workspace start/stop locks. Entries go away once nobody holds them.
#[derive(Default)]
struct LifecycleLocks {
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LifecycleLocks {
    fn acquire(&self, workspace_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(workspace_id.to_string()).or_default())
    }

    fn release(&self, workspace_id: &str, lock: Arc<Mutex<()>>) {
        drop(lock);
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(workspace_id)
            .is_some_and(|l| Arc::strong_count(l) == 1)
        {
            locks.remove(workspace_id);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Decodes terminal output without splitting multi-byte characters.
///
/// An incomplete sequence at the end of a chunk is held back until the next
/// chunk completes it. Bytes that can never form a character become U+FFFD.
#[derive(Debug, Default)]
struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    fn push(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::new();
        let mut start = 0;

        while start < self.pending.len() {
            match std::str::from_utf8(&self.pending[start..]) {
                Ok(text) => {
                    out.push_str(text);
                    start = self.pending.len();
                }
                Err(e) => {
                    let valid = start + e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[start..valid]));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            start = valid + len;
                        }
                        None => {
                            start = valid;
                            break;
                        }
                    }
                }
            }
        }

        self.pending.drain(..start);
        out
    }
}

/// Owns interactive sessions for every workspace this process serves.
pub struct SessionManager {
    sandbox: Arc<dyn Sandbox>,
    bus: Arc<RealtimeBus>,
    broker: Arc<dyn Broker>,
    config: SessionConfig,
    sessions: Arc<SessionMap>,
    /// Serializes start/stop per workspace so none gets two processes here.
    lifecycle: LifecycleLocks,
}

impl SessionManager {
    pub fn new(sandbox: Arc<dyn Sandbox>, bus: Arc<RealtimeBus>, config: SessionConfig) -> Self {
        let broker = bus.broker();
        Self {
            sandbox,
            bus,
            broker,
            config,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            lifecycle: LifecycleLocks::default(),
        }
    }

    /// Start a session, or return the live one already tracked here.
    pub async fn start(&self, workspace_id: &str) -> Result<Session, SessionError> {
        let lock = self.lifecycle.acquire(workspace_id);
        let result = {
            let _guard = lock.lock().await;
            self.start_locked(workspace_id).await
        };
        self.lifecycle.release(workspace_id, lock);
        result
    }

    async fn start_locked(&self, workspace_id: &str) -> Result<Session, SessionError> {
        if let Some(existing) = self
            .get(workspace_id)
            .await
            .filter(|s| s.state == SessionState::Running)
        {
            tracing::debug!("Session {} already running for {}", existing.id, workspace_id);
            return Ok(existing);
        }

        // One process per workspace: retire whatever a previous owner left.
        match self.read_descriptor(workspace_id).await {
            Ok(Some(stale)) => self.kill_quietly(workspace_id, stale).await,
            Ok(None) => {}
            Err(e) => tracing::warn!("Ignoring unreadable descriptor: {}", e),
        }

        let publisher = self.bus.channel(workspace_id);

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let on_data: OutputCallback = Arc::new(move |chunk: &[u8]| {
            let _ = out_tx.send(chunk.to_vec());
        });
        let options = ProcessOptions {
            cols: self.config.cols,
            rows: self.config.rows,
            cwd: self.config.cwd.clone(),
        };
        let pid = self
            .sandbox
            .open_interactive_process(options, Some(on_data))
            .await?;
        let mut tasks = vec![forward_output(publisher.clone(), out_rx)];

        let (fs_tx, fs_rx) = mpsc::unbounded_channel();
        let on_event: WatchCallback = Arc::new(move |change: FileChange| {
            if let Ok(payload) = serde_json::to_value(&change) {
                let _ = fs_tx.send(payload);
            }
        });
        let watcher = match self
            .sandbox
            .watch_directory(&self.config.cwd, true, on_event)
            .await
        {
            Ok(handle) => {
                tasks.push(forward(publisher, Topic::FileChange, fs_rx));
                Some(handle)
            }
            Err(e) => {
                tracing::warn!("File watcher unavailable for {}: {}", workspace_id, e);
                None
            }
        };

        let session = Session::new(workspace_id, pid, false);
        let mut tracked = Tracked {
            session: session.clone(),
            watcher,
            tasks,
        };

        if let Err(e) = self.write_descriptor(workspace_id, pid).await {
            tracked.teardown();
            self.kill_quietly(workspace_id, pid).await;
            return Err(e);
        }

        tracked.tasks.push(spawn_monitor(
            Arc::downgrade(&self.sessions),
            workspace_id.to_string(),
            session.id,
            self.config.clone(),
        ));
        if let Some(mut old) = self
            .sessions
            .write()
            .await
            .insert(workspace_id.to_string(), tracked)
        {
            old.teardown();
        }

        tracing::info!(
            "Started session {} for workspace {} (pid {})",
            session.id,
            workspace_id,
            pid
        );
        Ok(session)
    }

    /// Write `message` plus a newline to the workspace's process.
    ///
    /// Falls back to the persisted descriptor when this process does not
    /// track the session. A vanished process clears both tiers and reports
    /// [`SessionError::SessionExpired`].
    pub async fn send(&self, workspace_id: &str, message: &str) -> Result<(), SessionError> {
        let lease = SendLease::acquire(
            Arc::clone(&self.broker),
            workspace_id,
            self.config.lease_ttl,
            self.config.lease_wait,
        )
        .await?;
        let result = self.send_leased(workspace_id, message).await;
        lease.release().await;
        result
    }

    async fn send_leased(&self, workspace_id: &str, message: &str) -> Result<(), SessionError> {
        let tracked = self
            .sessions
            .read()
            .await
            .get(workspace_id)
            .map(|t| (t.session.id, t.session.pid));
        let (session_id, pid) = match tracked {
            Some(tracked) => tracked,
            None => {
                let session = self.recover(workspace_id).await?;
                (session.id, session.pid)
            }
        };

        let payload = format!("{}\n", message);
        match self.sandbox.send_input(pid, payload.as_bytes()).await {
            Ok(()) => {
                // Only the session that was written to may refresh the descriptor.
                let current = match self.sessions.write().await.get_mut(workspace_id) {
                    Some(t) if t.session.id == session_id => {
                        t.session.last_activity = Utc::now();
                        true
                    }
                    _ => false,
                };
                if current {
                    self.write_descriptor(workspace_id, pid).await
                } else {
                    tracing::debug!("Session for {} ended during send", workspace_id);
                    Ok(())
                }
            }
            Err(e) if e.is_not_found() => {
                tracing::warn!(
                    "Process {} for workspace {} is gone, clearing session",
                    pid,
                    workspace_id
                );
                self.clear(workspace_id).await;
                Err(SessionError::SessionExpired(workspace_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Rebuild a minimal handle from the descriptor: no output, no watcher.
    async fn recover(&self, workspace_id: &str) -> Result<Session, SessionError> {
        let pid = self
            .read_descriptor(workspace_id)
            .await?
            .ok_or_else(|| SessionError::NoActiveSession(workspace_id.to_string()))?;

        let mut sessions = self.sessions.write().await;
        let entry = sessions
            .entry(workspace_id.to_string())
            .or_insert_with(|| Tracked {
                session: Session::new(workspace_id, pid, true),
                watcher: None,
                tasks: Vec::new(),
            });
        tracing::info!(
            "Recovered session for workspace {} from descriptor (pid {})",
            workspace_id,
            entry.session.pid
        );
        Ok(entry.session.clone())
    }

    /// Stop the session: watcher, process and both tiers of state.
    ///
    /// Waits for an in-flight send to finish first, so it cannot refresh a
    /// descriptor this call has already deleted.
    pub async fn stop(&self, workspace_id: &str) -> Result<Option<Session>, SessionError> {
        let lock = self.lifecycle.acquire(workspace_id);
        let result = {
            let _guard = lock.lock().await;
            let lease = match SendLease::acquire(
                Arc::clone(&self.broker),
                workspace_id,
                self.config.lease_ttl,
                self.config.lease_wait,
            )
            .await
            {
                Ok(lease) => Some(lease),
                Err(e) => {
                    tracing::warn!("Stopping {} without the send lease: {}", workspace_id, e);
                    None
                }
            };
            let result = self.stop_locked(workspace_id).await;
            if let Some(lease) = lease {
                lease.release().await;
            }
            result
        };
        self.lifecycle.release(workspace_id, lock);
        result
    }

    async fn stop_locked(&self, workspace_id: &str) -> Result<Option<Session>, SessionError> {
        let tracked = self.sessions.write().await.remove(workspace_id);
        let descriptor = match self.read_descriptor(workspace_id).await {
            Ok(pid) => pid,
            Err(e) => {
                tracing::warn!("Ignoring unreadable descriptor: {}", e);
                None
            }
        };

        let (session, pid) = match (tracked, descriptor) {
            (Some(mut t), _) => {
                t.teardown();
                let pid = t.session.pid;
                (Some(t.session), pid)
            }
            (None, Some(pid)) => (None, pid),
            (None, None) => {
                tracing::warn!("Stop requested for workspace {} with no session", workspace_id);
                return Ok(None);
            }
        };

        self.kill_quietly(workspace_id, pid).await;
        if let Err(e) = self.broker.del(&descriptor_key(workspace_id)).await {
            tracing::warn!("Failed to delete descriptor for {}: {}", workspace_id, e);
        }
        tracing::info!("Stopped session for workspace {} (pid {})", workspace_id, pid);

        Ok(session.map(|mut s| {
            s.state = SessionState::Stopped;
            s
        }))
    }

    /// Stop, start again, then send `context_summary` as the first message.
    pub async fn restart(
        &self,
        workspace_id: &str,
        context_summary: Option<&str>,
    ) -> Result<Session, SessionError> {
        self.stop(workspace_id).await?;
        let session = self.start(workspace_id).await?;
        if let Some(summary) = context_summary.filter(|s| !s.trim().is_empty()) {
            self.send(workspace_id, summary).await?;
        }
        Ok(session)
    }

    /// Whether the tracked session is running and younger than the max age.
    pub async fn health(&self, workspace_id: &str) -> bool {
        self.get(workspace_id)
            .await
            .is_some_and(|s| s.is_healthy(self.config.max_age))
    }

    /// Snapshot of the session tracked here, if any.
    pub async fn get(&self, workspace_id: &str) -> Option<Session> {
        self.sessions
            .read()
            .await
            .get(workspace_id)
            .map(|t| t.session.clone())
    }

    /// Every session tracked here, oldest first.
    pub async fn list(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .sessions
            .read()
            .await
            .values()
            .map(|t| t.session.clone())
            .collect();
        sessions.sort_by_key(|s| s.started_at);
        sessions
    }

    /// Stop every tracked session.
    pub async fn shutdown(&self) {
        let workspaces: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        for workspace_id in workspaces {
            if let Err(e) = self.stop(&workspace_id).await {
                tracing::warn!("Failed to stop session for {}: {}", workspace_id, e);
            }
        }
    }

    async fn clear(&self, workspace_id: &str) {
        if let Some(mut tracked) = self.sessions.write().await.remove(workspace_id) {
            tracked.session.state = SessionState::Crashed;
            tracked.teardown();
        }
        if let Err(e) = self.broker.del(&descriptor_key(workspace_id)).await {
            tracing::warn!("Failed to delete descriptor for {}: {}", workspace_id, e);
        }
    }

    async fn kill_quietly(&self, workspace_id: &str, pid: u32) {
        match self.sandbox.kill_process(pid).await {
            Ok(()) => tracing::debug!("Killed process {} for {}", pid, workspace_id),
            Err(e) if e.is_not_found() => {
                tracing::debug!("Process {} for {} already gone", pid, workspace_id)
            }
            Err(e) => tracing::warn!("Failed to kill process {} for {}: {}", pid, workspace_id, e),
        }
    }

    async fn read_descriptor(&self, workspace_id: &str) -> Result<Option<u32>, SessionError> {
        let Some(raw) = self.broker.get(&descriptor_key(workspace_id)).await? else {
            return Ok(None);
        };
        match raw.trim().parse::<u32>() {
            Ok(pid) => Ok(Some(pid)),
            Err(_) => Err(SessionError::CorruptDescriptor {
                workspace: workspace_id.to_string(),
                value: raw,
            }),
        }
    }

    async fn write_descriptor(&self, workspace_id: &str, pid: u32) -> Result<(), SessionError> {
        self.broker
            .set(
                &descriptor_key(workspace_id),
                &pid.to_string(),
                Some(self.config.inactivity_timeout),
            )
            .await?;
        Ok(())
    }
}

/// Republish terminal output as text, in order.
fn forward_output(
    publisher: ChannelPublisher,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut carry = Utf8Carry::default();
        while let Some(chunk) = rx.recv().await {
            let text = carry.push(&chunk);
            if !text.is_empty() {
                publisher
                    .publish(Topic::TerminalOutput, serde_json::Value::String(text))
                    .await;
            }
        }
    })
}

/// Republish callback payloads on a topic, in order.
fn forward(
    publisher: ChannelPublisher,
    topic: Topic,
    mut rx: mpsc::UnboundedReceiver<serde_json::Value>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            publisher.publish(topic.clone(), payload).await;
        }
    })
}

/// Periodic liveness logging. Exits once its session is no longer tracked.
fn spawn_monitor(
    sessions: Weak<SessionMap>,
    workspace_id: String,
    session_id: Uuid,
    config: SessionConfig,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut liveness = tokio::time::interval(config.health_interval);
        let mut cleanup = tokio::time::interval(config.cleanup_interval);
        liveness.tick().await;
        cleanup.tick().await;

        loop {
            let check_health = tokio::select! {
                _ = liveness.tick() => true,
                _ = cleanup.tick() => false,
            };
            let Some(sessions) = sessions.upgrade() else {
                break;
            };
            let current = sessions
                .read()
                .await
                .get(&workspace_id)
                .filter(|t| t.session.id == session_id)
                .map(|t| t.session.clone());
            let Some(session) = current else {
                break;
            };
            if check_health {
                if session.is_healthy(config.max_age) {
                    tracing::debug!("Session {} for {} healthy", session_id, workspace_id);
                } else {
                    tracing::warn!(
                        "Session {} for {} is unhealthy (state {:?}, started {})",
                        session_id,
                        workspace_id,
                        session.state,
                        session.started_at
                    );
                }
            }
        }
        tracing::debug!("Health monitor for {} exited", workspace_id);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_stream::StreamExt;

    use crate::bus::InMemoryBroker;
    use crate::config::BusConfig;
    use crate::sandbox::FileChangeKind;
    use crate::testing::MockSandbox;

    struct Fixture {
        sandbox: Arc<MockSandbox>,
        broker: Arc<InMemoryBroker>,
        bus: Arc<RealtimeBus>,
    }

    impl Fixture {
        fn new() -> Self {
            let broker = Arc::new(InMemoryBroker::new());
            let bus = Arc::new(RealtimeBus::new(broker.clone(), BusConfig::default()));
            Self {
                sandbox: Arc::new(MockSandbox::new()),
                broker,
                bus,
            }
        }

        /// A fresh managing process sharing the sandbox and broker.
        fn manager(&self) -> SessionManager {
            self.manager_with(SessionConfig::default())
        }

        fn manager_with(&self, config: SessionConfig) -> SessionManager {
            SessionManager::new(self.sandbox.clone(), self.bus.clone(), config)
        }

        async fn descriptor(&self, ws: &str) -> Option<String> {
            self.broker.get(&descriptor_key(ws)).await.unwrap()
        }
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let f = Fixture::new();
        let manager = f.manager();

        let first = manager.start("ws").await.unwrap();
        let second = manager.start("ws").await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(f.sandbox.opened().len(), 1);
        assert_eq!(f.sandbox.opened()[0].cols, 120);
        assert_eq!(f.descriptor("ws").await, Some(first.pid.to_string()));
        assert_eq!(f.sandbox.active_watchers(), vec![(".".to_string(), true)]);
        assert!(manager.health("ws").await);
        assert!(!first.recovered);
    }

    #[tokio::test]
    async fn test_output_and_file_changes_are_republished() {
        let f = Fixture::new();
        let token = f
            .bus
            .issue_token("ws", &[Topic::TerminalOutput, Topic::FileChange]);
        let mut sub = f.bus.subscribe(&token).await.unwrap();
        let manager = f.manager();
        let session = manager.start("ws").await.unwrap();

        f.sandbox.emit_output(session.pid, b"$ ls\r\n");
        f.sandbox.emit_change(FileChange {
            kind: FileChangeKind::Create,
            path: "src/new.rs".to_string(),
        });

        let mut got = Vec::new();
        for _ in 0..2 {
            let msg = sub.next().await.unwrap();
            got.push((msg.topic, msg.payload));
        }
        got.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            got,
            vec![
                (
                    "file-change".to_string(),
                    serde_json::json!({"type": "create", "path": "src/new.rs"})
                ),
                (
                    "terminal-output".to_string(),
                    serde_json::Value::String("$ ls\r\n".to_string())
                ),
            ]
        );
    }

    #[tokio::test]
    async fn test_send_after_stop_is_no_active_session() {
        let f = Fixture::new();
        let manager = f.manager();
        let session = manager.start("ws").await.unwrap();

        let stopped = manager.stop("ws").await.unwrap().unwrap();
        assert_eq!(stopped.state, SessionState::Stopped);
        assert_eq!(f.sandbox.kills(), vec![session.pid]);
        assert!(f.sandbox.active_watchers().is_empty());
        assert_eq!(f.descriptor("ws").await, None);
        assert!(!manager.health("ws").await);

        let err = manager.send("ws", "echo hi").await.unwrap_err();
        assert!(matches!(err, SessionError::NoActiveSession(_)));
    }

    #[tokio::test]
    async fn test_stop_without_session_is_noop() {
        let f = Fixture::new();
        assert!(f.manager().stop("nobody").await.unwrap().is_none());
        assert!(f.sandbox.kills().is_empty());
    }

    #[tokio::test]
    async fn test_send_recovers_from_descriptor() {
        let f = Fixture::new();
        let original = f.manager();
        let session = original.start("ws").await.unwrap();

        // A different managing process with an empty cache.
        let other = f.manager();
        other.send("ws", "cargo test").await.unwrap();

        assert_eq!(f.sandbox.inputs(session.pid), vec!["cargo test\n".to_string()]);
        let recovered = other.get("ws").await.unwrap();
        assert!(recovered.recovered);
        assert_eq!(recovered.pid, session.pid);
        assert_eq!(f.sandbox.opened().len(), 1);
    }

    #[tokio::test]
    async fn test_crash_clears_both_tiers() {
        let f = Fixture::new();
        let manager = f.manager();
        let session = manager.start("ws").await.unwrap();
        f.sandbox.crash(session.pid);

        let err = manager.send("ws", "ls").await.unwrap_err();
        assert!(matches!(err, SessionError::SessionExpired(_)));
        assert!(manager.get("ws").await.is_none());
        assert_eq!(f.descriptor("ws").await, None);
        assert!(f.sandbox.active_watchers().is_empty());

        let err = manager.send("ws", "ls").await.unwrap_err();
        assert!(matches!(err, SessionError::NoActiveSession(_)));
    }

    #[tokio::test]
    async fn test_restart_sends_summary_first() {
        let f = Fixture::new();
        let manager = f.manager();
        let old = manager.start("ws").await.unwrap();

        let new = manager
            .restart("ws", Some("You were fixing the parser."))
            .await
            .unwrap();
        assert_ne!(old.id, new.id);
        assert_ne!(old.pid, new.pid);
        assert!(f.sandbox.kills().contains(&old.pid));
        assert_eq!(
            f.sandbox.inputs(new.pid),
            vec!["You were fixing the parser.\n".to_string()]
        );
    }

    #[tokio::test]
    async fn test_start_retires_orphaned_process() {
        let f = Fixture::new();
        let crashed_owner = f.manager();
        let orphan = crashed_owner.start("ws").await.unwrap();

        let fresh = f.manager().start("ws").await.unwrap();
        assert_ne!(fresh.pid, orphan.pid);
        assert!(!f.sandbox.is_live(orphan.pid));
        assert_eq!(f.descriptor("ws").await, Some(fresh.pid.to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_descriptor_expires_after_inactivity() {
        let f = Fixture::new();
        f.manager().start("ws").await.unwrap();
        let ttl = f.broker.ttl(&descriptor_key("ws")).await.unwrap();
        assert!(ttl > Duration::from_secs(4 * 60 * 60 - 1));

        tokio::time::advance(Duration::from_secs(4 * 60 * 60 + 1)).await;
        let err = f.manager().send("ws", "ls").await.unwrap_err();
        assert!(matches!(err, SessionError::NoActiveSession(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_refreshes_descriptor_ttl() {
        let f = Fixture::new();
        let manager = f.manager();
        manager.start("ws").await.unwrap();

        tokio::time::advance(Duration::from_secs(3 * 60 * 60)).await;
        manager.send("ws", "ls").await.unwrap();
        let ttl = f.broker.ttl(&descriptor_key("ws")).await.unwrap();
        assert!(ttl > Duration::from_secs(3 * 60 * 60));
    }

    #[tokio::test]
    async fn test_concurrent_sends_are_serialized() {
        let f = Fixture::new();
        f.sandbox.set_input_delay(Duration::from_millis(30));
        let manager = Arc::new(f.manager());
        let session = manager.start("ws").await.unwrap();

        let a = tokio::spawn({
            let manager = manager.clone();
            async move { manager.send("ws", "one").await }
        });
        let b = tokio::spawn({
            let manager = manager.clone();
            async move { manager.send("ws", "two").await }
        });
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert_eq!(f.sandbox.max_concurrent_inputs(), 1);
        let mut inputs = f.sandbox.inputs(session.pid);
        inputs.sort();
        assert_eq!(inputs, vec!["one\n".to_string(), "two\n".to_string()]);
    }

    #[tokio::test]
    async fn test_busy_lease_times_out() {
        let f = Fixture::new();
        let manager = f.manager_with(SessionConfig {
            lease_wait: Duration::from_millis(50),
            ..SessionConfig::default()
        });
        manager.start("ws").await.unwrap();

        let held = SendLease::acquire(
            f.bus.broker(),
            "ws",
            Duration::from_secs(10),
            Duration::ZERO,
        )
        .await
        .unwrap();
        let err = manager.send("ws", "ls").await.unwrap_err();
        assert!(matches!(err, SessionError::SessionBusy(_)));
        held.release().await;

        manager.send("ws", "ls").await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_descriptor() {
        let f = Fixture::new();
        f.broker
            .set(&descriptor_key("ws"), "not-a-pid", None)
            .await
            .unwrap();
        let err = f.manager().send("ws", "ls").await.unwrap_err();
        assert!(matches!(err, SessionError::CorruptDescriptor { .. }));
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything() {
        let f = Fixture::new();
        let manager = f.manager();
        manager.start("a").await.unwrap();
        manager.start("b").await.unwrap();
        assert_eq!(manager.list().await.len(), 2);

        manager.shutdown().await;
        assert!(manager.list().await.is_empty());
        assert_eq!(f.sandbox.kills().len(), 2);
        assert_eq!(f.descriptor("a").await, None);
    }

    #[test]
    fn test_utf8_carry_holds_incomplete_tail() {
        let mut carry = Utf8Carry::default();
        let bytes = "é日".as_bytes();
        assert_eq!(carry.push(&bytes[..1]), "");
        assert_eq!(carry.push(&bytes[1..3]), "é");
        assert_eq!(carry.push(&bytes[3..]), "日");
        assert_eq!(carry.push(b"plain"), "plain");
    }

    #[test]
    fn test_utf8_carry_replaces_invalid_bytes() {
        let mut carry = Utf8Carry::default();
        assert_eq!(carry.push(b"a\xFFb"), "a\u{FFFD}b");
        assert_eq!(carry.push(b"\xC3"), "");
        assert_eq!(carry.push(b"(x"), "\u{FFFD}(x");
    }

    #[tokio::test]
    async fn test_split_character_reaches_subscribers_intact() {
        let f = Fixture::new();
        let token = f.bus.issue_token("ws", &[Topic::TerminalOutput]);
        let mut sub = f.bus.subscribe(&token).await.unwrap();
        let session = f.manager().start("ws").await.unwrap();

        let bytes = "é ok".as_bytes();
        f.sandbox.emit_output(session.pid, &bytes[..1]);
        f.sandbox.emit_output(session.pid, &bytes[1..]);

        let msg = sub.next().await.unwrap();
        assert_eq!(msg.payload, serde_json::Value::String("é ok".to_string()));
    }

    #[tokio::test]
    async fn test_stop_during_send_leaves_no_descriptor() {
        let f = Fixture::new();
        f.sandbox.set_input_delay(Duration::from_millis(100));
        let manager = Arc::new(f.manager());
        manager.start("ws").await.unwrap();

        let send = tokio::spawn({
            let manager = manager.clone();
            async move { manager.send("ws", "cargo build").await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.stop("ws").await.unwrap();
        let _ = send.await.unwrap();

        assert_eq!(f.descriptor("ws").await, None);
        let err = f.manager().send("ws", "ls").await.unwrap_err();
        assert!(matches!(err, SessionError::NoActiveSession(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_workspaces_start_independently() {
        let f = Fixture::new();
        f.sandbox.set_spawn_delay(Duration::from_millis(500));
        let manager = f.manager();

        let began = tokio::time::Instant::now();
        let (a, b) = tokio::join!(manager.start("a"), manager.start("b"));
        a.unwrap();
        b.unwrap();
        assert!(began.elapsed() < Duration::from_millis(900));
        assert_eq!(manager.lifecycle.len(), 0);
    }
}
