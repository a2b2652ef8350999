//! Session lifecycle: one agent, one worker thread, at most one live connection.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;

use chat_bridge_agent_runtime::{Agent, AgentConfig, AgentHooks, AgentRuntime};
use chat_bridge_error::BridgeError;

use crate::bridge::{Bridge, BridgeConfig};
use crate::protocol::ServerEnvelope;

const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub reconnect_timeout: Duration,
    pub bridge: BridgeConfig,
    pub agent: AgentConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconnect_timeout: Duration::from_secs(300),
            bridge: BridgeConfig::default(),
            agent: AgentConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Receiving side of a session's outbound queue.
///
/// The head envelope stays queued until a writer commits it, so a write that
/// fails or is abandoned leaves it for the next connection, in order.
#[derive(Debug)]
pub struct Outbound {
    rx: mpsc::Receiver<ServerEnvelope>,
    head: VecDeque<ServerEnvelope>,
}

impl Outbound {
    fn new(rx: mpsc::Receiver<ServerEnvelope>) -> Self {
        Self {
            rx,
            head: VecDeque::new(),
        }
    }

    /// Returns the oldest undelivered envelope without removing it.
    ///
    /// Cancel safe: nothing is lost if the future is dropped before completion.
    pub async fn peek(&mut self) -> Option<ServerEnvelope> {
        if self.head.is_empty() {
            let envelope = self.rx.recv().await?;
            self.head.push_back(envelope);
        }
        self.head.front().cloned()
    }

    /// Marks the envelope returned by the last `peek` as delivered.
    pub fn commit(&mut self) {
        self.head.pop_front();
    }

    fn close(&mut self) {
        self.rx.close();
    }
}

#[derive(Debug)]
struct SessionInner {
    state: SessionState,
    generation: u64,
    reconnect_timer: Option<AbortHandle>,
}

enum Worker {
    Pending(Box<dyn Agent>),
    Running(thread::JoinHandle<()>),
    Idle,
}

pub struct Session {
    id: String,
    browser_session_id: String,
    created_at: DateTime<Utc>,
    bridge: Arc<Bridge>,
    inner: Mutex<SessionInner>,
    outbound: tokio::sync::Mutex<Outbound>,
    generation: watch::Sender<u64>,
    worker: Mutex<Worker>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("browser_session_id", &self.browser_session_id)
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn browser_session_id(&self) -> &str {
        &self.browser_session_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn bridge(&self) -> &Arc<Bridge> {
        &self.bridge
    }

    pub fn outbound(&self) -> &tokio::sync::Mutex<Outbound> {
        &self.outbound
    }

    pub fn state(&self) -> SessionState {
        lock(&self.inner).state
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    /// Connection generation currently allowed to write to the client.
    pub fn current_generation(&self) -> u64 {
        *self.generation.borrow()
    }

    /// Notifies when a newer connection takes over or the session closes.
    pub fn subscribe_generation(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    /// Makes the caller the only live connection and returns its ticket.
    fn claim(&self) -> Option<u64> {
        let mut inner = lock(&self.inner);
        if inner.state == SessionState::Closed {
            return None;
        }
        if let Some(timer) = inner.reconnect_timer.take() {
            timer.abort();
        }
        let superseded = inner.state == SessionState::Connected;
        inner.generation += 1;
        inner.state = SessionState::Connected;
        let ticket = inner.generation;
        self.bridge.resume();
        self.generation.send_replace(ticket);
        drop(inner);
        if superseded {
            tracing::info!(session_id = %self.id, generation = ticket, "connection superseded");
        }
        Some(ticket)
    }

    fn mark_closed(&self) -> bool {
        let inner = lock(&self.inner);
        if inner.state == SessionState::Closed {
            return false;
        }
        self.close_locked(inner);
        true
    }

    /// Closes the session only if `ticket` is still the latest connection and
    /// nobody has reconnected since it dropped.
    fn mark_closed_if_abandoned(&self, ticket: u64) -> bool {
        let inner = lock(&self.inner);
        if inner.generation != ticket || inner.state != SessionState::Reconnecting {
            return false;
        }
        self.close_locked(inner);
        true
    }

    fn close_locked(&self, mut inner: MutexGuard<'_, SessionInner>) {
        if let Some(timer) = inner.reconnect_timer.take() {
            timer.abort();
        }
        inner.state = SessionState::Closed;
        inner.generation += 1;
        self.generation.send_replace(inner.generation);
    }

    fn start_worker(&self) -> Result<(), BridgeError> {
        let mut worker = lock(&self.worker);
        let mut agent = match std::mem::replace(&mut *worker, Worker::Idle) {
            Worker::Pending(agent) => agent,
            other => {
                *worker = other;
                return Ok(());
            }
        };
        let bridge = self.bridge.clone();
        let session_id = self.id.clone();
        let short_id: String = self.id.chars().take(8).collect();
        let handle = thread::Builder::new()
            .name(format!("agent-{short_id}"))
            .spawn(move || {
                tracing::info!(session_id = %session_id, "agent worker started");
                let failure = match panic::catch_unwind(AssertUnwindSafe(|| agent.run())) {
                    Ok(Ok(())) => None,
                    Ok(Err(err)) => Some(err.to_string()),
                    Err(_) => Some("agent panicked".to_string()),
                };
                bridge.finish_run(failure);
            })
            .map_err(|err| BridgeError::AgentFailed {
                message: format!("failed to spawn agent worker: {err}"),
            })?;
        *worker = Worker::Running(handle);
        Ok(())
    }

    pub fn worker_finished(&self) -> bool {
        match &*lock(&self.worker) {
            Worker::Running(handle) => handle.is_finished(),
            Worker::Pending(_) | Worker::Idle => true,
        }
    }
}

/// A live connection's claim on a session.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub session: Arc<Session>,
    pub ticket: u64,
    pub resumed: bool,
}

#[derive(Debug, Default)]
struct Registry {
    by_browser: HashMap<String, Arc<Session>>,
    by_id: HashMap<String, Arc<Session>>,
}

pub struct SessionManager {
    runtime: Arc<dyn AgentRuntime>,
    config: SessionConfig,
    registry: Mutex<Registry>,
    /// Suppressed duplicates of sessions that have already closed.
    retired_duplicates: AtomicU64,
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("config", &self.config)
            .field("active_sessions", &self.active_sessions())
            .finish()
    }
}

impl SessionManager {
    pub fn new(runtime: Arc<dyn AgentRuntime>, config: SessionConfig) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            config,
            registry: Mutex::new(Registry::default()),
            retired_duplicates: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn active_sessions(&self) -> usize {
        lock(&self.registry).by_id.len()
    }

    /// Duplicates suppressed since startup, closed sessions included.
    pub fn suppressed_duplicates(&self) -> u64 {
        let registry = lock(&self.registry);
        let live: u64 = registry
            .by_id
            .values()
            .map(|session| session.bridge.suppressed_duplicates())
            .sum();
        live + self.retired_duplicates.load(Ordering::Relaxed)
    }

    pub fn find_by_browser(&self, browser_session_id: &str) -> Option<Arc<Session>> {
        lock(&self.registry)
            .by_browser
            .get(browser_session_id)
            .cloned()
    }

    /// Joins an existing session for the token or creates a new one.
    ///
    /// Without a token the session id doubles as the browser token, so a
    /// client can resume by echoing the id from the connection envelope.
    pub fn attach(
        self: &Arc<Self>,
        browser_session_id: Option<&str>,
    ) -> Result<Attachment, BridgeError> {
        if let Some(token) = browser_session_id {
            if let Some(attachment) = self.resume(token) {
                return Ok(attachment);
            }
        }

        let session = self.build_session(browser_session_id)?;
        let (session, created) = {
            let mut registry = lock(&self.registry);
            match registry.by_browser.get(&session.browser_session_id) {
                // Another connection created this token's session first.
                Some(existing) if !existing.is_closed() => (existing.clone(), false),
                _ => {
                    registry
                        .by_browser
                        .insert(session.browser_session_id.clone(), session.clone());
                    registry.by_id.insert(session.id.clone(), session.clone());
                    (session, true)
                }
            }
        };

        session.start_worker()?;
        let ticket = session.claim().ok_or_else(|| BridgeError::SessionClosed {
            session_id: session.id.clone(),
        })?;
        let resumed = !created;
        if created {
            tracing::info!(
                session_id = %session.id,
                browser_session_id = %session.browser_session_id,
                "session created"
            );
        }
        Ok(Attachment {
            session,
            ticket,
            resumed,
        })
    }

    fn resume(&self, token: &str) -> Option<Attachment> {
        let session = self.find_by_browser(token)?;
        let previous = session.state();
        let ticket = session.claim()?;
        tracing::info!(
            session_id = %session.id,
            previous_state = ?previous,
            enqueued = session.bridge.enqueued(),
            "session resumed"
        );
        Some(Attachment {
            session,
            ticket,
            resumed: true,
        })
    }

    fn build_session(&self, browser_session_id: Option<&str>) -> Result<Arc<Session>, BridgeError> {
        let id = new_session_id();
        let browser_session_id = browser_session_id
            .map(str::to_string)
            .unwrap_or_else(|| id.clone());
        let (bridge, rx) = Bridge::new(id.clone(), &self.config.bridge);
        let hooks: Arc<dyn AgentHooks> = bridge.clone();
        let agent = self
            .runtime
            .create_agent(self.config.agent.clone(), hooks)
            .map_err(|err| {
                tracing::error!(session_id = %id, error = %err, "failed to construct agent");
                BridgeError::AgentFailed {
                    message: err.to_string(),
                }
            })?;
        let (generation, _) = watch::channel(0);
        Ok(Arc::new(Session {
            id,
            browser_session_id,
            created_at: Utc::now(),
            bridge,
            inner: Mutex::new(SessionInner {
                state: SessionState::Connecting,
                generation: 0,
                reconnect_timer: None,
            }),
            outbound: tokio::sync::Mutex::new(Outbound::new(rx)),
            generation,
            worker: Mutex::new(Worker::Pending(agent)),
        }))
    }

    /// Called when the connection holding `ticket` goes away. Stale tickets are ignored.
    pub fn disconnect(self: &Arc<Self>, session: &Arc<Session>, ticket: u64) {
        let mut inner = lock(&session.inner);
        if inner.generation != ticket || inner.state != SessionState::Connected {
            return;
        }
        inner.state = SessionState::Reconnecting;
        session.bridge.pause();

        let manager = Arc::downgrade(self);
        let expiring = session.clone();
        let timeout = self.config.reconnect_timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(manager) = manager.upgrade() {
                manager.expire(&expiring, ticket).await;
            }
        });
        if let Some(previous) = inner.reconnect_timer.replace(timer.abort_handle()) {
            previous.abort();
        }
        drop(inner);
        tracing::info!(
            session_id = %session.id,
            reconnect_timeout_secs = timeout.as_secs(),
            "client disconnected; waiting for reconnect"
        );
    }

    async fn expire(&self, session: &Arc<Session>, ticket: u64) {
        if !session.mark_closed_if_abandoned(ticket) {
            return;
        }
        tracing::info!(session_id = %session.id, "reconnect window elapsed");
        self.release(session).await;
    }

    /// Tears the session down. The worker is woken, never killed.
    pub async fn close(&self, session: &Arc<Session>) {
        if session.mark_closed() {
            self.release(session).await;
        }
    }

    async fn release(&self, session: &Arc<Session>) {
        {
            let mut registry = lock(&self.registry);
            if registry
                .by_browser
                .get(&session.browser_session_id)
                .is_some_and(|entry| Arc::ptr_eq(entry, session))
            {
                registry.by_browser.remove(&session.browser_session_id);
            }
            if registry.by_id.remove(&session.id).is_some() {
                self.retired_duplicates
                    .fetch_add(session.bridge.suppressed_duplicates(), Ordering::Relaxed);
            }
        }
        session.bridge.shutdown();
        // Writers never hold this lock across socket I/O and release it once
        // the generation bump from closing reaches them.
        session.outbound.lock().await.close();
        tracing::info!(
            session_id = %session.id,
            suppressed_duplicates = session.bridge.suppressed_duplicates(),
            "session closed"
        );
    }

    /// Closes the session and attaches a fresh one under the same browser token.
    pub async fn reset(self: &Arc<Self>, session: &Arc<Session>) -> Result<Attachment, BridgeError> {
        self.close(session).await;
        self.attach(Some(&session.browser_session_id))
    }

    /// Closes every session and waits up to `grace` for the worker threads.
    pub async fn shutdown_all(&self, grace: Duration) {
        let sessions: Vec<Arc<Session>> = lock(&self.registry).by_id.values().cloned().collect();
        tracing::info!(sessions = sessions.len(), "closing all sessions");
        for session in &sessions {
            self.close(session).await;
        }
        let deadline = Instant::now() + grace;
        while !sessions.iter().all(|session| session.worker_finished()) {
            if Instant::now() >= deadline {
                let running = sessions
                    .iter()
                    .filter(|session| !session.worker_finished())
                    .count();
                tracing::warn!(running, "agent workers still running after shutdown grace");
                return;
            }
            tokio::time::sleep(WORKER_POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;

    use chat_bridge_agent_runtime::{MockRuntime, RuntimeError, Sender, UserInput};

    use super::*;

    fn config(reconnect_timeout: Duration) -> SessionConfig {
        SessionConfig {
            reconnect_timeout,
            bridge: BridgeConfig {
                outbound_queue_depth: 64,
                input_timeout: Duration::from_secs(30),
            },
            agent: AgentConfig {
                stream_delay: Duration::ZERO,
                ..AgentConfig::default()
            },
        }
    }

    fn manager(reconnect_timeout: Duration) -> Arc<SessionManager> {
        SessionManager::new(Arc::new(MockRuntime::new()), config(reconnect_timeout))
    }

    /// Wraps the mock runtime and counts how many agents actually start running.
    struct CountingRuntime {
        inner: MockRuntime,
        runs: Arc<AtomicUsize>,
    }

    struct CountingAgent {
        inner: Box<dyn Agent>,
        runs: Arc<AtomicUsize>,
    }

    impl AgentRuntime for CountingRuntime {
        fn create_agent(
            &self,
            config: AgentConfig,
            hooks: Arc<dyn AgentHooks>,
        ) -> Result<Box<dyn Agent>, RuntimeError> {
            let inner = self.inner.create_agent(config, hooks)?;
            Ok(Box::new(CountingAgent {
                inner,
                runs: self.runs.clone(),
            }))
        }
    }

    impl Agent for CountingAgent {
        fn run(&mut self) -> Result<(), RuntimeError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.inner.run()
        }
    }

    async fn next_envelope(session: &Session) -> ServerEnvelope {
        let mut outbound = session.outbound().lock().await;
        let envelope = tokio::time::timeout(Duration::from_secs(5), outbound.peek())
            .await
            .expect("timed out waiting for envelope")
            .expect("outbound closed");
        outbound.commit();
        envelope
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn attach_creates_and_resumes_by_token() {
        let manager = manager(Duration::from_secs(30));
        let first = manager.attach(Some("tab-1")).unwrap();
        assert!(!first.resumed);
        assert_eq!(first.session.state(), SessionState::Connected);
        assert_eq!(manager.active_sessions(), 1);

        manager.disconnect(&first.session, first.ticket);
        assert_eq!(first.session.state(), SessionState::Reconnecting);

        let second = manager.attach(Some("tab-1")).unwrap();
        assert!(second.resumed);
        assert_eq!(second.session.id(), first.session.id());
        assert!(second.ticket > first.ticket);
        assert_eq!(manager.active_sessions(), 1);

        let other = manager.attach(Some("tab-2")).unwrap();
        assert_ne!(other.session.id(), first.session.id());
        assert_eq!(manager.active_sessions(), 2);

        manager.shutdown_all(Duration::from_secs(2)).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tokenless_session_is_resumable_by_its_id() {
        let manager = manager(Duration::from_secs(30));
        let first = manager.attach(None).unwrap();
        assert_eq!(first.session.browser_session_id(), first.session.id());
        let again = manager.attach(Some(first.session.id())).unwrap();
        assert!(again.resumed);
        assert!(Arc::ptr_eq(&first.session, &again.session));
        manager.shutdown_all(Duration::from_secs(2)).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stale_ticket_disconnect_is_ignored() {
        let manager = manager(Duration::from_secs(30));
        let old = manager.attach(Some("tab")).unwrap();
        let new = manager.attach(Some("tab")).unwrap();
        assert!(new.resumed);

        manager.disconnect(&old.session, old.ticket);
        assert_eq!(new.session.state(), SessionState::Connected);
        assert_eq!(new.session.current_generation(), new.ticket);
        manager.shutdown_all(Duration::from_secs(2)).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reconnect_timeout_closes_session() {
        let manager = manager(Duration::from_millis(50));
        let attachment = manager.attach(Some("gone")).unwrap();
        manager.disconnect(&attachment.session, attachment.ticket);

        let deadline = Instant::now() + Duration::from_secs(5);
        while !attachment.session.is_closed() {
            assert!(Instant::now() < deadline, "session never expired");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(manager.active_sessions(), 0);
        assert!(manager.find_by_browser("gone").is_none());

        let deadline = Instant::now() + Duration::from_secs(5);
        while !attachment.session.worker_finished() {
            assert!(Instant::now() < deadline, "worker never exited");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let fresh = manager.attach(Some("gone")).unwrap();
        assert!(!fresh.resumed);
        assert_ne!(fresh.session.id(), attachment.session.id());
        manager.shutdown_all(Duration::from_secs(2)).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stale_expiry_never_closes_a_reclaimed_session() {
        let manager = manager(Duration::from_secs(30));
        let first = manager.attach(Some("racy")).unwrap();
        let session = first.session.clone();
        manager.disconnect(&session, first.ticket);

        let second = manager.attach(Some("racy")).unwrap();
        assert!(second.resumed);
        assert!(!session.mark_closed_if_abandoned(first.ticket));
        manager.expire(&session, first.ticket).await;
        assert_eq!(session.state(), SessionState::Connected);

        manager.disconnect(&session, second.ticket);
        manager.expire(&session, first.ticket).await;
        assert_eq!(session.state(), SessionState::Reconnecting);

        manager.expire(&session, second.ticket).await;
        assert!(session.is_closed());
        assert_eq!(manager.active_sessions(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_attaches_share_one_session_and_worker() {
        const CONNECTIONS: usize = 32;
        let runs = Arc::new(AtomicUsize::new(0));
        let runtime = CountingRuntime {
            inner: MockRuntime::new(),
            runs: runs.clone(),
        };
        let manager = SessionManager::new(Arc::new(runtime), config(Duration::from_secs(30)));
        let barrier = Barrier::new(CONNECTIONS);

        let attachments: Vec<Attachment> = thread::scope(|scope| {
            let handles: Vec<_> = (0..CONNECTIONS)
                .map(|_| {
                    let manager = &manager;
                    let barrier = &barrier;
                    scope.spawn(move || {
                        barrier.wait();
                        manager.attach(Some("same")).unwrap()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .collect()
        });

        let session = attachments[0].session.clone();
        assert!(attachments
            .iter()
            .all(|attachment| Arc::ptr_eq(&attachment.session, &session)));
        assert_eq!(
            attachments
                .iter()
                .filter(|attachment| !attachment.resumed)
                .count(),
            1
        );
        assert_eq!(manager.active_sessions(), 1);

        let latest = attachments
            .iter()
            .map(|attachment| attachment.ticket)
            .max()
            .unwrap();
        assert_eq!(session.current_generation(), latest);

        let deadline = Instant::now() + Duration::from_secs(5);
        while runs.load(Ordering::SeqCst) == 0 {
            assert!(Instant::now() < deadline, "agent never started");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        manager.shutdown_all(Duration::from_secs(2)).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn suppressed_duplicates_survive_session_close() {
        let manager = manager(Duration::from_secs(30));
        let attachment = manager.attach(Some("dupes")).unwrap();
        let bridge = attachment.session.bridge().clone();
        thread::spawn(move || {
            bridge.show_response(Sender::Assistant, "same answer");
            bridge.show_response(Sender::Assistant, "same answer");
        })
        .join()
        .unwrap();
        assert_eq!(manager.suppressed_duplicates(), 1);

        manager.close(&attachment.session).await;
        assert_eq!(manager.active_sessions(), 0);
        assert_eq!(manager.suppressed_duplicates(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reconnect_before_timeout_keeps_session() {
        let manager = manager(Duration::from_millis(100));
        let attachment = manager.attach(Some("flaky")).unwrap();
        manager.disconnect(&attachment.session, attachment.ticket);
        let resumed = manager.attach(Some("flaky")).unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(resumed.session.state(), SessionState::Connected);
        assert_eq!(manager.active_sessions(), 1);
        manager.shutdown_all(Duration::from_secs(2)).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn worker_runs_agent_and_buffers_while_disconnected() {
        let manager = manager(Duration::from_secs(30));
        let attachment = manager.attach(Some("chat")).unwrap();
        let session = attachment.session.clone();

        match next_envelope(&session).await {
            ServerEnvelope::Message { message } => assert_eq!(message.sender, Sender::System),
            other => panic!("expected welcome message, got {other:?}"),
        }

        manager.disconnect(&session, attachment.ticket);
        session
            .bridge()
            .deliver_input(UserInput::Text("hello".into()))
            .unwrap();
        let resumed = manager.attach(Some("chat")).unwrap();
        assert!(resumed.resumed);

        let mut kinds = Vec::new();
        loop {
            let envelope = next_envelope(&session).await;
            kinds.push(envelope.kind());
            if envelope.kind() == "stream_end" {
                break;
            }
        }
        assert_eq!(kinds.first(), Some(&"stream_start"));
        assert!(kinds.contains(&"stream_token"));
        manager.shutdown_all(Duration::from_secs(2)).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn close_is_idempotent_and_stops_worker() {
        let manager = manager(Duration::from_secs(30));
        let attachment = manager.attach(Some("done")).unwrap();
        let session = attachment.session.clone();
        manager.close(&session).await;
        manager.close(&session).await;
        assert!(session.is_closed());
        assert_eq!(manager.active_sessions(), 0);

        let deadline = Instant::now() + Duration::from_secs(5);
        while !session.worker_finished() {
            assert!(Instant::now() < deadline, "worker never exited");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(matches!(
            session.bridge().deliver_input(UserInput::Text("late".into())),
            Err(BridgeError::SessionClosed { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reset_replaces_session_under_same_token() {
        let manager = manager(Duration::from_secs(30));
        let attachment = manager.attach(Some("reset-me")).unwrap();
        let fresh = manager.reset(&attachment.session).await.unwrap();
        assert!(!fresh.resumed);
        assert!(attachment.session.is_closed());
        assert_ne!(fresh.session.id(), attachment.session.id());
        assert_eq!(fresh.session.browser_session_id(), "reset-me");
        assert_eq!(manager.active_sessions(), 1);
        manager.shutdown_all(Duration::from_secs(2)).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn construct_failure_is_reported() {
        let manager = SessionManager::new(
            Arc::new(MockRuntime::new()),
            SessionConfig {
                agent: AgentConfig {
                    name: "  ".into(),
                    ..AgentConfig::default()
                },
                ..SessionConfig::default()
            },
        );
        let err = manager.attach(Some("broken")).unwrap_err();
        assert!(matches!(err, BridgeError::AgentFailed { .. }));
        assert_eq!(manager.active_sessions(), 0);
    }
}
