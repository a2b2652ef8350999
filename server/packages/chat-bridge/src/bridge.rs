//! Agent-thread side of a session.
//!
//! The agent runtime calls into [`Bridge`] from its own blocking thread. The
//! bridge never touches the network: every hook turns into one or more
//! [`ServerEnvelope`]s pushed onto a bounded queue that the transport drains.
//! User input travels the other way through a single-slot handoff.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use chat_bridge_agent_runtime::{
    AgentHooks, InputError, Sender, TokenSink, TurnOutcome, UserInput,
};
use chat_bridge_error::BridgeError;

use crate::protocol::{ChatMessage, ServerEnvelope};

const FINGERPRINT_LEN: usize = 16;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub outbound_queue_depth: usize,
    pub input_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            outbound_queue_depth: 1024,
            input_timeout: Duration::from_secs(300),
        }
    }
}

/// Content fingerprint used to suppress duplicate deliveries.
pub fn fingerprint(sender: Sender, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sender.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(content.trim().as_bytes());
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(FINGERPRINT_LEN);
    digest
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct DedupState {
    turn: u64,
    seen: HashSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotError {
    Busy,
    Closed,
}

#[derive(Debug, Default)]
struct SlotState {
    pending: Option<UserInput>,
    waiting: bool,
    paused: bool,
    closed: bool,
}

/// Single-slot handoff from the transport loop to the agent thread.
#[derive(Debug, Default)]
struct InputSlot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

impl InputSlot {
    fn deliver(&self, input: UserInput) -> Result<(), SlotError> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(SlotError::Closed);
        }
        if state.pending.is_some() {
            return Err(SlotError::Busy);
        }
        state.pending = Some(input);
        self.ready.notify_all();
        Ok(())
    }

    /// Waits for input. The timeout only runs while the slot is not paused,
    /// and restarts on resume.
    fn wait(&self, timeout: Duration) -> Result<UserInput, InputError> {
        let mut state = lock(&self.state);
        state.waiting = true;
        let mut deadline = Instant::now() + timeout;
        let result = loop {
            if state.closed {
                break Err(InputError::Closed);
            }
            if let Some(input) = state.pending.take() {
                break Ok(input);
            }
            if state.paused {
                state = self
                    .ready
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
                deadline = Instant::now() + timeout;
                continue;
            }
            let now = Instant::now();
            if now >= deadline {
                break Err(InputError::TimedOut);
            }
            state = self
                .ready
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        };
        state.waiting = false;
        result
    }

    fn is_waiting(&self) -> bool {
        lock(&self.state).waiting
    }

    fn set_paused(&self, paused: bool) {
        lock(&self.state).paused = paused;
        self.ready.notify_all();
    }

    fn close(&self) {
        let mut state = lock(&self.state);
        state.closed = true;
        state.pending = None;
        self.ready.notify_all();
    }
}

#[derive(Debug)]
pub struct Bridge {
    me: Weak<Bridge>,
    session_id: String,
    input_timeout: Duration,
    outbox: Mutex<Option<mpsc::Sender<ServerEnvelope>>>,
    input: InputSlot,
    dedup: Mutex<DedupState>,
    active_streams: Mutex<HashSet<String>>,
    enqueued: AtomicU64,
    suppressed: AtomicU64,
    failed: AtomicBool,
}

impl Bridge {
    /// Creates the bridge together with the receiving end of its outbound queue.
    pub fn new(
        session_id: impl Into<String>,
        config: &BridgeConfig,
    ) -> (Arc<Self>, mpsc::Receiver<ServerEnvelope>) {
        let (tx, rx) = mpsc::channel(config.outbound_queue_depth.max(1));
        let session_id = session_id.into();
        let bridge = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            session_id,
            input_timeout: config.input_timeout,
            outbox: Mutex::new(Some(tx)),
            input: InputSlot::default(),
            dedup: Mutex::new(DedupState::default()),
            active_streams: Mutex::new(HashSet::new()),
            enqueued: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
            failed: AtomicBool::new(false),
        });
        (bridge, rx)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn suppressed_duplicates(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }

    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn is_awaiting_input(&self) -> bool {
        self.input.is_waiting()
    }

    /// Hands user input to the agent thread. Called from the transport loop.
    pub fn deliver_input(&self, input: UserInput) -> Result<(), BridgeError> {
        self.input.deliver(input).map_err(|err| match err {
            SlotError::Busy => BridgeError::InputPending {
                session_id: self.session_id.clone(),
            },
            SlotError::Closed => BridgeError::SessionClosed {
                session_id: self.session_id.clone(),
            },
        })
    }

    pub fn pause(&self) {
        self.input.set_paused(true);
    }

    pub fn resume(&self) {
        self.input.set_paused(false);
    }

    /// Wakes a blocked agent thread and stops accepting outbound envelopes.
    pub fn shutdown(&self) {
        self.input.close();
        lock(&self.outbox).take();
    }

    /// Records how the agent's run ended. Failures become a system message;
    /// either way the outbound queue is closed once drained so the transport
    /// can tear the session down after the final envelopes are delivered.
    pub fn finish_run(&self, failure: Option<String>) {
        if let Some(reason) = failure {
            self.failed.store(true, Ordering::Relaxed);
            tracing::error!(session_id = %self.session_id, error = %reason, "agent run failed");
            let err = BridgeError::AgentFailed { message: reason };
            self.send_notice(&err.to_string());
        } else {
            tracing::info!(session_id = %self.session_id, "agent run completed");
        }
        self.input.close();
        lock(&self.outbox).take();
    }

    /// Enqueues a complete message unless its fingerprint was already sent this turn.
    pub fn send_message(&self, sender: Sender, content: &str) -> bool {
        if content.trim().is_empty() {
            tracing::debug!(session_id = %self.session_id, "skipping empty message");
            return false;
        }
        let fingerprint = fingerprint(sender, content);
        if !self.remember(&fingerprint) {
            return false;
        }
        self.enqueue(ServerEnvelope::Message {
            message: ChatMessage::new(sender, content),
        })
    }

    /// System notices bypass deduplication: each occurrence is an event of its own.
    fn send_notice(&self, content: &str) -> bool {
        self.enqueue(ServerEnvelope::Message {
            message: ChatMessage::new(Sender::System, content),
        })
    }

    /// Returns false (and counts a suppressed duplicate) if already seen this turn.
    fn remember(&self, fingerprint: &str) -> bool {
        let mut dedup = lock(&self.dedup);
        if dedup.seen.insert(fingerprint.to_string()) {
            return true;
        }
        let turn = dedup.turn;
        drop(dedup);
        let suppressed = self.suppressed.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(
            session_id = %self.session_id,
            fingerprint = %fingerprint,
            turn,
            suppressed,
            "suppressed duplicate message"
        );
        false
    }

    fn begin_turn(&self) {
        let mut dedup = lock(&self.dedup);
        dedup.turn += 1;
        dedup.seen.clear();
    }

    fn enqueue(&self, envelope: ServerEnvelope) -> bool {
        let Some(sender) = lock(&self.outbox).clone() else {
            tracing::debug!(
                session_id = %self.session_id,
                kind = envelope.kind(),
                "outbound queue closed; dropping envelope"
            );
            return false;
        };
        let kind = envelope.kind();
        // Hooks run on the agent thread, never inside the async runtime.
        match sender.blocking_send(envelope) {
            Ok(()) => {
                self.enqueued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(err) => {
                tracing::warn!(
                    session_id = %self.session_id,
                    kind,
                    error = %err,
                    "failed to enqueue envelope"
                );
                false
            }
        }
    }
}

impl AgentHooks for Bridge {
    fn start_stream(&self, message_id: String, sender: Sender) -> Box<dyn TokenSink> {
        let Some(bridge) = self.me.upgrade() else {
            return Box::new(DiscardSink);
        };
        if !lock(&self.active_streams).insert(message_id.clone()) {
            tracing::warn!(
                session_id = %self.session_id,
                message_id = %message_id,
                "stream already in flight; ignoring duplicate start"
            );
            return Box::new(DiscardSink);
        }
        tracing::debug!(session_id = %self.session_id, message_id = %message_id, "stream started");
        self.enqueue(ServerEnvelope::StreamStart {
            message_id: message_id.clone(),
            sender,
            timestamp: Utc::now(),
        });
        Box::new(BridgeStream {
            bridge,
            message_id,
            sender,
            buffer: String::new(),
            tokens: 0,
            finished: false,
        })
    }

    fn show_response(&self, sender: Sender, content: &str) {
        self.send_message(sender, content);
    }

    fn show_tool_call(&self, message_id: &str, tool: &str, args: &Value) {
        self.enqueue(ServerEnvelope::ToolCall {
            message_id: message_id.to_string(),
            tool_name: tool.to_string(),
            tool_args: args.clone(),
        });
    }

    fn show_tool_result(&self, message_id: &str, tool: &str, result: &str) {
        self.enqueue(ServerEnvelope::ToolResult {
            message_id: message_id.to_string(),
            tool_name: tool.to_string(),
            result: result.to_string(),
        });
    }

    fn request_input(&self, prompt: Option<&str>) -> Result<UserInput, InputError> {
        if let Some(prompt) = prompt {
            self.enqueue(ServerEnvelope::InputRequest {
                prompt: Some(prompt.to_string()),
                timeout: Some(self.input_timeout.as_secs()),
            });
        }
        match self.input.wait(self.input_timeout) {
            Ok(input) => {
                self.begin_turn();
                Ok(input)
            }
            Err(InputError::TimedOut) => {
                let err = BridgeError::InputTimeout {
                    seconds: self.input_timeout.as_secs(),
                };
                tracing::warn!(session_id = %self.session_id, "user input timed out");
                self.send_notice(&err.to_string());
                Err(InputError::TimedOut)
            }
            Err(InputError::Closed) => Err(InputError::Closed),
        }
    }
}

struct DiscardSink;

impl TokenSink for DiscardSink {
    fn push(&mut self, _fragment: &str) {}

    fn finish(self: Box<Self>, _outcome: TurnOutcome) {}
}

struct BridgeStream {
    bridge: Arc<Bridge>,
    message_id: String,
    sender: Sender,
    buffer: String,
    tokens: usize,
    finished: bool,
}

impl BridgeStream {
    fn emit_token(&mut self, fragment: &str) {
        self.buffer.push_str(fragment);
        self.tokens += 1;
        self.bridge.enqueue(ServerEnvelope::StreamToken {
            message_id: self.message_id.clone(),
            token: fragment.to_string(),
        });
    }

    fn complete(&mut self, outcome: Option<TurnOutcome>) {
        if self.finished {
            return;
        }
        self.finished = true;
        lock(&self.bridge.active_streams).remove(&self.message_id);
        let bridge = self.bridge.clone();
        let session_id = bridge.session_id();

        if self.tokens == 0 {
            // Nothing was rendered into this bubble; retract it and send the
            // answer as a single finished message.
            bridge.enqueue(ServerEnvelope::DeleteMessage {
                message_id: self.message_id.clone(),
            });
            let cached = outcome.as_ref().map(TurnOutcome::is_cached).unwrap_or(false);
            tracing::debug!(
                session_id = %session_id,
                message_id = %self.message_id,
                cached,
                "empty stream replaced by complete message"
            );
            if let Some(outcome) = outcome {
                bridge.send_message(self.sender, outcome.text());
            }
            return;
        }

        if let Some(outcome) = &outcome {
            let text = outcome.text();
            if text != self.buffer {
                if let Some(rest) = text.strip_prefix(self.buffer.as_str()) {
                    let rest = rest.to_string();
                    self.emit_token(&rest);
                } else {
                    tracing::warn!(
                        session_id = %session_id,
                        message_id = %self.message_id,
                        streamed_len = self.buffer.len(),
                        final_len = text.len(),
                        "final text diverges from streamed tokens"
                    );
                }
            }
        }

        let fingerprint = fingerprint(self.sender, &self.buffer);
        if bridge.remember(&fingerprint) {
            bridge.enqueue(ServerEnvelope::StreamEnd {
                message_id: self.message_id.clone(),
            });
        } else {
            // Same answer already reached the client this turn through another hook.
            bridge.enqueue(ServerEnvelope::DeleteMessage {
                message_id: self.message_id.clone(),
            });
        }
    }
}

impl TokenSink for BridgeStream {
    fn push(&mut self, fragment: &str) {
        if fragment.is_empty() || self.finished {
            return;
        }
        self.emit_token(fragment);
    }

    fn finish(mut self: Box<Self>, outcome: TurnOutcome) {
        self.complete(Some(outcome));
    }
}

impl Drop for BridgeStream {
    fn drop(&mut self) {
        if !self.finished {
            tracing::debug!(message_id = %self.message_id, "stream dropped without finish");
            self.complete(None);
        }
    }
}
