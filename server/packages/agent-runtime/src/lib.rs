//! Contract between the chat bridge and a blocking agent runtime.
//!
//! The runtime owns the conversation loop. The bridge hands it an
//! [`AgentHooks`] implementation at construction time and then drives
//! [`Agent::run`] on a dedicated thread; everything the agent wants to show
//! or ask goes back through those hooks.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub mod mock;

pub use mock::MockRuntime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    User,
    Assistant,
    System,
}

impl Sender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sender::User => "user",
            Sender::Assistant => "assistant",
            Sender::System => "system",
        }
    }
}

impl fmt::Display for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a turn's final text was produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Generated live; the text was (or should have been) streamed token by token.
    Streamed { text: String },
    /// Served from the runtime's response cache with no token cadence.
    Cached { text: String },
}

impl TurnOutcome {
    pub fn text(&self) -> &str {
        match self {
            TurnOutcome::Streamed { text } | TurnOutcome::Cached { text } => text,
        }
    }

    pub fn is_cached(&self) -> bool {
        matches!(self, TurnOutcome::Cached { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserInput {
    Text(String),
    ClearHistory,
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum InputError {
    #[error("input channel closed")]
    Closed,
    #[error("timed out waiting for user input")]
    TimedOut,
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to construct agent: {0}")]
    Construct(String),
    #[error("agent turn failed: {0}")]
    Turn(String),
}

/// Receives the tokens of one streamed turn.
///
/// `finish` consumes the sink, so a stream can be terminated at most once.
/// Dropping a sink without finishing it terminates the stream as cancelled.
pub trait TokenSink: Send {
    fn push(&mut self, fragment: &str);

    fn finish(self: Box<Self>, outcome: TurnOutcome);
}

/// Hooks invoked by the agent from its execution thread.
pub trait AgentHooks: Send + Sync {
    fn start_stream(&self, message_id: String, sender: Sender) -> Box<dyn TokenSink>;

    fn show_response(&self, sender: Sender, content: &str);

    fn show_tool_call(&self, message_id: &str, tool: &str, args: &Value);

    fn show_tool_result(&self, message_id: &str, tool: &str, result: &str);

    /// Blocks until the user submits input, the session closes or the wait times out.
    fn request_input(&self, prompt: Option<&str>) -> Result<UserInput, InputError>;
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub name: String,
    pub system_message: String,
    pub stream_delay: Duration,
    pub use_cache: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "Assistant".to_string(),
            system_message: "You are a helpful AI assistant communicating through a web \
                             interface. Be concise, friendly, and helpful."
                .to_string(),
            stream_delay: Duration::from_millis(30),
            use_cache: true,
        }
    }
}

pub trait Agent: Send {
    /// Runs the conversation loop until input closes. Blocking.
    fn run(&mut self) -> Result<(), RuntimeError>;
}

pub trait AgentRuntime: Send + Sync {
    fn create_agent(
        &self,
        config: AgentConfig,
        hooks: Arc<dyn AgentHooks>,
    ) -> Result<Box<dyn Agent>, RuntimeError>;
}

/// Opaque message id in the format the bridge and the runtimes share.
pub fn new_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
