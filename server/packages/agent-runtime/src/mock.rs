//! Canned-response runtime used when no real model is wired in.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;

use crate::{
    new_message_id, Agent, AgentConfig, AgentHooks, AgentRuntime, InputError, RuntimeError,
    Sender, TurnOutcome, UserInput,
};

const WELCOME_MESSAGE: &str =
    "Welcome! I'm ready to chat. Type a message to begin our conversation.";
const CLEARED_MESSAGE: &str = "Chat history cleared.";
const DEFAULT_FAIL_TRIGGER: &str = "/fail";
const CALCULATOR_TOOL: &str = "calculator";

#[derive(Debug, Clone)]
pub struct MockRuntime {
    responses: Vec<(String, String)>,
    default_response: String,
    fail_trigger: String,
    echo_final_response: bool,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self {
            responses: default_responses(),
            default_response: "I'm here to help! Feel free to ask me anything.".to_string(),
            fail_trigger: DEFAULT_FAIL_TRIGGER.to_string(),
            echo_final_response: true,
        }
    }
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the response table. Keys may list alternatives separated by `|`.
    pub fn with_responses<I, K, V>(mut self, responses: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.responses = responses
            .into_iter()
            .map(|(key, value)| (key.into().to_ascii_lowercase(), value.into()))
            .collect();
        self
    }

    /// Whether the final text of a streamed turn is also reported through
    /// `show_response`, the way multi-hook frameworks do.
    pub fn with_echo_final_response(mut self, echo: bool) -> Self {
        self.echo_final_response = echo;
        self
    }

    fn lookup(&self, text: &str) -> &str {
        let lowered = text.to_ascii_lowercase();
        let words: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|word| !word.is_empty())
            .collect();
        self.responses
            .iter()
            .find(|(key, _)| {
                key.split('|').map(str::trim).any(|alternative| {
                    if alternative.contains(' ') {
                        lowered.contains(alternative)
                    } else {
                        words.iter().any(|word| *word == alternative)
                    }
                })
            })
            .map(|(_, response)| response.as_str())
            .unwrap_or(&self.default_response)
    }
}

impl AgentRuntime for MockRuntime {
    fn create_agent(
        &self,
        config: AgentConfig,
        hooks: Arc<dyn AgentHooks>,
    ) -> Result<Box<dyn Agent>, RuntimeError> {
        if config.name.trim().is_empty() {
            return Err(RuntimeError::Construct("agent name is required".to_string()));
        }
        tracing::debug!(agent = %config.name, "creating mock agent");
        let history = vec![(Sender::System, config.system_message.clone())];
        Ok(Box::new(MockAgent {
            runtime: self.clone(),
            config,
            hooks,
            history,
            cache: HashMap::new(),
        }))
    }
}

struct MockAgent {
    runtime: MockRuntime,
    config: AgentConfig,
    hooks: Arc<dyn AgentHooks>,
    history: Vec<(Sender, String)>,
    cache: HashMap<String, String>,
}

impl Agent for MockAgent {
    fn run(&mut self) -> Result<(), RuntimeError> {
        self.hooks.show_response(Sender::System, WELCOME_MESSAGE);
        loop {
            match self.hooks.request_input(None) {
                Ok(UserInput::Text(text)) => self.respond(&text)?,
                Ok(UserInput::ClearHistory) => {
                    self.history.truncate(1);
                    self.cache.clear();
                    self.hooks.show_response(Sender::System, CLEARED_MESSAGE);
                }
                Err(InputError::TimedOut) => continue,
                Err(InputError::Closed) => {
                    tracing::debug!(
                        agent = %self.config.name,
                        turns = self.history.len() / 2,
                        "mock agent input closed"
                    );
                    return Ok(());
                }
            }
        }
    }
}

impl MockAgent {
    fn respond(&mut self, text: &str) -> Result<(), RuntimeError> {
        let prompt = text.trim();
        if prompt.is_empty() {
            return Ok(());
        }
        if prompt.contains(&self.runtime.fail_trigger) {
            return Err(RuntimeError::Turn("mock failure requested".to_string()));
        }
        self.history.push((Sender::User, prompt.to_string()));

        let cache_key = prompt.to_ascii_lowercase();
        if self.config.use_cache {
            if let Some(cached) = self.cache.get(&cache_key).cloned() {
                let sink = self.hooks.start_stream(new_message_id(), Sender::Assistant);
                sink.finish(TurnOutcome::Cached {
                    text: cached.clone(),
                });
                self.history.push((Sender::Assistant, cached));
                return Ok(());
            }
        }

        let message_id = new_message_id();
        let answer = match parse_arithmetic(prompt) {
            Some(expression) => {
                self.hooks.show_tool_call(
                    &message_id,
                    CALCULATOR_TOOL,
                    &json!({ "expression": expression.to_string() }),
                );
                let result = expression.evaluate();
                self.hooks
                    .show_tool_result(&message_id, CALCULATOR_TOOL, &result);
                result
            }
            None => self.runtime.lookup(prompt).to_string(),
        };

        let mut sink = self.hooks.start_stream(message_id, Sender::Assistant);
        let chunks = split_text_into_word_chunks(&answer);
        let last = chunks.len().saturating_sub(1);
        for (index, chunk) in chunks.iter().enumerate() {
            sink.push(chunk);
            if index < last && !self.config.stream_delay.is_zero() {
                std::thread::sleep(self.config.stream_delay);
            }
        }
        sink.finish(TurnOutcome::Streamed {
            text: answer.clone(),
        });
        if self.runtime.echo_final_response {
            self.hooks.show_response(Sender::Assistant, &answer);
        }

        if self.config.use_cache {
            self.cache.insert(cache_key, answer.clone());
        }
        self.history.push((Sender::Assistant, answer));
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Arithmetic {
    lhs: i64,
    op: char,
    rhs: i64,
}

impl Arithmetic {
    fn evaluate(&self) -> String {
        let value = match self.op {
            '+' => self.lhs.checked_add(self.rhs),
            '-' => self.lhs.checked_sub(self.rhs),
            '*' => self.lhs.checked_mul(self.rhs),
            '/' if self.rhs == 0 => return "cannot divide by zero".to_string(),
            '/' => self.lhs.checked_div(self.rhs),
            _ => None,
        };
        value
            .map(|value| value.to_string())
            .unwrap_or_else(|| "overflow".to_string())
    }
}

impl std::fmt::Display for Arithmetic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}{}", self.lhs, self.op, self.rhs)
    }
}

fn parse_arithmetic(text: &str) -> Option<Arithmetic> {
    let lowered = text.trim().trim_end_matches(['?', '=']).to_ascii_lowercase();
    let expression = lowered.strip_prefix("what is").unwrap_or(&lowered).trim();
    // Skip the first char so a leading minus stays part of the lhs.
    let (index, op) = expression
        .char_indices()
        .skip(1)
        .find(|(_, c)| matches!(c, '+' | '-' | '*' | '/'))?;
    let lhs = expression[..index].trim().parse().ok()?;
    let rhs = expression[index + op.len_utf8()..].trim().parse().ok()?;
    Some(Arithmetic { lhs, op, rhs })
}

fn split_text_into_word_chunks(text: &str) -> Vec<String> {
    let words: Vec<&str> = text.split(' ').collect();
    if words.len() <= 1 {
        return vec![text.to_string()];
    }

    let last = words.len() - 1;
    words
        .into_iter()
        .enumerate()
        .map(|(index, word)| {
            if index == last {
                word.to_string()
            } else {
                format!("{word} ")
            }
        })
        .collect()
}

fn default_responses() -> Vec<(String, String)> {
    [
        (
            "hello",
            "Hello! I'm an agent ready to help you. How can I assist you today?",
        ),
        (
            "hi",
            "Hi there! I'm your AI assistant. What would you like to talk about?",
        ),
        (
            "help",
            "I can help you with:\n• General conversation\n• Answering questions\n• Problem solving\n• Code assistance\n\nWhat would you like to explore?",
        ),
        (
            "test",
            "Great! The chat interface is working. I'm receiving your messages and responding through the WebSocket connection.",
        ),
        (
            "bye|goodbye",
            "Goodbye! It was great chatting with you. Feel free to return anytime!",
        ),
    ]
    .into_iter()
    .map(|(key, value)| (key.to_string(), value.to_string()))
    .collect()
}
