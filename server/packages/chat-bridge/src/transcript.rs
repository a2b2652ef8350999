//! Client-side view of a conversation, rebuilt from server envelopes.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;

use chat_bridge_agent_runtime::Sender;

use crate::protocol::ServerEnvelope;

#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptEntry {
    pub id: String,
    pub sender: Sender,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub streaming: bool,
}

/// What changed after applying an envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptEvent {
    Connected { session_id: String, resumed: bool },
    Appended { id: String },
    StreamStarted { id: String },
    Token { id: String, token: String },
    StreamEnded { id: String },
    Removed { entry: TranscriptEntry },
    ToolCall { tool_name: String, tool_args: Value },
    ToolResult { tool_name: String, result: String },
    InputRequested { prompt: Option<String> },
    Error { error: String, details: Option<String> },
    Pong,
}

#[derive(Debug, Default)]
pub struct Transcript {
    session_id: Option<String>,
    entries: Vec<TranscriptEntry>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn get(&self, id: &str) -> Option<&TranscriptEntry> {
        self.entries.iter().find(|entry| entry.id == id)
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|entry| entry.id == id)
    }

    /// Records a message typed locally, before the server sees it.
    pub fn push_local(&mut self, sender: Sender, content: &str) -> String {
        let id = chat_bridge_agent_runtime::new_message_id();
        self.entries.push(TranscriptEntry {
            id: id.clone(),
            sender,
            content: content.to_string(),
            timestamp: Utc::now(),
            streaming: false,
        });
        id
    }

    /// Applies one envelope. Returns `None` when it changed nothing: repeated
    /// message ids, tokens for unknown or finished streams, unknown deletes.
    pub fn apply(&mut self, envelope: &ServerEnvelope) -> Option<TranscriptEvent> {
        match envelope {
            ServerEnvelope::Connection {
                session_id,
                resumed,
                ..
            } => {
                if !resumed && self.session_id.as_deref() != Some(session_id.as_str()) {
                    self.entries.clear();
                }
                self.session_id = Some(session_id.clone());
                Some(TranscriptEvent::Connected {
                    session_id: session_id.clone(),
                    resumed: *resumed,
                })
            }
            ServerEnvelope::Message { message } => {
                if self.position(&message.id).is_some() {
                    return None;
                }
                self.entries.push(TranscriptEntry {
                    id: message.id.clone(),
                    sender: message.sender,
                    content: message.content.clone(),
                    timestamp: message.timestamp,
                    streaming: false,
                });
                Some(TranscriptEvent::Appended {
                    id: message.id.clone(),
                })
            }
            ServerEnvelope::StreamStart {
                message_id,
                sender,
                timestamp,
            } => {
                if self.position(message_id).is_some() {
                    return None;
                }
                self.entries.push(TranscriptEntry {
                    id: message_id.clone(),
                    sender: *sender,
                    content: String::new(),
                    timestamp: *timestamp,
                    streaming: true,
                });
                Some(TranscriptEvent::StreamStarted {
                    id: message_id.clone(),
                })
            }
            ServerEnvelope::StreamToken { message_id, token } => {
                let index = self.position(message_id)?;
                let entry = &mut self.entries[index];
                if !entry.streaming {
                    return None;
                }
                entry.content.push_str(token);
                Some(TranscriptEvent::Token {
                    id: message_id.clone(),
                    token: token.clone(),
                })
            }
            ServerEnvelope::StreamEnd { message_id } => {
                let index = self.position(message_id)?;
                let entry = &mut self.entries[index];
                if !entry.streaming {
                    return None;
                }
                entry.streaming = false;
                Some(TranscriptEvent::StreamEnded {
                    id: message_id.clone(),
                })
            }
            ServerEnvelope::DeleteMessage { message_id } => {
                let index = self.position(message_id)?;
                let entry = self.entries.remove(index);
                Some(TranscriptEvent::Removed { entry })
            }
            ServerEnvelope::InputRequest { prompt, .. } => Some(TranscriptEvent::InputRequested {
                prompt: prompt.clone(),
            }),
            ServerEnvelope::ToolCall {
                tool_name,
                tool_args,
                ..
            } => Some(TranscriptEvent::ToolCall {
                tool_name: tool_name.clone(),
                tool_args: tool_args.clone(),
            }),
            ServerEnvelope::ToolResult {
                tool_name, result, ..
            } => Some(TranscriptEvent::ToolResult {
                tool_name: tool_name.clone(),
                result: result.clone(),
            }),
            ServerEnvelope::Error { error, details } => Some(TranscriptEvent::Error {
                error: error.clone(),
                details: details.clone(),
            }),
            ServerEnvelope::Pong => Some(TranscriptEvent::Pong),
        }
    }

    /// Contents of finished entries from `sender`, oldest first.
    pub fn contents(&self, sender: Sender) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|entry| entry.sender == sender && !entry.streaming)
            .map(|entry| entry.content.as_str())
            .collect()
    }
}
