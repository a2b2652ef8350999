//! JSON envelopes exchanged with browser clients over the WebSocket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use chat_bridge_agent_runtime::{new_message_id, Sender};
use chat_bridge_error::BridgeError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub content: String,
    pub sender: Sender,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(sender: Sender, content: impl Into<String>) -> Self {
        Self {
            id: new_message_id(),
            content: content.into(),
            sender,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEnvelope {
    Connection {
        status: ConnectionStatus,
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default)]
        resumed: bool,
    },
    Message {
        message: ChatMessage,
    },
    StreamStart {
        message_id: String,
        sender: Sender,
        timestamp: DateTime<Utc>,
    },
    StreamToken {
        message_id: String,
        token: String,
    },
    StreamEnd {
        message_id: String,
    },
    DeleteMessage {
        message_id: String,
    },
    InputRequest {
        #[serde(default)]
        prompt: Option<String>,
        #[serde(default)]
        timeout: Option<u64>,
    },
    ToolCall {
        message_id: String,
        tool_name: String,
        #[serde(default)]
        tool_args: Value,
    },
    ToolResult {
        message_id: String,
        tool_name: String,
        result: String,
    },
    Error {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },
    Pong,
}

impl ServerEnvelope {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEnvelope::Connection { .. } => "connection",
            ServerEnvelope::Message { .. } => "message",
            ServerEnvelope::StreamStart { .. } => "stream_start",
            ServerEnvelope::StreamToken { .. } => "stream_token",
            ServerEnvelope::StreamEnd { .. } => "stream_end",
            ServerEnvelope::DeleteMessage { .. } => "delete_message",
            ServerEnvelope::InputRequest { .. } => "input_request",
            ServerEnvelope::ToolCall { .. } => "tool_call",
            ServerEnvelope::ToolResult { .. } => "tool_result",
            ServerEnvelope::Error { .. } => "error",
            ServerEnvelope::Pong => "pong",
        }
    }

    pub fn message_id(&self) -> Option<&str> {
        match self {
            ServerEnvelope::Message { message } => Some(&message.id),
            ServerEnvelope::StreamStart { message_id, .. }
            | ServerEnvelope::StreamToken { message_id, .. }
            | ServerEnvelope::StreamEnd { message_id }
            | ServerEnvelope::DeleteMessage { message_id }
            | ServerEnvelope::ToolCall { message_id, .. }
            | ServerEnvelope::ToolResult { message_id, .. } => Some(message_id),
            _ => None,
        }
    }

    pub fn error(err: &BridgeError) -> Self {
        ServerEnvelope::Error {
            error: err.error_type().title().to_string(),
            details: Some(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Stop,
    Clear,
    Reset,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEnvelope {
    #[serde(alias = "user_input")]
    Message {
        content: String,
        #[serde(default, rename = "sessionId", skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    Command {
        command: Command,
    },
    Ping,
}

const CLIENT_TYPES: &[&str] = &["message", "user_input", "command", "ping"];

/// Parses an inbound frame, separating "not JSON" from "unknown type" from
/// "bad fields" so the client gets a useful error.
pub fn parse_client_envelope(text: &str) -> Result<ClientEnvelope, BridgeError> {
    let value: Value = serde_json::from_str(text)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| BridgeError::InvalidEnvelope {
            message: "missing string field `type`".to_string(),
        })?;
    if !CLIENT_TYPES.contains(&kind) {
        return Err(BridgeError::InvalidEnvelope {
            message: format!("unsupported type `{kind}`"),
        });
    }
    Ok(serde_json::from_value(value)?)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn server_envelopes_use_snake_case_tags() {
        let start = serde_json::to_value(ServerEnvelope::StreamStart {
            message_id: "m1".into(),
            sender: Sender::Assistant,
            timestamp: Utc::now(),
        })
        .unwrap();
        assert_eq!(start["type"], "stream_start");
        assert_eq!(start["sender"], "assistant");

        let delete = serde_json::to_value(ServerEnvelope::DeleteMessage {
            message_id: "m2".into(),
        })
        .unwrap();
        assert_eq!(delete, json!({"type": "delete_message", "message_id": "m2"}));

        assert_eq!(
            serde_json::to_value(ServerEnvelope::Pong).unwrap(),
            json!({"type": "pong"})
        );
    }

    #[test]
    fn complete_message_nests_chat_message() {
        let message = ChatMessage::new(Sender::System, "hello");
        let value = serde_json::to_value(ServerEnvelope::Message {
            message: message.clone(),
        })
        .unwrap();
        assert_eq!(value["type"], "message");
        assert_eq!(value["message"]["id"], message.id.as_str());
        assert_eq!(value["message"]["sender"], "system");
        assert!(value["message"]["timestamp"].is_string());

        let back: ServerEnvelope = serde_json::from_value(value).unwrap();
        assert_eq!(back.message_id(), Some(message.id.as_str()));
    }

    #[test]
    fn parses_inbound_variants() {
        assert_eq!(
            parse_client_envelope(r#"{"type":"message","content":"hi","sessionId":"abc"}"#)
                .unwrap(),
            ClientEnvelope::Message {
                content: "hi".into(),
                session_id: Some("abc".into()),
            }
        );
        assert_eq!(
            parse_client_envelope(r#"{"type":"user_input","content":"x"}"#).unwrap(),
            ClientEnvelope::Message {
                content: "x".into(),
                session_id: None,
            }
        );
        assert_eq!(
            parse_client_envelope(r#"{"type":"command","command":"clear"}"#).unwrap(),
            ClientEnvelope::Command {
                command: Command::Clear
            }
        );
        assert_eq!(
            parse_client_envelope(r#"{"type":"ping"}"#).unwrap(),
            ClientEnvelope::Ping
        );
    }

    #[test]
    fn rejects_malformed_inbound() {
        for (raw, needle) in [
            ("not json", "invalid envelope"),
            (r#"{"content":"hi"}"#, "missing string field `type`"),
            (r#"{"type":"launch"}"#, "unsupported type `launch`"),
            (r#"{"type":"message"}"#, "content"),
            (r#"{"type":"command","command":"explode"}"#, "explode"),
        ] {
            let err = parse_client_envelope(raw).expect_err(raw);
            assert!(
                err.to_string().contains(needle),
                "{raw}: {err} should mention {needle}"
            );
        }
    }
}
