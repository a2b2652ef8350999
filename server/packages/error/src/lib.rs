use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidEnvelope,
    InvalidSessionToken,
    SessionClosed,
    InputPending,
    InputTimeout,
    AgentFailed,
    Transport,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidEnvelope => "urn:chat-bridge:error:invalid_envelope",
            Self::InvalidSessionToken => "urn:chat-bridge:error:invalid_session_token",
            Self::SessionClosed => "urn:chat-bridge:error:session_closed",
            Self::InputPending => "urn:chat-bridge:error:input_pending",
            Self::InputTimeout => "urn:chat-bridge:error:input_timeout",
            Self::AgentFailed => "urn:chat-bridge:error:agent_failed",
            Self::Transport => "urn:chat-bridge:error:transport",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidEnvelope => "Invalid Envelope",
            Self::InvalidSessionToken => "Invalid Session Token",
            Self::SessionClosed => "Session Closed",
            Self::InputPending => "Input Pending",
            Self::InputTimeout => "Input Timeout",
            Self::AgentFailed => "Agent Failed",
            Self::Transport => "Transport Error",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidEnvelope => 400,
            Self::InvalidSessionToken => 400,
            Self::SessionClosed => 410,
            Self::InputPending => 409,
            Self::InputTimeout => 408,
            Self::AgentFailed => 500,
            Self::Transport => 502,
        }
    }
}

/// RFC 7807 problem body returned by the HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            instance: None,
            extensions: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BridgeError {
    #[error("invalid envelope: {message}")]
    InvalidEnvelope { message: String },
    #[error("invalid browser session token: {message}")]
    InvalidSessionToken { message: String },
    #[error("session closed: {session_id}")]
    SessionClosed { session_id: String },
    #[error("previous input has not been consumed yet")]
    InputPending { session_id: String },
    #[error("timed out waiting for user input after {seconds}s")]
    InputTimeout { seconds: u64 },
    #[error("agent failed: {message}")]
    AgentFailed { message: String },
    #[error("transport error: {message}")]
    Transport { message: String },
}

impl BridgeError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidEnvelope { .. } => ErrorType::InvalidEnvelope,
            Self::InvalidSessionToken { .. } => ErrorType::InvalidSessionToken,
            Self::SessionClosed { .. } => ErrorType::SessionClosed,
            Self::InputPending { .. } => ErrorType::InputPending,
            Self::InputTimeout { .. } => ErrorType::InputTimeout,
            Self::AgentFailed { .. } => ErrorType::AgentFailed,
            Self::Transport { .. } => ErrorType::Transport,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::SessionClosed { session_id }
            | Self::InputPending { session_id } => Some(session_id),
            _ => None,
        }
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));
        if let Some(session_id) = self.session_id() {
            problem
                .extensions
                .insert("sessionId".to_string(), Value::String(session_id.to_string()));
        }
        if let Self::InputTimeout { seconds } = self {
            problem
                .extensions
                .insert("timeoutSeconds".to_string(), Value::from(*seconds));
        }
        problem
    }
}

impl From<BridgeError> for ProblemDetails {
    fn from(value: BridgeError) -> Self {
        value.to_problem_details()
    }
}

impl From<&BridgeError> for ProblemDetails {
    fn from(value: &BridgeError) -> Self {
        value.to_problem_details()
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(value: serde_json::Error) -> Self {
        Self::InvalidEnvelope {
            message: value.to_string(),
        }
    }
}
