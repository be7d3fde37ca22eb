use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::service::Update;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(id: String, title: String) -> Self {
        let now = Utc::now();
        Self { id, title, created_at: now, updated_at: now }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "USER",
            MessageRole::Assistant => "ASSISTANT",
            MessageRole::System => "SYSTEM",
        }
    }

    /// Role name in the Ollama chat API.
    pub fn wire_name(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for MessageRole {
    type Error = String;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_uppercase().as_str() {
            "USER" => Ok(MessageRole::User),
            "ASSISTANT" => Ok(MessageRole::Assistant),
            "SYSTEM" => Ok(MessageRole::System),
            other => Err(format!("Unknown role: {other}")),
        }
    }
}

/// Lifecycle of a message. Anything but `InFlight` is sealed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageState {
    InFlight,
    Complete,
    /// Generation was cancelled; content holds what arrived before that.
    Truncated,
    Failed { reason: String },
}

impl MessageState {
    pub fn is_complete(&self) -> bool {
        !matches!(self, MessageState::InFlight)
    }

    /// Column value used by the message table.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageState::InFlight => "IN_FLIGHT",
            MessageState::Complete => "COMPLETE",
            MessageState::Truncated => "TRUNCATED",
            MessageState::Failed { .. } => "FAILED",
        }
    }

    pub fn from_columns(state: &str, error: Option<String>) -> Result<Self, String> {
        match state {
            "IN_FLIGHT" => Ok(MessageState::InFlight),
            "COMPLETE" => Ok(MessageState::Complete),
            "TRUNCATED" => Ok(MessageState::Truncated),
            "FAILED" => Ok(MessageState::Failed { reason: error.unwrap_or_default() }),
            other => Err(format!("Unknown message state: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Position in the conversation, starting at zero with no gaps.
    pub seq: u64,
    pub role: MessageRole,
    /// Author: the user's login name, the model name, or `System`.
    pub name: String,
    pub content: String,
    pub state: MessageState,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

impl Message {
    pub fn new(seq: u64, role: MessageRole, name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            seq,
            role,
            name: name.into(),
            content: content.into(),
            state: MessageState::Complete,
            created_at: Utc::now(),
            response_time_ms: None,
            usage: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state.is_complete()
    }
}

/// `12:38:12 @ llama3: Hello! How can I assist you today?`
impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {}: {}", self.created_at.format("%H:%M:%S"), self.name, self.content)?;
        match &self.state {
            MessageState::Truncated => f.write_str(" [truncated]"),
            MessageState::Failed { reason } => write!(f, " [error: {reason}]"),
            MessageState::InFlight | MessageState::Complete => Ok(()),
        }
    }
}

// ── HTTP payloads ─────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub history: Vec<Message>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionCreated {
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
pub struct SendRequest {
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub phase: crate::service::Phase,
    pub elapsed_ms: Option<u64>,
    pub message_count: usize,
}

// ── WebSocket protocol ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsCommand {
    Send { message: String },
    Cancel,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsEvent {
    Snapshot { messages: Vec<Message> },
    Update(Update),
    Error { message: String },
}
