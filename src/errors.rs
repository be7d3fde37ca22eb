use thiserror::Error;

/// Failures talking to the model server. Recovered by the streaming
/// controller, which turns them into an error-marked assistant message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Ollama service unreachable at {host}: {message}")]
    Unreachable { host: String, message: String },

    #[error("Malformed response from Ollama: {0}")]
    ProtocolError(String),

    #[error("Ollama responded with HTTP {0}")]
    ServerError(u16),
}

/// Errors raised by the chat orchestration core to its callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    /// A generation is already running (or being cancelled) for this conversation.
    #[error("A response is already being generated for this conversation")]
    AlreadyInProgress,

    /// Conversation store misuse. Seeing this outside the core means a controller bug.
    #[error("Illegal conversation state: {0}")]
    IllegalState(String),

    #[error("Cannot send an empty message")]
    EmptyMessage,
}

/// Top-level application error.
/// All variants carry a human-readable message for display/logging.
#[derive(Debug, Error)]
pub enum AppError {
    // ── Database errors ──────────────────────────────────────────────────────
    #[error("Database query failed: {message}")]
    DatabaseQueryFailed {
        message: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("Persistence is not configured (set DATABASE_URL)")]
    PersistenceDisabled,

    // ── Session errors ───────────────────────────────────────────────────────
    #[error("Session '{id}' not found")]
    SessionNotFound { id: String },

    #[error("Conversation '{id}' not found")]
    ConversationNotFound { id: String },

    #[error(transparent)]
    Chat(#[from] ChatError),

    // ── Validation errors ────────────────────────────────────────────────────
    #[error("Field '{field_name}' cannot be empty")]
    EmptyField { field_name: String },

    #[error("Field '{field_name}' exceeds max length of {max_length} (actual: {actual_length})")]
    FieldTooLong { field_name: String, max_length: usize, actual_length: usize },

    #[error("Invalid conversation history: {reason}")]
    InvalidHistory { reason: String },

    // ── System errors ────────────────────────────────────────────────────────
    #[error("Invalid value '{value}' for {key}")]
    InvalidConfig { key: String, value: String },

    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn db_query(message: impl Into<String>, source: sqlx::Error) -> Self {
        AppError::DatabaseQueryFailed { message: message.into(), source }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, AppError::SessionNotFound { .. } | AppError::ConversationNotFound { .. })
    }

    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            AppError::EmptyField { .. }
                | AppError::FieldTooLong { .. }
                | AppError::InvalidHistory { .. }
                | AppError::Chat(ChatError::EmptyMessage)
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, AppError::Chat(ChatError::AlreadyInProgress))
    }
}
