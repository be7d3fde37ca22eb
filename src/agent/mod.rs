//! Transport to the chat-completion server.
//!
//! A [`ChatTransport`] turns a conversation history into a lazy stream of
//! [`TokenChunk`]s. The stream owns the underlying connection: dropping it,
//! for whatever reason, releases the connection.

pub mod ollama;

#[cfg(test)]
pub(crate) mod fake_ollama;
#[cfg(test)]
pub(crate) mod scripted;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::errors::TransportError;
use crate::models::{Message, TokenUsage};

pub use ollama::OllamaClient;

/// One incremental fragment of generated text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenChunk {
    pub text: String,
    pub is_final: bool,
    /// Reported by the server on the final chunk only.
    pub usage: Option<TokenUsage>,
}

impl TokenChunk {
    pub fn delta(text: impl Into<String>) -> Self {
        Self { text: text.into(), is_final: false, usage: None }
    }

    pub fn last(text: impl Into<String>, usage: Option<TokenUsage>) -> Self {
        Self { text: text.into(), is_final: true, usage }
    }
}

/// Single-consumption sequence of chunks; ends after the final chunk or the first error.
pub type TokenStream = BoxStream<'static, Result<TokenChunk, TransportError>>;

#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Name recorded as the author of assistant messages.
    fn model_name(&self) -> &str;

    /// Opens one request for `history`, whose last message must be the new user turn.
    async fn stream(&self, history: &[Message]) -> Result<TokenStream, TransportError>;
}
