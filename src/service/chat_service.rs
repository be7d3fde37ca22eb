use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{error, info};
use uuid::Uuid;

use super::conversation_store::MessageSink;
use super::session::ChatSession;
use crate::agent::ChatTransport;
use crate::db::{ConversationRepository, MessageRepository};
use crate::errors::{AppError, ChatError};
use crate::models::{Conversation, Message, SessionStatus};

const MAX_MESSAGE_LENGTH: usize = 8000;

#[derive(Clone)]
struct Storage {
    conversation_repo: ConversationRepository,
    message_repo: MessageRepository,
    sink: Arc<dyn MessageSink>,
}

/// Registry of live chat sessions, plus access to stored conversations when
/// persistence is configured.
#[derive(Clone)]
pub struct ChatService {
    sessions: Arc<Mutex<HashMap<Uuid, Arc<ChatSession>>>>,
    transport: Arc<dyn ChatTransport>,
    user_name: String,
    system_prompt: Option<String>,
    storage: Option<Storage>,
}

impl ChatService {
    pub fn new(transport: Arc<dyn ChatTransport>, user_name: impl Into<String>, system_prompt: Option<String>) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            transport,
            user_name: user_name.into(),
            system_prompt,
            storage: None,
        }
    }

    pub fn with_persistence(
        mut self,
        conversation_repo: ConversationRepository,
        message_repo: MessageRepository,
        sink: Arc<dyn MessageSink>,
    ) -> Self {
        self.storage = Some(Storage { conversation_repo, message_repo, sink });
        self
    }

    // ── Live sessions ─────────────────────────────────────────────────────────

    /// Opens a session, replaying `history` when it is non-empty.
    pub fn create_session(&self, history: Vec<Message>) -> Result<Uuid, AppError> {
        let session = self.build_session(Uuid::new_v4(), history)?;
        let id = session.id();
        self.lock().insert(id, Arc::new(session));
        info!(session = %id, "Session created");
        Ok(id)
    }

    pub fn session(&self, id: &str) -> Result<Arc<ChatSession>, AppError> {
        let not_found = || AppError::SessionNotFound { id: id.to_string() };
        let key = Uuid::parse_str(id).map_err(|_| not_found())?;
        self.lock().get(&key).cloned().ok_or_else(not_found)
    }

    pub fn status(&self, id: &str) -> Result<SessionStatus, AppError> {
        let session = self.session(id)?;
        Ok(SessionStatus {
            session_id: session.id().to_string(),
            phase: session.phase(),
            elapsed_ms: session.elapsed().map(|d| d.as_millis() as u64),
            message_count: session.history().len(),
        })
    }

    pub fn send(&self, id: &str, message: &str) -> Result<(), AppError> {
        // ── Validation ────────────────────────────────────────────────────────
        if message.trim().is_empty() {
            return Err(AppError::EmptyField { field_name: "message".to_string() });
        }
        if message.len() > MAX_MESSAGE_LENGTH {
            return Err(AppError::FieldTooLong {
                field_name: "message".to_string(),
                max_length: MAX_MESSAGE_LENGTH,
                actual_length: message.len(),
            });
        }

        self.session(id)?.send(message)?;
        Ok(())
    }

    pub fn cancel(&self, id: &str) -> Result<(), AppError> {
        self.session(id)?.cancel();
        Ok(())
    }

    pub fn history(&self, id: &str) -> Result<Vec<Message>, AppError> {
        Ok(self.session(id)?.history())
    }

    /// Forgets the session and stops its generation.
    pub fn close_session(&self, id: &str) -> Result<(), AppError> {
        let session = self.session(id)?;
        self.lock().remove(&session.id());
        session.cancel();
        info!(session = %session.id(), "Session closed");
        Ok(())
    }

    pub fn session_count(&self) -> usize {
        self.lock().len()
    }

    // ── Stored conversations ──────────────────────────────────────────────────

    pub async fn get_conversations(&self) -> Result<Vec<Conversation>, AppError> {
        self.storage()?.conversation_repo.find_all().await
    }

    pub async fn get_messages(&self, conversation_id: &str) -> Result<Vec<Message>, AppError> {
        let storage = self.storage()?;
        storage
            .conversation_repo
            .find_by_id(conversation_id)
            .await?
            .ok_or_else(|| AppError::ConversationNotFound { id: conversation_id.to_string() })?;
        storage.message_repo.find_by_conversation_id(conversation_id).await
    }

    /// Opens a session that continues a stored conversation. If one is
    /// already live, its id is returned instead.
    pub async fn resume_conversation(&self, conversation_id: &str) -> Result<Uuid, AppError> {
        let key = Uuid::parse_str(conversation_id)
            .map_err(|_| AppError::ConversationNotFound { id: conversation_id.to_string() })?;
        if self.lock().contains_key(&key) {
            return Ok(key);
        }

        let history = self.get_messages(conversation_id).await?;
        let session = self.build_session(key, history)?;
        match self.lock().entry(key) {
            Entry::Occupied(_) => {}
            Entry::Vacant(slot) => {
                info!(session = %key, replayed = session.history().len(), "Conversation resumed");
                slot.insert(Arc::new(session));
            }
        }
        Ok(key)
    }

    /// Soft-deletes a stored conversation and closes its live session, if any.
    pub async fn delete_conversation(&self, conversation_id: &str) -> Result<(), AppError> {
        let storage = self.storage()?;
        if !storage.conversation_repo.soft_delete(conversation_id).await? {
            return Err(AppError::ConversationNotFound { id: conversation_id.to_string() });
        }
        if let Err(e) = storage.message_repo.soft_delete_by_conversation_id(conversation_id).await {
            error!("Failed to delete messages of conversation {conversation_id}: {e}");
        }
        if let Ok(key) = Uuid::parse_str(conversation_id) {
            if let Some(session) = self.lock().remove(&key) {
                session.cancel();
            }
        }
        info!(conversation = %conversation_id, "Conversation deleted");
        Ok(())
    }

    fn build_session(&self, id: Uuid, history: Vec<Message>) -> Result<ChatSession, AppError> {
        let mut builder = ChatSession::builder(Arc::clone(&self.transport))
            .id(id)
            .user_name(self.user_name.clone())
            .system_prompt(self.system_prompt.clone())
            .history(history);
        if let Some(storage) = &self.storage {
            builder = builder.sink(Arc::clone(&storage.sink));
        }
        builder.build().map_err(|e| match e {
            ChatError::IllegalState(reason) => AppError::InvalidHistory { reason },
            other => AppError::Chat(other),
        })
    }

    fn storage(&self) -> Result<&Storage, AppError> {
        self.storage.as_ref().ok_or(AppError::PersistenceDisabled)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Arc<ChatSession>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
