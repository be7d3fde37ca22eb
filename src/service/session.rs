use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::runtime::Handle;
use tracing::debug;
use uuid::Uuid;

use super::controller::{Phase, StreamingController};
use super::conversation_store::{ConversationStore, MessageSink};
use super::subscribers::{Subscription, Update};
use crate::agent::ChatTransport;
use crate::errors::ChatError;
use crate::models::{Message, MessageRole};

const SYSTEM: &str = "System";

/// One conversation with the model, as seen by a UI.
///
/// Sessions share no state with each other; dropping one cancels its running
/// generation.
pub struct ChatSession {
    id: Uuid,
    created_at: DateTime<Utc>,
    store: Arc<ConversationStore>,
    controller: Arc<StreamingController>,
}

impl ChatSession {
    pub fn builder(transport: Arc<dyn ChatTransport>) -> SessionBuilder {
        SessionBuilder {
            transport,
            id: None,
            user_name: "user".to_string(),
            system_prompt: None,
            history: Vec::new(),
            sink: None,
            runtime: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Starts a generation for `text`. Returns as soon as it is running.
    pub fn send(&self, text: &str) -> Result<(), ChatError> {
        if text.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        self.controller.send(text)
    }

    /// Stops the running generation, if any.
    pub fn cancel(&self) {
        self.controller.cancel();
    }

    pub fn history(&self) -> Vec<Message> {
        self.store.snapshot()
    }

    /// Registers `listener` for every conversation mutation, delivered on the
    /// thread performing it. Dropping the returned handle unsubscribes.
    pub fn subscribe(&self, listener: impl Fn(&Update) + Send + Sync + 'static) -> Subscription {
        self.store.subscribers().subscribe(listener)
    }

    pub fn phase(&self) -> Phase {
        self.controller.phase()
    }

    pub fn is_processing(&self) -> bool {
        self.phase() != Phase::Idle
    }

    /// Time spent on the current generation so far.
    pub fn elapsed(&self) -> Option<Duration> {
        self.controller.elapsed()
    }

    pub async fn wait_idle(&self) {
        self.controller.wait_idle().await;
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        debug!(session = %self.id, "Session dropped");
        self.controller.cancel();
    }
}

pub struct SessionBuilder {
    transport: Arc<dyn ChatTransport>,
    id: Option<Uuid>,
    user_name: String,
    system_prompt: Option<String>,
    history: Vec<Message>,
    sink: Option<Arc<dyn MessageSink>>,
    runtime: Option<Handle>,
}

impl SessionBuilder {
    /// Conversation id; a fresh one is generated otherwise.
    pub fn id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    /// Author name recorded on user messages.
    pub fn user_name(mut self, name: impl Into<String>) -> Self {
        self.user_name = name.into();
        self
    }

    /// Opens a fresh conversation with this system message. Ignored when replaying history.
    pub fn system_prompt(mut self, prompt: Option<String>) -> Self {
        self.system_prompt = prompt;
        self
    }

    /// Replays a previously captured snapshot as the initial history.
    pub fn history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }

    pub fn sink(mut self, sink: Arc<dyn MessageSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Runtime for generation tasks; defaults to the current one.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn build(self) -> Result<ChatSession, ChatError> {
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current()
                .map_err(|e| ChatError::IllegalState(format!("no tokio runtime available: {e}")))?,
        };
        let id = self.id.unwrap_or_else(Uuid::new_v4);
        let replaying = !self.history.is_empty();

        let mut store = ConversationStore::from_history(id, self.history)?;
        if let Some(sink) = self.sink {
            store = store.with_sink(sink);
        }
        if !replaying {
            if let Some(prompt) = self.system_prompt.filter(|p| !p.trim().is_empty()) {
                store.append(MessageRole::System, SYSTEM, &prompt)?;
            }
        }

        let store = Arc::new(store);
        let controller =
            StreamingController::new(Arc::clone(&store), self.transport, self.user_name, runtime);
        debug!(session = %id, replayed = store.len(), "Session opened");

        Ok(ChatSession { id, created_at: Utc::now(), store, controller })
    }
}
