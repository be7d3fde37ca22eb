use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use uuid::Uuid;

use super::subscribers::{Subscribers, Update, UpdateKind};
use crate::errors::ChatError;
use crate::models::{Message, MessageRole, MessageState, TokenUsage};

/// Persistence boundary. Receives every sealed message, keyed by conversation
/// id and the message's sequence number. Implementations must not block.
pub trait MessageSink: Send + Sync {
    fn record(&self, conversation_id: Uuid, message: &Message);
}

/// How the in-flight message ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub state: MessageState,
    pub response_time: Option<Duration>,
    pub usage: Option<TokenUsage>,
}

impl Completion {
    pub fn complete(usage: Option<TokenUsage>) -> Self {
        Self { state: MessageState::Complete, response_time: None, usage }
    }

    pub fn truncated() -> Self {
        Self { state: MessageState::Truncated, response_time: None, usage: None }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self { state: MessageState::Failed { reason: reason.into() }, response_time: None, usage: None }
    }

    pub fn with_response_time(mut self, elapsed: Duration) -> Self {
        self.response_time = Some(elapsed);
        self
    }
}

/// Ordered message history of one conversation.
///
/// At most one message is in flight at a time, and it is always the last one.
/// Every mutation happens under one lock, so [`snapshot`](Self::snapshot) sees a
/// chunk either fully applied or not at all. Listeners are notified after the
/// lock is released.
pub struct ConversationStore {
    id: Uuid,
    messages: Mutex<Vec<Message>>,
    subscribers: Arc<Subscribers>,
    sink: Option<Arc<dyn MessageSink>>,
}

impl ConversationStore {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            messages: Mutex::new(Vec::new()),
            subscribers: Subscribers::new(),
            sink: None,
        }
    }

    /// Seeds a store with a previously captured snapshot.
    pub fn from_history(id: Uuid, history: Vec<Message>) -> Result<Self, ChatError> {
        for (index, message) in history.iter().enumerate() {
            if message.seq != index as u64 {
                return Err(ChatError::IllegalState(format!(
                    "message at position {index} has sequence number {}",
                    message.seq
                )));
            }
            if !message.is_complete() {
                return Err(ChatError::IllegalState(format!(
                    "message {index} is still in flight"
                )));
            }
        }
        let store = Self::new(id);
        *store.lock() = history;
        Ok(store)
    }

    pub fn with_sink(mut self, sink: Arc<dyn MessageSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn subscribers(&self) -> &Arc<Subscribers> {
        &self.subscribers
    }

    /// Appends a sealed message.
    pub fn append(&self, role: MessageRole, name: &str, content: &str) -> Result<Message, ChatError> {
        let (message, update) = {
            let mut messages = self.lock();
            ensure_none_in_flight(&messages)?;
            let message = Message::new(messages.len() as u64, role, name, content);
            messages.push(message.clone());
            let update = update_for(messages.len() - 1, &message, UpdateKind::Appended);
            (message, update)
        };
        self.subscribers.publish(&update);
        self.persist(&message);
        Ok(message)
    }

    /// Opens an empty in-flight message and returns its index.
    pub fn begin(&self, role: MessageRole, name: &str) -> Result<usize, ChatError> {
        let update = {
            let mut messages = self.lock();
            ensure_none_in_flight(&messages)?;
            let mut message = Message::new(messages.len() as u64, role, name, "");
            message.state = MessageState::InFlight;
            messages.push(message);
            let index = messages.len() - 1;
            update_for(index, &messages[index], UpdateKind::Appended)
        };
        let index = update.index;
        self.subscribers.publish(&update);
        Ok(index)
    }

    /// Extends the in-flight message.
    pub fn append_chunk(&self, text: &str) -> Result<(), ChatError> {
        let update = {
            let mut messages = self.lock();
            let index = in_flight_index(&messages)
                .ok_or_else(|| ChatError::IllegalState("no message is in flight".to_string()))?;
            messages[index].content.push_str(text);
            update_for(index, &messages[index], UpdateKind::Chunk)
        };
        self.subscribers.publish(&update);
        Ok(())
    }

    /// Seals the in-flight message.
    pub fn complete(&self, completion: Completion) -> Result<Message, ChatError> {
        if !completion.state.is_complete() {
            return Err(ChatError::IllegalState(
                "a message cannot be completed as in flight".to_string(),
            ));
        }
        let (message, update) = {
            let mut messages = self.lock();
            let index = in_flight_index(&messages)
                .ok_or_else(|| ChatError::IllegalState("no message is in flight".to_string()))?;
            let message = &mut messages[index];
            message.state = completion.state;
            message.usage = completion.usage;
            message.response_time_ms = completion
                .response_time
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
            let message = message.clone();
            let update = update_for(index, &message, UpdateKind::Completed);
            (message, update)
        };
        self.subscribers.publish(&update);
        self.persist(&message);
        Ok(message)
    }

    /// Immutable copy of the full ordered history.
    pub fn snapshot(&self) -> Vec<Message> {
        self.lock().clone()
    }

    pub fn in_flight(&self) -> Option<usize> {
        in_flight_index(&self.lock())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn persist(&self, message: &Message) {
        if let Some(sink) = &self.sink {
            sink.record(self.id, message);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Message>> {
        self.messages.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn in_flight_index(messages: &[Message]) -> Option<usize> {
    messages
        .last()
        .filter(|m| !m.is_complete())
        .map(|_| messages.len() - 1)
}

fn ensure_none_in_flight(messages: &[Message]) -> Result<(), ChatError> {
    match in_flight_index(messages) {
        Some(index) => Err(ChatError::IllegalState(format!("message {index} is still in flight"))),
        None => Ok(()),
    }
}

fn update_for(index: usize, message: &Message, kind: UpdateKind) -> Update {
    Update {
        index,
        content: message.content.clone(),
        complete: message.is_complete(),
        kind,
        state: message.state.clone(),
    }
}

/// Keeps every recorded message in memory.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingSink {
    pub(crate) records: Mutex<Vec<(Uuid, Message)>>,
}

#[cfg(test)]
impl MessageSink for RecordingSink {
    fn record(&self, conversation_id: Uuid, message: &Message) {
        self.records.lock().unwrap().push((conversation_id, message.clone()));
    }
}
