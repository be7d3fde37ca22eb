use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::{ConversationRepository, MessageRepository};
use crate::errors::AppError;
use crate::models::{Conversation, Message, MessageRole};
use crate::service::MessageSink;

const TITLE_LENGTH: usize = 60;
const UNTITLED: &str = "New conversation";

struct Record {
    conversation_id: Uuid,
    message: Message,
}

/// Writes sealed messages to PostgreSQL from a background task, so recording
/// never blocks the streaming path.
pub struct PgMessageSink {
    tx: mpsc::UnboundedSender<Record>,
}

impl PgMessageSink {
    /// Starts the writer task on the current runtime.
    pub fn spawn(conversations: ConversationRepository, messages: MessageRepository) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(conversations, messages, rx));
        Arc::new(Self { tx })
    }
}

impl MessageSink for PgMessageSink {
    fn record(&self, conversation_id: Uuid, message: &Message) {
        let record = Record { conversation_id, message: message.clone() };
        if self.tx.send(record).is_err() {
            warn!(conversation = %conversation_id, seq = message.seq, "Message writer stopped; message not stored");
        }
    }
}

async fn run_writer(
    conversations: ConversationRepository,
    messages: MessageRepository,
    mut rx: mpsc::UnboundedReceiver<Record>,
) {
    // Conversation id -> whether its row already carries a real title.
    let mut known: HashMap<Uuid, bool> = HashMap::new();
    while let Some(record) = rx.recv().await {
        if let Err(e) = write(&conversations, &messages, &mut known, &record).await {
            error!(
                conversation = %record.conversation_id,
                seq = record.message.seq,
                "Failed to store message: {e}"
            );
        }
    }
    debug!("Message writer stopped");
}

async fn write(
    conversations: &ConversationRepository,
    messages: &MessageRepository,
    known: &mut HashMap<Uuid, bool>,
    record: &Record,
) -> Result<(), AppError> {
    let id = record.conversation_id.to_string();
    let message = &record.message;
    let is_user = message.role == MessageRole::User;

    let titled = match known.get(&record.conversation_id) {
        Some(titled) => *titled,
        None => {
            let titled = if conversations.find_by_id(&id).await?.is_some() {
                true
            } else {
                let title = if is_user { title_for(&message.content) } else { UNTITLED.to_string() };
                conversations.save(&Conversation::new(id.clone(), title)).await?;
                is_user
            };
            known.insert(record.conversation_id, titled);
            titled
        }
    };
    if !titled && is_user {
        conversations.update_title(&id, &title_for(&message.content)).await?;
        known.insert(record.conversation_id, true);
    }

    messages.save(&id, message).await?;
    if let Err(e) = conversations.update_timestamp(&id).await {
        error!("Failed to update conversation timestamp: {e}");
    }
    Ok(())
}

/// First user message, cut to 60 characters.
fn title_for(text: &str) -> String {
    let t = text.trim();
    if t.chars().count() > TITLE_LENGTH {
        format!("{}…", t.chars().take(TITLE_LENGTH).collect::<String>())
    } else {
        t.to_string()
    }
}
