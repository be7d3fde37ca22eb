pub mod chat_service;
pub mod controller;
pub mod conversation_store;
pub mod session;
pub mod subscribers;

pub use chat_service::ChatService;
pub use controller::{Phase, StreamingController};
pub use conversation_store::{Completion, ConversationStore, MessageSink};
pub use session::{ChatSession, SessionBuilder};
pub use subscribers::{Subscribers, Subscription, Update, UpdateKind};
