pub mod conversation_repository;
pub mod message_repository;
pub mod sink;

pub use conversation_repository::ConversationRepository;
pub use message_repository::MessageRepository;
pub use sink::PgMessageSink;
