pub mod api_routes;
pub mod ws_routes;

use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use self::api_routes::{
    cancel_handler, close_session_handler, create_session_handler, delete_conversation_handler,
    list_conversations_handler, list_messages_handler, resume_conversation_handler, send_message_handler,
    session_history_handler, session_status_handler,
};
use self::ws_routes::ws_session_handler;
use crate::service::ChatService;

pub fn router(chat_service: ChatService) -> Router {
    Router::new()
        // Live sessions
        .route("/api/sessions", post(create_session_handler))
        .route("/api/sessions/{id}", get(session_status_handler).delete(close_session_handler))
        .route("/api/sessions/{id}/history", get(session_history_handler))
        .route("/api/sessions/{id}/messages", post(send_message_handler))
        .route("/api/sessions/{id}/cancel", post(cancel_handler))
        .route("/ws/sessions/{id}", get(ws_session_handler))
        // Stored conversations
        .route("/api/conversations", get(list_conversations_handler))
        .route("/api/conversations/{id}", delete(delete_conversation_handler))
        .route("/api/conversations/{id}/messages", get(list_messages_handler))
        .route("/api/conversations/{id}/resume", post(resume_conversation_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(chat_service)
}
