use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use crate::errors::AppError;
use crate::models::{CreateSessionRequest, SendRequest, SessionCreated};
use crate::service::ChatService;

// ── Sessions ──────────────────────────────────────────────────────────────────

/// POST `/api/sessions`: optional `{ "history": [...] }` body replays a snapshot
pub async fn create_session_handler(State(svc): State<ChatService>, body: Bytes) -> Response {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        CreateSessionRequest::default()
    } else {
        match serde_json::from_slice::<CreateSessionRequest>(&body) {
            Ok(request) => request,
            Err(e) => return bad_request(format!("Invalid request: {e}")),
        }
    };

    match svc.create_session(request.history) {
        Ok(id) => (StatusCode::CREATED, Json(SessionCreated { session_id: id.to_string() })).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET `/api/sessions/{id}`
pub async fn session_status_handler(Path(id): Path<String>, State(svc): State<ChatService>) -> Response {
    match svc.status(&id) {
        Ok(status) => Json(status).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET `/api/sessions/{id}/history`
pub async fn session_history_handler(Path(id): Path<String>, State(svc): State<ChatService>) -> Response {
    match svc.history(&id) {
        Ok(messages) => Json(messages).into_response(),
        Err(e) => error_response(&e),
    }
}

/// POST `/api/sessions/{id}/messages`: starts a generation; the reply streams over `/ws`
pub async fn send_message_handler(
    Path(id): Path<String>,
    State(svc): State<ChatService>,
    Json(request): Json<SendRequest>,
) -> Response {
    match svc.send(&id, &request.message) {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => error_response(&e),
    }
}

/// POST `/api/sessions/{id}/cancel`
pub async fn cancel_handler(Path(id): Path<String>, State(svc): State<ChatService>) -> Response {
    match svc.cancel(&id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(&e),
    }
}

/// DELETE `/api/sessions/{id}`
pub async fn close_session_handler(Path(id): Path<String>, State(svc): State<ChatService>) -> Response {
    match svc.close_session(&id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(&e),
    }
}

// ── Stored conversations ──────────────────────────────────────────────────────

/// GET `/api/conversations`
pub async fn list_conversations_handler(State(svc): State<ChatService>) -> Response {
    match svc.get_conversations().await {
        Ok(convs) => Json(convs).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET `/api/conversations/{id}/messages`
pub async fn list_messages_handler(Path(id): Path<String>, State(svc): State<ChatService>) -> Response {
    match svc.get_messages(&id).await {
        Ok(msgs) => Json(msgs).into_response(),
        Err(e) => error_response(&e),
    }
}

/// POST `/api/conversations/{id}/resume`
pub async fn resume_conversation_handler(Path(id): Path<String>, State(svc): State<ChatService>) -> Response {
    match svc.resume_conversation(&id).await {
        Ok(session_id) => {
            (StatusCode::CREATED, Json(SessionCreated { session_id: session_id.to_string() })).into_response()
        }
        Err(e) => error_response(&e),
    }
}

/// DELETE `/api/conversations/{id}`
pub async fn delete_conversation_handler(Path(id): Path<String>, State(svc): State<ChatService>) -> Response {
    match svc.delete_conversation(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(&e),
    }
}

// ── Helper ────────────────────────────────────────────────────────────────────

pub(crate) fn error_response(err: &AppError) -> Response {
    let status = if err.is_validation() {
        StatusCode::BAD_REQUEST
    } else if err.is_not_found() {
        StatusCode::NOT_FOUND
    } else if err.is_conflict() {
        StatusCode::CONFLICT
    } else if matches!(err, AppError::PersistenceDisabled) {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        error!("Request failed: {err}");
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}
