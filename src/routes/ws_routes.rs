use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::api_routes::error_response;
use crate::models::{WsCommand, WsEvent};
use crate::service::ChatService;

/// GET `/ws/sessions/{id}`: upgrades to a WebSocket bound to one session.
pub async fn ws_session_handler(
    ws: WebSocketUpgrade,
    Path(id): Path<String>,
    State(svc): State<ChatService>,
) -> Response {
    if let Err(e) = svc.session(&id) {
        return error_response(&e);
    }
    ws.on_upgrade(move |socket| handle_socket(socket, svc, id)).into_response()
}

/// Handles a single WebSocket connection.
///
/// Protocol:
/// - Server sends `{ "type": "snapshot", "messages": [...] }` once, then one
///   `{ "type": "update", "index", "content", "complete", "kind", "state" }`
///   per conversation mutation.
/// - Client sends `{ "type": "send", "message": "..." }` or `{ "type": "cancel" }`.
/// - Rejected commands answer `{ "type": "error", "message": "..." }`.
async fn handle_socket(mut socket: WebSocket, svc: ChatService, id: String) {
    let session = match svc.session(&id) {
        Ok(session) => session,
        Err(e) => {
            send_event(&mut socket, &WsEvent::Error { message: e.to_string() }).await;
            return;
        }
    };
    info!(session = %id, "WebSocket client connected");

    // Updates carry the full content of their message, so one that also
    // made it into the snapshot is harmless.
    let (tx, mut rx) = mpsc::unbounded_channel::<WsEvent>();
    let subscription = session.subscribe(move |update| {
        let _ = tx.send(WsEvent::Update(update.clone()));
    });
    send_event(&mut socket, &WsEvent::Snapshot { messages: session.history() }).await;
    drop(session);

    loop {
        tokio::select! {
            Some(event) = rx.recv() => send_event(&mut socket, &event).await,
            msg = socket.recv() => {
                let text = match msg {
                    Some(Ok(Message::Text(t))) => t.to_string(),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!("WebSocket receive error: {e}");
                        break;
                    }
                };

                let result = match serde_json::from_str::<WsCommand>(&text) {
                    Ok(WsCommand::Send { message }) => svc.send(&id, &message).map_err(|e| e.to_string()),
                    Ok(WsCommand::Cancel) => svc.cancel(&id).map_err(|e| e.to_string()),
                    Err(e) => Err(format!("Invalid request: {e}")),
                };
                if let Err(message) = result {
                    send_event(&mut socket, &WsEvent::Error { message }).await;
                }
            }
        }
    }

    drop(subscription);
    info!(session = %id, "WebSocket client disconnected");
}

/// Helper: serialize a `WsEvent` and send it over the socket.
async fn send_event(socket: &mut WebSocket, event: &WsEvent) {
    if let Ok(json) = serde_json::to_string(event) {
        let _ = socket.send(Message::Text(json.into())).await;
    }
}
