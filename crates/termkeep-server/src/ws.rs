use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use libtermkeep::OUTPUT_QUEUE_CAPACITY;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use termkeep_protocol::{ErrorCode, ServerMessage};

use crate::connection::Connection;
use crate::server::AppState;

/// WebSocket upgrade handler.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Drive one WebSocket connection.
///
/// A writer task owns the socket's send half and drains the connection's
/// output sink. The read loop feeds text frames to the protocol handler.
/// When the socket closes, every session the connection held is orphaned.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(OUTPUT_QUEUE_CAPACITY);

    let write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(Message::text(encode(&msg))).await.is_err() {
                break;
            }
        }
    });

    let mut conn = Connection::new(state.manager.clone(), tx);

    while let Some(msg_result) = ws_receiver.next().await {
        let msg = match msg_result {
            Ok(m) => m,
            Err(e) => {
                debug!("ws read error: {e}");
                break;
            }
        };

        match msg {
            Message::Text(text) => conn.handle_text(text.as_str()),
            Message::Binary(data) => {
                debug!(len = data.len(), "ignoring binary frame");
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    conn.close();
    write_task.abort();
}

/// JSON text for `msg`. A message that cannot be encoded is replaced by an
/// error frame for the same session, so the client still gets an answer.
fn encode(msg: &ServerMessage) -> String {
    let error = match serde_json::to_string(msg) {
        Ok(text) => return text,
        Err(e) => e,
    };
    warn!(error = %error, "failed to encode server message");
    let message = format!("failed to encode server message: {error}");
    let fallback = match msg.session_id() {
        Some(session_id) => ServerMessage::session_error(ErrorCode::ServerError, message, session_id),
        None => ServerMessage::error(ErrorCode::ServerError, message),
    };
    serde_json::to_string(&fallback)
        .unwrap_or_else(|_| r#"{"type":"error","code":"server_error","message":"encoding failed"}"#.to_string())
}
