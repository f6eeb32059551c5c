//! Session WebSocket handler
//!
//! One connection is one session. Text frames carry JSON commands, binary
//! frames carry microphone audio while recording. Everything going back to
//! the client passes through a single outbound queue so control events and
//! reply audio stay in the order they were produced.

use std::sync::Arc;

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use super::ApiState;
use crate::session::{
    ClientCommand, OUTBOUND_CAPACITY, Outbound, ServerEvent, SessionSink, TurnController,
};

/// Build WebSocket router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .with_state(state)
}

/// Handle WebSocket upgrade request
async fn ws_upgrade(State(state): State<Arc<ApiState>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<ApiState>) {
    let session_id = uuid::Uuid::new_v4().to_string();
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Outbound>(OUTBOUND_CAPACITY);

    tracing::info!(session_id = %session_id, "WebSocket connected");

    // Forward queued events and audio to the socket
    let mut send_task = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            let message = match outbound {
                Outbound::Event(event) => match serde_json::to_string(&event) {
                    Ok(text) => Message::Text(text.into()),
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to serialize event");
                        continue;
                    }
                },
                Outbound::Audio(chunk) => Message::Binary(chunk),
            };
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    let out = SessionSink::new(tx);
    out.emit(ServerEvent::ChatAgentStart {
        latency: "0ms".to_string(),
    })
    .await;
    out.emit(ServerEvent::ChatAgentStream {
        text: state.greeting.clone(),
    })
    .await;

    let mut controller = TurnController::new(state.services.clone(), out);
    let session_for_recv = session_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(message) = receiver.next().await {
            let message = match message {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!(error = %e, "WebSocket receive failed");
                    break;
                }
            };

            match message {
                Message::Text(text) => match serde_json::from_str::<ClientCommand>(&text) {
                    Ok(command) => controller.handle(command).await,
                    Err(e) => tracing::warn!(error = %e, "unrecognized client message"),
                },
                Message::Binary(data) => controller.push_audio(data),
                Message::Ping(data) => {
                    tracing::trace!(len = data.len(), "received ping");
                }
                Message::Close(_) => {
                    tracing::info!(session_id = %session_for_recv, "WebSocket closed by client");
                    break;
                }
                Message::Pong(_) => {}
            }
        }
        controller.shutdown().await;
    });

    // Wait for either task to complete; dropping the controller stops its work
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    tracing::info!(session_id = %session_id, "WebSocket disconnected");
}
