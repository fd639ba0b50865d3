//! WebSocket adapter for session streams
//!
//! Each connection runs one [`StreamGateway`](crate::gateway::StreamGateway)
//! subscription and forwards its frames as JSON text messages.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path as AxumPath, State,
    },
    response::{IntoResponse, Response},
};
use devlink_auth::SessionId;
use devlink_core::StreamFrame;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::http::{parse_session_id, ApiError};
use crate::state::AppState;

/// Frames buffered between the gateway and the socket
const FRAME_BUFFER: usize = 32;

/// WebSocket handler for `GET /api/sessions/:id/stream`
pub async fn stream_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    let id = match parse_session_id(&id) {
        Ok(id) => id,
        Err(e) => return e.into_response(),
    };

    // Reject unknown sessions before upgrading
    if let Err(e) = state.controller().status(&id).await {
        return ApiError::from(e).into_response();
    }

    ws.on_upgrade(move |socket| handle_stream_socket(socket, state, id))
        .into_response()
}

/// Pump gateway frames into the socket until either side finishes
pub async fn handle_stream_socket(socket: WebSocket, state: Arc<AppState>, id: SessionId) {
    let (mut sender, mut receiver) = socket.split();
    let (frames_tx, mut frames_rx) = mpsc::channel::<StreamFrame>(FRAME_BUFFER);

    info!("Stream client connected for session {}", id);

    let gateway = state.gateway();
    let gateway_id = id.clone();
    let gateway_task = tokio::spawn(async move {
        if let Err(e) = gateway.run(gateway_id.clone(), frames_tx).await {
            warn!("Stream for session {} failed: {}", gateway_id, e);
        }
    });

    loop {
        tokio::select! {
            frame = frames_rx.recv() => match frame {
                Some(frame) => {
                    let json = match serde_json::to_string(&frame) {
                        Ok(json) => json,
                        Err(e) => {
                            warn!("Failed to encode stream frame: {}", e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(json)).await.is_err() {
                        debug!("Stream socket for session {} went away", id);
                        break;
                    }
                }
                None => {
                    // Gateway finished after a terminal frame
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            },
            msg = receiver.next() => match msg {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    warn!("Stream socket receive error: {}", e);
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    // Dropping the receiver ends the gateway loop and its live connection
    drop(frames_rx);
    let _ = gateway_task.await;
    info!("Stream client disconnected from session {}", id);
}
