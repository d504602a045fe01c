use axum::{
    extract::{State, ws::{Message, WebSocket, WebSocketUpgrade}},
    response::IntoResponse,
};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::events::EventReceiver;
use crate::state::ServiceContext;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(ctx): State<ServiceContext>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, ctx.event_tx.subscribe()))
}

async fn handle_socket(mut socket: WebSocket, mut event_rx: EventReceiver) {
    debug!("Call UI client connected");

    loop {
        tokio::select! {
            result = event_rx.recv() => {
                match result {
                    Ok(event) => {
                        let json = match serde_json::to_string(&event) {
                            Ok(json) => json,
                            Err(e) => {
                                warn!("Failed to serialize call event: {}", e);
                                continue;
                            }
                        };
                        if socket.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    // Lagging clients resync from GET /api/v1/calls.
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Call UI client lagged, skipped {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    debug!("Call UI client disconnected");
}
