//! Store-and-forward signaling relay. Parties hold a WebSocket push channel
//! open; envelopes for a party without one wait in its mailbox until the
//! party attaches or polls.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::error::CallError;
use crate::signaling::registry::Registry;
use crate::signaling::SignalingEnvelope;

#[derive(Clone, Default)]
pub struct RendezvousState {
    registry: Arc<Mutex<Registry>>,
}

impl RendezvousState {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeQuery {
    pub party_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollQuery {
    pub user_id: String,
}

pub fn build_router(state: RendezvousState) -> Router {
    Router::new()
        .route("/signal", get(poll).post(post_envelope))
        .route("/signal/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run_rendezvous(port: u16) -> Result<(), CallError> {
    let router = build_router(RendezvousState::new());
    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Rendezvous listening on ws://{}", addr);
    axum::serve(listener, router).await?;
    Ok(())
}

async fn post_envelope(
    State(state): State<RendezvousState>,
    Json(envelope): Json<SignalingEnvelope>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    if envelope.to.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "envelope has no recipient".into()));
    }
    debug!("Routing {:?} {} -> {}", envelope.kind, envelope.from, envelope.to);
    state.registry.lock().await.route(envelope);
    Ok(Json(serde_json::json!({"ok": true})))
}

async fn poll(
    State(state): State<RendezvousState>,
    Query(query): Query<PollQuery>,
) -> Json<serde_json::Value> {
    let messages = state.registry.lock().await.drain(&query.user_id);
    Json(serde_json::json!({ "messages": messages }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<RendezvousState>,
    Query(query): Query<SubscribeQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    if query.party_id.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "partyId is required".into()));
    }
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, query.party_id)))
}

async fn handle_socket(mut socket: WebSocket, state: RendezvousState, party: String) {
    let (generation, mut inbox) = state.registry.lock().await.attach(&party);
    info!("{} attached to rendezvous", party);

    loop {
        tokio::select! {
            envelope = inbox.recv() => {
                // A newer attach for the same party closes this inbox.
                let Some(envelope) = envelope else {
                    info!("{} attached elsewhere, closing old socket", party);
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                };
                let json = match envelope.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("Failed to encode envelope for {}: {}", party, e);
                        continue;
                    }
                };
                if socket.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let envelope = match serde_json::from_str::<SignalingEnvelope>(&text) {
                        Ok(envelope) => envelope,
                        Err(e) => {
                            warn!("Malformed envelope from {}: {}", party, e);
                            continue;
                        }
                    };
                    if envelope.from != party {
                        warn!("{} tried to send as {}, dropping", party, envelope.from);
                        continue;
                    }
                    state.registry.lock().await.route(envelope);
                }
                Some(Ok(Message::Ping(data))) => {
                    if socket.send(Message::Pong(data)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    state.registry.lock().await.detach(&party, generation);
    info!("{} detached from rendezvous", party);
}
