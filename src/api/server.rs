use axum::{routing::{get, post}, Router};
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::api::{routes, websocket};
use crate::error::CallError;
use crate::state::ServiceContext;

pub fn build_router(ctx: ServiceContext) -> Router {
    Router::new()
        // Identity
        .route("/api/v1/identity", get(routes::identity::get_identity))
        // Calls
        .route("/api/v1/calls", get(routes::calls::list_calls).post(routes::calls::place_call))
        .route("/api/v1/calls/:session_id/accept", post(routes::calls::accept_call))
        .route("/api/v1/calls/:session_id/decline", post(routes::calls::decline_call))
        .route("/api/v1/calls/:session_id/cancel", post(routes::calls::cancel_call))
        .route("/api/v1/calls/:session_id/end", post(routes::calls::end_call))
        .route("/api/v1/calls/:session_id/mute", post(routes::calls::toggle_mute))
        .route("/api/v1/calls/:session_id/video", post(routes::calls::toggle_video))
        // WebSocket
        .route("/ws", get(websocket::ws_handler))
        // Middleware
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

pub async fn start_api_server(ctx: ServiceContext, port: u16) -> Result<(), CallError> {
    let router = build_router(ctx);
    let addr = format!("127.0.0.1:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("API server listening on http://{}", addr);
    axum::serve(listener, router).await?;
    Ok(())
}
