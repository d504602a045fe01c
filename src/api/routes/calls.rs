use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use crate::error::CallError;
use crate::models::{CallMedia, SessionId};
use crate::session::SessionsView;
use crate::state::ServiceContext;

type ApiResult<T> = Result<Json<T>, (StatusCode, String)>;

fn status_for(err: &CallError) -> StatusCode {
    match err {
        CallError::InvalidState { .. } | CallError::PairBusy(_) => StatusCode::CONFLICT,
        CallError::UnknownSession(_) => StatusCode::NOT_FOUND,
        CallError::SelfCall | CallError::NoVideoTrack => StatusCode::BAD_REQUEST,
        CallError::EngineStopped => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn map_err(err: CallError) -> (StatusCode, String) {
    (status_for(&err), err.to_string())
}

fn ok() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": true}))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceCallRequest {
    pub remote_party_id: String,
    #[serde(default = "default_media")]
    pub media: CallMedia,
}

fn default_media() -> CallMedia {
    CallMedia::AudioOnly
}

pub async fn place_call(
    State(ctx): State<ServiceContext>,
    Json(body): Json<PlaceCallRequest>,
) -> ApiResult<serde_json::Value> {
    let session_id = ctx
        .calls
        .place_call(body.remote_party_id, body.media)
        .await
        .map_err(map_err)?;
    Ok(Json(serde_json::json!({ "sessionId": session_id })))
}

pub async fn list_calls(State(ctx): State<ServiceContext>) -> Json<SessionsView> {
    Json(ctx.calls.sessions())
}

pub async fn accept_call(
    State(ctx): State<ServiceContext>,
    Path(session_id): Path<SessionId>,
) -> ApiResult<serde_json::Value> {
    ctx.calls.accept_call(session_id).await.map(|_| ok()).map_err(map_err)
}

pub async fn decline_call(
    State(ctx): State<ServiceContext>,
    Path(session_id): Path<SessionId>,
) -> ApiResult<serde_json::Value> {
    ctx.calls.decline_call(session_id).await.map(|_| ok()).map_err(map_err)
}

pub async fn cancel_call(
    State(ctx): State<ServiceContext>,
    Path(session_id): Path<SessionId>,
) -> ApiResult<serde_json::Value> {
    ctx.calls.cancel_call(session_id).await.map(|_| ok()).map_err(map_err)
}

pub async fn end_call(
    State(ctx): State<ServiceContext>,
    Path(session_id): Path<SessionId>,
) -> ApiResult<serde_json::Value> {
    ctx.calls.end_call(session_id).await.map(|_| ok()).map_err(map_err)
}

pub async fn toggle_mute(
    State(ctx): State<ServiceContext>,
    Path(session_id): Path<SessionId>,
) -> ApiResult<serde_json::Value> {
    ctx.calls
        .toggle_mute(session_id)
        .await
        .map(|muted| Json(serde_json::json!({ "muted": muted })))
        .map_err(map_err)
}

pub async fn toggle_video(
    State(ctx): State<ServiceContext>,
    Path(session_id): Path<SessionId>,
) -> ApiResult<serde_json::Value> {
    ctx.calls
        .toggle_video(session_id)
        .await
        .map(|enabled| Json(serde_json::json!({ "videoEnabled": enabled })))
        .map_err(map_err)
}
