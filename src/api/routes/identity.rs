use axum::{extract::State, Json};

use crate::state::ServiceContext;

pub async fn get_identity(State(ctx): State<ServiceContext>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "partyId": ctx.party_id }))
}
