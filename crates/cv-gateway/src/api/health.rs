use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::state::AppState;

pub async fn health(State(_state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "ok": true }))
}
