//! `GET /api/conversations` — list/filter conversation summaries, the REST
//! counterpart of the `listConversations` JSON-RPC method.

use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use cv_domain::{ConversationFilter, ConversationStatus};
use serde::Deserialize;
use serde_json::json;

use crate::api::error::domain_error;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ListConversationsQuery {
    status: Option<String>,
    #[serde(rename = "scenarioId")]
    scenario_id: Option<String>,
    hours: Option<i64>,
    limit: Option<i64>,
    offset: Option<i64>,
}

pub async fn list(
    State(state): State<AppState>,
    Query(q): Query<ListConversationsQuery>,
) -> Response {
    let filter = ConversationFilter {
        status: q.status.as_deref().and_then(ConversationStatus::from_str),
        scenario_id: q.scenario_id,
        hours: q.hours,
        limit: q.limit,
        offset: q.offset,
    };
    match state.orchestrator.list_conversations(&filter) {
        Ok(conversations) => Json(json!({ "conversations": conversations })).into_response(),
        Err(err) => domain_error(err),
    }
}
