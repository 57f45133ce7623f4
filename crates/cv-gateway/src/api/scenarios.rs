//! `/api/scenarios[/:id]` — thin REST CRUD over `ScenarioStore`. Mutating
//! a scenario tagged `published` (a truthy `config.published` field)
//! requires a matching `X-Edit-Token` header, enforced by
//! `api::auth::check_edit_token` before the store is touched.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::Value;

use crate::api::auth::check_edit_token;
use crate::api::error::{api_error, domain_error};
use crate::state::AppState;

pub async fn list(State(state): State<AppState>) -> Response {
    match state.scenarios.list().await {
        Ok(scenarios) => Json(serde_json::json!({ "scenarios": scenarios })).into_response(),
        Err(err) => domain_error(err),
    }
}

pub async fn get(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.scenarios.get(&id).await {
        Ok(Some(scenario)) => Json(scenario).into_response(),
        Ok(None) => api_error(StatusCode::NOT_FOUND, "scenario not found"),
        Err(err) => domain_error(err),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateScenarioBody {
    name: String,
    config: Value,
}

pub async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateScenarioBody>,
) -> Response {
    if is_published(&body.config) {
        if let Err(resp) = check_edit_token(&state, &headers) {
            return resp;
        }
    }
    match state.scenarios.insert(body.name, body.config).await {
        Ok(scenario) => (StatusCode::CREATED, Json(scenario)).into_response(),
        Err(err) => domain_error(err),
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateScenarioBody {
    name: Option<String>,
    config: Option<Value>,
}

pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<UpdateScenarioBody>,
) -> Response {
    let guarded = match state.scenarios.get(&id).await {
        Ok(Some(existing)) => is_published(&existing.config) || body.config.as_ref().is_some_and(is_published),
        Ok(None) => return api_error(StatusCode::NOT_FOUND, "scenario not found"),
        Err(err) => return domain_error(err),
    };
    if guarded {
        if let Err(resp) = check_edit_token(&state, &headers) {
            return resp;
        }
    }
    match state.scenarios.update(&id, body.name, body.config).await {
        Ok(scenario) => Json(scenario).into_response(),
        Err(err) => domain_error(err),
    }
}

pub async fn delete(State(state): State<AppState>, Path(id): Path<String>, headers: HeaderMap) -> Response {
    let guarded = match state.scenarios.get(&id).await {
        Ok(Some(existing)) => is_published(&existing.config),
        Ok(None) => return api_error(StatusCode::NOT_FOUND, "scenario not found"),
        Err(err) => return domain_error(err),
    };
    if guarded {
        if let Err(resp) = check_edit_token(&state, &headers) {
            return resp;
        }
    }
    match state.scenarios.delete(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => domain_error(err),
    }
}

fn is_published(config: &Value) -> bool {
    config.get("published").and_then(Value::as_bool).unwrap_or(false)
}
