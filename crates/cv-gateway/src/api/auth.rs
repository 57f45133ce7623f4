//! Bearer-token auth for the protected half of the router, and the
//! `X-Edit-Token` guard for published scenarios — both a constant-time
//! compare against a stored hash.

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::api::error::api_error;
use crate::state::AppState;

/// `None` in `state.api_token_hash` means no token is configured (dev
/// mode) — every request passes through.
pub async fn require_api_token(State(state): State<AppState>, req: Request<Body>, next: Next) -> Response {
    let Some(expected_hash) = &state.api_token_hash else {
        return next.run(req).await;
    };

    let provided = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");
    let provided_hash = Sha256::digest(provided.as_bytes());

    if !bool::from(provided_hash.ct_eq(expected_hash.as_slice())) {
        return api_error(StatusCode::UNAUTHORIZED, "invalid or missing API token");
    }
    next.run(req).await
}

/// Scenarios tagged `published` (a truthy `config.published` field) may
/// only be mutated by a caller presenting a matching `X-Edit-Token`.
/// Missing/mismatched token -> HTTP 423, per spec.
pub fn check_edit_token(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected_hash) = &state.edit_token_hash else {
        return Ok(());
    };
    let provided = headers.get("x-edit-token").and_then(|v| v.to_str().ok()).unwrap_or("");
    let provided_hash = Sha256::digest(provided.as_bytes());
    if bool::from(provided_hash.ct_eq(expected_hash.as_slice())) {
        Ok(())
    } else {
        Err(api_error(StatusCode::from_u16(423).unwrap(), "missing or invalid X-Edit-Token"))
    }
}
