//! `GET /api/attachments/:id` (metadata) and `.../content` (raw bytes with
//! a `Content-Disposition` filename), the REST face of `AttachmentStore`.

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::api::error::{api_error, domain_error};
use crate::state::AppState;

pub async fn get_meta(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.attachments.get_by_id(&id).await {
        Ok(Some(attachment)) => Json(attachment).into_response(),
        Ok(None) => api_error(StatusCode::NOT_FOUND, "attachment not found"),
        Err(err) => domain_error(err),
    }
}

pub async fn get_content(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.attachments.get_by_id(&id).await {
        Ok(Some(attachment)) => {
            let filename = percent_encode(&attachment.meta.name);
            (
                [
                    (header::CONTENT_TYPE, attachment.meta.content_type.clone()),
                    (
                        header::CONTENT_DISPOSITION,
                        format!("attachment; filename*=UTF-8''{filename}"),
                    ),
                ],
                attachment.content,
            )
                .into_response()
        }
        Ok(None) => api_error(StatusCode::NOT_FOUND, "attachment not found"),
        Err(err) => domain_error(err),
    }
}

/// Minimal RFC 3986 percent-encoding for the `filename*` extended
/// parameter (RFC 5987) — only the characters that must be escaped in
/// that grammar, leaving the rest of the name readable in the header.
fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => out.push(b as char),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}
