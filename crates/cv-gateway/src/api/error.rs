//! A single JSON error shape for the REST surface: `{ "error": "<message>" }`,
//! collected here once since every route in this crate maps the same
//! `cv_domain::Error`.

use axum::response::{IntoResponse, Response};
use axum::Json;
use cv_domain::Error;

pub fn api_error(status: axum::http::StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

pub fn domain_error(err: Error) -> Response {
    api_error(err.http_status(), err.to_string())
}
