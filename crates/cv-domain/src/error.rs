//! Shared error taxonomy used across all `cv-*` crates.
//!
//! Every named error kind from the orchestrator's error design maps to
//! exactly one variant here, so both the WebSocket JSON-RPC surface and
//! the REST surface translate a single type instead of maintaining two
//! parallel mappings.

use axum::http::StatusCode;

/// Errors raised by the event log, orchestrator, bridge, and host.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("turn state error: {0}")]
    TurnState(String),

    #[error("conversation {0} is finalized")]
    ConversationFinalized(i64),

    #[error("invalid turn number: {0}")]
    TurnHintMismatch(String),

    #[error("bad finality: {0}")]
    BadFinality(String),

    #[error("idempotency conflict: {0}")]
    IdempotencyConflict(String),

    #[error("backend lease not held")]
    BackendNotHeld,

    #[error("backend lease denied")]
    BackendDenied,

    #[error("provider error: {0}")]
    Provider(String),

    #[error("locked: edit token required")]
    Locked,

    #[error("fatal: {0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// JSON-RPC 2.0 error code for the internal `/api/ws` surface.
    pub fn rpc_code(&self) -> i64 {
        match self {
            Error::Parse(_) => -32700,
            Error::InvalidRequest(_) => -32600,
            Error::InvalidParams(_) => -32602,
            Error::MethodNotFound(_) => -32601,
            Error::NotFound(_) => -32000,
            Error::TurnState(_) => -32010,
            Error::ConversationFinalized(_) => -32011,
            Error::TurnHintMismatch(_) => -32012,
            Error::BadFinality(_) => -32013,
            Error::IdempotencyConflict(_) => -32000,
            Error::BackendNotHeld | Error::BackendDenied => -32000,
            Error::Provider(_) => -32000,
            Error::Locked => -32000,
            Error::Fatal(_) => -32000,
        }
    }

    /// HTTP status for the REST surface.
    pub fn http_status(&self) -> StatusCode {
        match self {
            Error::Parse(_) => StatusCode::BAD_REQUEST,
            Error::InvalidRequest(_) | Error::InvalidParams(_) => StatusCode::BAD_REQUEST,
            Error::MethodNotFound(_) => StatusCode::NOT_FOUND,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::TurnState(_) => StatusCode::CONFLICT,
            Error::ConversationFinalized(_) => StatusCode::CONFLICT,
            Error::TurnHintMismatch(_) => StatusCode::BAD_REQUEST,
            Error::BadFinality(_) => StatusCode::BAD_REQUEST,
            Error::IdempotencyConflict(_) => StatusCode::CONFLICT,
            Error::BackendNotHeld => StatusCode::FORBIDDEN,
            Error::BackendDenied => StatusCode::CONFLICT,
            Error::Provider(_) => StatusCode::BAD_GATEWAY,
            Error::Locked => StatusCode::from_u16(423).unwrap(),
            Error::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Fatal(format!("sqlite: {e}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Parse(format!("json: {e}"))
    }
}
