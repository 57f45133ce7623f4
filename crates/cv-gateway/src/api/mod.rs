//! Builds the full HTTP/WebSocket router, listing every route in one
//! place.

pub mod attachments;
pub mod auth;
pub mod conversations;
pub mod error;
pub mod health;
pub mod rooms;
pub mod scenarios;
pub mod ws;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

/// Routes that don't require the bearer token — just health and the
/// room/pair bridge surfaces external A2A/MCP clients reach without a
/// first-party session.
fn public_router() -> Router<AppState> {
    Router::new()
        .route("/api/health", get(health::health))
        .route("/api/ws", get(ws::ws_upgrade))
        .route("/api/rooms/:pairId/a2a", post(rooms::a2a_dispatch))
        .route("/api/rooms/:pairId/events.log", get(rooms::events_log))
        .route("/api/rooms/:pairId/server-events", get(rooms::server_events))
        .route("/api/rooms/:pairId/backend/release", post(rooms::backend_release))
        .route("/api/rooms/:pairId/reset", post(rooms::reset))
        .route("/api/rooms/:roomId/epochs", get(rooms::list_epochs))
        .route("/api/rooms/:roomId/epochs/:epoch", get(rooms::get_epoch))
        .route("/api/rooms/:roomId/.well-known/agent-card.json", get(rooms::agent_card))
        .route("/api/rooms/:pairId/mcp/begin_chat_thread", post(rooms::mcp_begin_chat_thread))
        .route("/api/rooms/:pairId/mcp/send_message_to_chat_thread", post(rooms::mcp_send_message))
        .route("/api/rooms/:pairId/mcp/check_replies", post(rooms::mcp_check_replies))
}

/// Routes guarded by `api::auth::require_api_token` (a no-op when
/// `CV_API_TOKEN` is unset — dev mode).
fn protected_router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/api/conversations", get(conversations::list))
        .route("/api/attachments/:id", get(attachments::get_meta))
        .route("/api/attachments/:id/content", get(attachments::get_content))
        .route(
            "/api/scenarios",
            get(scenarios::list).post(scenarios::create),
        )
        .route(
            "/api/scenarios/:id",
            get(scenarios::get).put(scenarios::update).delete(scenarios::delete),
        )
        .layer(middleware::from_fn_with_state(state, auth::require_api_token))
}

pub fn router(state: AppState) -> Router<AppState> {
    public_router().merge(protected_router(state))
}
