//! `/api/rooms/:pairId/*` — the A2A bridge's HTTP face: JSON-RPC dispatch,
//! control-plane and backend-lease SSE streams, lease release/takeover, the
//! epoch history views, and the agent-card document. The JSON-RPC dispatch
//! itself lives in `cv_bridge::Bridge`; this module only turns its
//! `DispatchOutcome` into HTTP/SSE framing.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use cv_bridge::{DispatchOutcome, JsonRpcRequest, JsonRpcResponse, LeaseSignal};
use cv_bus::BusEvent;
use futures_util::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::api::error::{api_error, domain_error};
use crate::state::AppState;

// ── A2A JSON-RPC ─────────────────────────────────────────────────────

pub async fn a2a_dispatch(
    State(state): State<AppState>,
    Path(pair_id): Path<String>,
    headers: axum::http::HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    let req: JsonRpcRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            return Json(JsonRpcResponse::invalid_request(Value::Null, format!("malformed JSON-RPC request: {e}")))
                .into_response()
        }
    };
    let lease_id = headers
        .get("x-banterop-backend-lease")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v).ok());

    match state.bridge.dispatch(&pair_id, req, lease_id).await {
        DispatchOutcome::Response(resp) => Json(resp).into_response(),
        DispatchOutcome::StreamMessage { conversation_id, immediate } => {
            task_event_stream(&state, conversation_id, Some(immediate)).into_response()
        }
        DispatchOutcome::StreamTask { conversation_id, since_seq } => {
            let _ = since_seq;
            task_event_stream(&state, conversation_id, None).into_response()
        }
    }
}

/// `message/stream`/`tasks/resubscribe`: one status-update frame per new
/// message event on the epoch's backing conversation, optionally preceded
/// by the immediate result of the triggering `send`.
fn task_event_stream(state: &AppState, conversation_id: i64, immediate: Option<Value>) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let bus = state.bridge.bus.clone();
    let stream = async_stream::stream! {
        if let Some(frame) = immediate {
            yield Ok(SseEvent::default().event("status-update").data(frame.to_string()));
        }
        let mut sub = bus.subscribe(conversation_id, None, false);
        while let Some(ev) = sub.receiver.recv().await {
            if let BusEvent::Event(event) = ev {
                let frame = json!({ "seq": event.seq, "finality": event.finality, "agentId": event.agent_id });
                yield Ok(SseEvent::default().event("status-update").data(frame.to_string()));
            }
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ── events.log ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct EventsLogQuery {
    since: Option<i64>,
    #[serde(default, rename = "backlogOnly")]
    backlog_only: bool,
}

pub async fn events_log(
    State(state): State<AppState>,
    Path(pair_id): Path<String>,
    Query(q): Query<EventsLogQuery>,
) -> Response {
    let Ok(Some(info)) = state.bridge.pairs.current(&pair_id) else {
        return api_error(axum::http::StatusCode::NOT_FOUND, "pair has no active epoch");
    };
    let since = q.since.unwrap_or(0);
    let bus = state.bridge.bus.clone();
    let store = state.store.clone();
    let backlog_only = q.backlog_only;
    let conversation_id = info.conversation_id;

    let stream = async_stream::stream! {
        let backlog = store.get_events_since(conversation_id, since).unwrap_or_default();
        let mut last_seq = since;
        for event in backlog {
            last_seq = event.seq;
            yield Ok::<_, Infallible>(SseEvent::default().event("event").data(json!(event).to_string()));
        }
        if backlog_only {
            return;
        }
        let mut sub = bus.subscribe(conversation_id, None, false);
        while let Some(ev) = sub.receiver.recv().await {
            if let BusEvent::Event(event) = ev {
                if event.seq <= last_seq {
                    continue;
                }
                last_seq = event.seq;
                yield Ok(SseEvent::default().event("event").data(json!(event).to_string()));
            }
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

// ── server-events (backend lease negotiation) ───────────────────────

#[derive(Debug, Deserialize)]
pub struct ServerEventsQuery {
    #[serde(default)]
    mode: ServerEventsMode,
    #[serde(default)]
    takeover: Option<u8>,
    #[serde(default, rename = "leaseId")]
    lease_id: Option<String>,
}

#[derive(Debug, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServerEventsMode {
    #[default]
    Observer,
    Backend,
}

pub async fn server_events(
    State(state): State<AppState>,
    Path(pair_id): Path<String>,
    Query(q): Query<ServerEventsQuery>,
) -> Response {
    if q.mode == ServerEventsMode::Observer {
        let Ok(Some(info)) = state.bridge.pairs.current(&pair_id) else {
            return api_error(axum::http::StatusCode::NOT_FOUND, "pair has no active epoch");
        };
        let bus = state.bridge.bus.clone();
        let stream = async_stream::stream! {
            let mut sub = bus.subscribe(info.conversation_id, None, false);
            while let Some(ev) = sub.receiver.recv().await {
                if let BusEvent::Event(event) = ev {
                    yield Ok::<_, Infallible>(SseEvent::default().event("event").data(json!(event).to_string()));
                }
            }
        };
        return Sse::new(stream).keep_alive(KeepAlive::default()).into_response();
    }

    let (signal_tx, mut signal_rx) = tokio::sync::mpsc::channel(4);
    let takeover = q.takeover.unwrap_or(0) != 0;

    let lease_id = match q.lease_id.as_deref().map(Uuid::parse_str) {
        Some(Ok(existing)) => match state.bridge.leases.rebind(&pair_id, existing, signal_tx.clone()) {
            Ok(()) => existing,
            Err(_) => match state.bridge.leases.acquire(&pair_id, signal_tx.clone(), takeover) {
                Ok(id) => id,
                Err(e) => return domain_error(e),
            },
        },
        _ => match state.bridge.leases.acquire(&pair_id, signal_tx.clone(), takeover) {
            Ok(id) => id,
            Err(e) => return domain_error(e),
        },
    };

    let bridge = state.bridge.clone();
    let pair_id_for_heartbeat = pair_id.clone();
    let stream = async_stream::stream! {
        yield Ok::<_, Infallible>(SseEvent::default().event("lease").data(json!({ "leaseId": lease_id }).to_string()));
        let mut heartbeat = tokio::time::interval(Duration::from_secs(15));
        loop {
            tokio::select! {
                signal = signal_rx.recv() => {
                    match signal {
                        Some(LeaseSignal::Revoked) => {
                            yield Ok(SseEvent::default().event("backend-revoked").data(r#"{"reason":"takeover"}"#));
                            break;
                        }
                        None => break,
                    }
                }
                _ = heartbeat.tick() => {
                    if bridge.leases.renew(&pair_id_for_heartbeat, lease_id).is_err() {
                        break;
                    }
                    yield Ok(SseEvent::default().event("heartbeat").data("{}"));
                }
            }
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

#[derive(Debug, Deserialize)]
pub struct ReleaseLeaseForm {
    #[serde(rename = "leaseId")]
    lease_id: String,
}

pub async fn backend_release(
    State(state): State<AppState>,
    Path(pair_id): Path<String>,
    axum::extract::Form(form): axum::extract::Form<ReleaseLeaseForm>,
) -> Response {
    let Ok(lease_id) = Uuid::parse_str(&form.lease_id) else {
        return api_error(axum::http::StatusCode::BAD_REQUEST, "leaseId is not a valid uuid");
    };
    match state.bridge.leases.release(&pair_id, lease_id) {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(e) => domain_error(e),
    }
}

// ── reset ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ResetBody {
    #[serde(rename = "type")]
    kind: String,
}

/// `hard` starts a fresh epoch, per §4.6's epoch-advancement triggers. `soft`
/// does not: it leaves the current epoch (and its task ids) in place and is
/// meant for lighter-weight state clearing (e.g. dropping a held lease)
/// without disturbing in-flight task references.
pub async fn reset(
    State(state): State<AppState>,
    Path(pair_id): Path<String>,
    Json(body): Json<ResetBody>,
) -> Response {
    match body.kind.as_str() {
        "hard" => match state.bridge.pairs.begin_epoch(&state.orchestrator, &pair_id).await {
            Ok(info) => Json(json!({ "epoch": info.epoch })).into_response(),
            Err(e) => domain_error(e),
        },
        "soft" => {
            let epoch = state.bridge.pairs.current_epoch(&pair_id).unwrap_or(0);
            Json(json!({ "epoch": epoch })).into_response()
        }
        _ => api_error(axum::http::StatusCode::BAD_REQUEST, "reset type must be \"soft\" or \"hard\""),
    }
}

// ── epoch history ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct EpochsQuery {
    #[serde(default)]
    order: Option<String>,
    limit: Option<usize>,
}

pub async fn list_epochs(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Query(q): Query<EpochsQuery>,
) -> Response {
    let mut epochs = match state.bridge.pairs.list_epochs(&room_id) {
        Ok(e) => e,
        Err(e) => return domain_error(e),
    };
    // `desc` (most recent epoch first) is the default per the scenario the
    // history view exists for; callers that want chronological order ask
    // for it explicitly.
    if q.order.as_deref() != Some("asc") {
        epochs.reverse();
    }
    if let Some(limit) = q.limit {
        epochs.truncate(limit);
    }
    let current_epoch = state.bridge.pairs.current_epoch(&room_id).unwrap_or(0);
    Json(json!({ "currentEpoch": current_epoch, "epochs": epochs })).into_response()
}

#[derive(Debug, Deserialize)]
pub struct EpochViewerQuery {
    viewer: Option<String>,
}

pub async fn get_epoch(
    State(state): State<AppState>,
    Path((room_id, epoch)): Path<(String, i64)>,
    Query(q): Query<EpochViewerQuery>,
) -> Response {
    let Ok(Some(info)) = state.bridge.pairs.get_epoch(&room_id, epoch) else {
        return api_error(axum::http::StatusCode::NOT_FOUND, "epoch not found");
    };
    let viewer = match q.viewer.as_deref() {
        Some("resp") => cv_bridge::Author::Resp,
        _ => cv_bridge::Author::Init,
    };
    let task_id = match viewer {
        cv_bridge::Author::Init => info.init_task_id.clone(),
        cv_bridge::Author::Resp => info.resp_task_id.clone(),
    };
    match state.bridge.project_task(&info, viewer, task_id) {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => domain_error(e),
    }
}

// ── agent card ───────────────────────────────────────────────────────

pub async fn agent_card(State(state): State<AppState>, Path(room_id): Path<String>) -> Response {
    let base = state.config.bridge.agent_card_template.clone();
    let base_url = state.config.server.public_base_url.clone();
    Json(cv_bridge::agent_card::build_for_room(&base, &room_id, &base_url)).into_response()
}

// ── MCP tools ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SendMessageBody {
    #[serde(rename = "conversationId")]
    conversation_id: String,
    message: String,
    #[serde(default)]
    attachments: Vec<McpAttachment>,
}

#[derive(Debug, Deserialize)]
pub struct McpAttachment {
    name: String,
    #[serde(rename = "contentType")]
    content_type: String,
    #[serde(rename = "contentBase64")]
    content_base64: String,
}

pub async fn mcp_begin_chat_thread(State(state): State<AppState>, Path(pair_id): Path<String>) -> Response {
    match state.bridge.begin_chat_thread(&pair_id).await {
        Ok(result) => Json(json!({ "conversationId": result.conversation_id })).into_response(),
        Err(e) => domain_error(e),
    }
}

pub async fn mcp_send_message(
    State(state): State<AppState>,
    Path(pair_id): Path<String>,
    Json(body): Json<SendMessageBody>,
) -> Response {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    let mut attachments = Vec::with_capacity(body.attachments.len());
    for a in &body.attachments {
        let Ok(bytes) = STANDARD.decode(&a.content_base64) else {
            return api_error(axum::http::StatusCode::BAD_REQUEST, "attachment contentBase64 is not valid base64");
        };
        attachments.push((a.name.clone(), a.content_type.clone(), bytes));
    }

    match state
        .bridge
        .send_message_to_chat_thread(&pair_id, &body.conversation_id, &body.message, &attachments)
        .await
    {
        Ok(result) => Json(result).into_response(),
        Err(e) => domain_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct CheckRepliesBody {
    #[serde(rename = "conversationId")]
    conversation_id: String,
    #[serde(default, rename = "waitMs")]
    wait_ms: Value,
}

pub async fn mcp_check_replies(
    State(state): State<AppState>,
    Path(pair_id): Path<String>,
    Json(body): Json<CheckRepliesBody>,
) -> Response {
    match state.bridge.check_replies(&pair_id, &body.conversation_id, &body.wait_ms).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => domain_error(e),
    }
}
