//! `GET /api/ws` — the internal JSON-RPC 2.0 surface every first-party
//! client (dashboard, CLI, tests) talks to. One connection multiplexes
//! request/response pairs with server-pushed `{method:"event"|"guidance"
//! |"conversation", params:…}` notifications for every live subscription
//! the connection opened: a reader task and a writer task split off one
//! socket, joined by an outbound channel, dispatching over the same
//! [`cv_bridge::rpc`] envelope the A2A surface already uses.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use cv_bridge::{JsonRpcRequest, JsonRpcResponse};
use cv_bus::{BusEvent, SubscriptionFilter};
use cv_domain::{Error, EventType, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex as SyncMutex;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::state::AppState;

pub async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Per-connection subscription bookkeeping. Dropped (and its forwarder
/// tasks aborted) when the connection closes — subscriptions never
/// outlive the WebSocket that opened them.
struct Subscriptions {
    tasks: HashMap<Uuid, JoinHandle<()>>,
}

impl Drop for Subscriptions {
    fn drop(&mut self) {
        for (_, task) in self.tasks.drain() {
            task.abort();
        }
    }
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Value>(256);
    let subs = Arc::new(SyncMutex::new(Subscriptions { tasks: HashMap::new() }));

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if sink.send(Message::Text(frame.to_string())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => {
                let response = dispatch_text(&text, &state, &outbound_tx, &subs).await;
                if let Some(response) = response {
                    if outbound_tx.send(serde_json::to_value(response).unwrap()).await.is_err() {
                        break;
                    }
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    writer.abort();
}

async fn dispatch_text(
    text: &str,
    state: &AppState,
    outbound_tx: &mpsc::Sender<Value>,
    subs: &Arc<SyncMutex<Subscriptions>>,
) -> Option<JsonRpcResponse> {
    let req: JsonRpcRequest = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => return Some(JsonRpcResponse::invalid_request(Value::Null, format!("parse error: {e}"))),
    };
    let id = req.id.clone();
    Some(match dispatch(req, state, outbound_tx, subs).await {
        Ok(result) => JsonRpcResponse::ok(id, result),
        Err(err) => JsonRpcResponse::from_error(id, &err),
    })
}

async fn dispatch(
    req: JsonRpcRequest,
    state: &AppState,
    outbound_tx: &mpsc::Sender<Value>,
    subs: &Arc<SyncMutex<Subscriptions>>,
) -> Result<Value> {
    match req.method.as_str() {
        "ping" => Ok(json!({ "ok": true, "ts": chrono::Utc::now().to_rfc3339() })),

        "createConversation" => {
            let meta: cv_domain::ConversationMeta = parse_params(req.params)?;
            let title = meta.title.clone();
            let conversation_id = state.orchestrator.create_conversation(meta).await?;
            Ok(json!({ "conversationId": conversation_id, "title": title }))
        }

        "getConversation" => {
            #[derive(Deserialize)]
            struct Params {
                #[serde(rename = "conversationId")]
                conversation_id: i64,
            }
            let p: Params = parse_params(req.params)?;
            let snapshot = state.orchestrator.get_conversation_snapshot(p.conversation_id)?;
            Ok(json!(snapshot))
        }

        "getEventsPage" => {
            #[derive(Deserialize)]
            struct Params {
                #[serde(rename = "conversationId")]
                conversation_id: i64,
                #[serde(default, rename = "afterSeq")]
                after_seq: Option<i64>,
                #[serde(default = "default_page_limit")]
                limit: i64,
            }
            let p: Params = parse_params(req.params)?;
            let events = state.store.get_events_page(p.conversation_id, p.after_seq, p.limit)?;
            let next_after_seq = events.last().map(|e| e.seq);
            Ok(json!({ "events": events, "nextAfterSeq": next_after_seq }))
        }

        "subscribe" => {
            #[derive(Deserialize)]
            struct Params {
                #[serde(rename = "conversationId")]
                conversation_id: i64,
                #[serde(default, rename = "includeGuidance")]
                include_guidance: bool,
                #[serde(default)]
                filters: Option<FilterParams>,
                #[serde(default, rename = "sinceSeq")]
                since_seq: Option<i64>,
            }
            let p: Params = parse_params(req.params)?;
            let filter = p.filters.map(FilterParams::into_filter);
            let sub_id = start_conversation_subscription(
                state,
                outbound_tx.clone(),
                p.conversation_id,
                filter,
                p.include_guidance,
                p.since_seq,
                subs,
            );
            Ok(json!({ "subId": sub_id }))
        }

        "subscribeConversations" => {
            let sub_id = start_conversations_watch(state, outbound_tx.clone(), subs);
            Ok(json!({ "subId": sub_id }))
        }

        "subscribeAll" => {
            #[derive(Deserialize, Default)]
            struct Params {
                #[serde(default, rename = "includeGuidance")]
                include_guidance: bool,
            }
            let p: Params = parse_params_or_default(req.params)?;
            let sub_id = start_all_subscription(state, outbound_tx.clone(), p.include_guidance, subs);
            Ok(json!({ "subId": sub_id }))
        }

        "unsubscribe" => {
            #[derive(Deserialize)]
            struct Params {
                #[serde(rename = "subId")]
                sub_id: Uuid,
            }
            let p: Params = parse_params(req.params)?;
            if let Some(task) = subs.lock().tasks.remove(&p.sub_id) {
                task.abort();
            }
            state.bridge.bus.unsubscribe(p.sub_id);
            Ok(json!({ "ok": true }))
        }

        "sendMessage" => {
            #[derive(Deserialize)]
            struct Params {
                #[serde(rename = "conversationId")]
                conversation_id: i64,
                #[serde(default)]
                turn: Option<i64>,
                #[serde(rename = "agentId")]
                agent_id: String,
                #[serde(rename = "messagePayload")]
                message_payload: MessagePayloadParam,
                finality: String,
                #[serde(default, rename = "clientRequestId")]
                client_request_id: Option<String>,
            }
            let p: Params = parse_params(req.params)?;
            let finality = cv_domain::Finality::from_str(&p.finality)
                .ok_or_else(|| Error::BadFinality(format!("unknown finality {}", p.finality)))?;
            let receipt = state
                .orchestrator
                .send_message(
                    p.conversation_id,
                    p.turn,
                    &p.agent_id,
                    p.message_payload.into_payload(),
                    finality,
                    p.client_request_id.as_deref(),
                )
                .await?;
            Ok(json!({ "seq": receipt.seq, "turn": receipt.turn, "event": receipt.event }))
        }

        "sendTrace" => {
            #[derive(Deserialize)]
            struct Params {
                #[serde(rename = "conversationId")]
                conversation_id: i64,
                #[serde(default)]
                turn: Option<i64>,
                #[serde(rename = "agentId")]
                agent_id: String,
                #[serde(rename = "tracePayload")]
                trace_payload: Value,
                #[serde(default, rename = "clientRequestId")]
                client_request_id: Option<String>,
            }
            let p: Params = parse_params(req.params)?;
            let raw = match p.trace_payload {
                Value::Object(map) => map,
                Value::Null => serde_json::Map::new(),
                other => {
                    let mut map = serde_json::Map::new();
                    map.insert("value".into(), other);
                    map
                }
            };
            let receipt = state
                .orchestrator
                .send_trace(
                    p.conversation_id,
                    p.turn,
                    &p.agent_id,
                    cv_domain::EventPayload::Trace { raw },
                    p.client_request_id.as_deref(),
                )
                .await?;
            Ok(json!({ "seq": receipt.seq, "turn": receipt.turn, "event": receipt.event }))
        }

        "clearTurn" => {
            #[derive(Deserialize)]
            struct Params {
                #[serde(rename = "conversationId")]
                conversation_id: i64,
                #[serde(rename = "agentId")]
                agent_id: String,
            }
            let p: Params = parse_params(req.params)?;
            let turn = state.orchestrator.clear_turn(p.conversation_id, &p.agent_id).await?;
            Ok(json!({ "turn": turn }))
        }

        "lifecycle.ensure" => {
            #[derive(Deserialize)]
            struct Params {
                #[serde(rename = "conversationId")]
                conversation_id: i64,
                #[serde(default, rename = "agentIds")]
                agent_ids: Option<Vec<String>>,
            }
            let p: Params = parse_params(req.params)?;
            let ensured = state.host.ensure(p.conversation_id, p.agent_ids).await?;
            Ok(json!({ "ensured": ensured.into_iter().map(|a| json!({ "id": a.id, "class": a.class })).collect::<Vec<_>>() }))
        }

        "lifecycle.stop" => {
            #[derive(Deserialize)]
            struct Params {
                #[serde(rename = "conversationId")]
                conversation_id: i64,
                #[serde(default, rename = "agentIds")]
                agent_ids: Option<Vec<String>>,
            }
            let p: Params = parse_params(req.params)?;
            state.host.stop(p.conversation_id, p.agent_ids).await;
            Ok(json!({ "ok": true }))
        }

        "lifecycle.getEnsured" => {
            #[derive(Deserialize)]
            struct Params {
                #[serde(rename = "conversationId")]
                conversation_id: i64,
            }
            let p: Params = parse_params(req.params)?;
            let ensured = state.host.list(p.conversation_id);
            Ok(json!({ "ensured": ensured.into_iter().map(|a| json!({ "id": a.id, "class": a.class })).collect::<Vec<_>>() }))
        }

        "getAttachment" => {
            #[derive(Deserialize)]
            struct Params {
                id: String,
            }
            let p: Params = parse_params(req.params)?;
            match state.attachments.get_by_id(&p.id).await? {
                Some(attachment) => Ok(json!(attachment)),
                None => Err(Error::NotFound(format!("attachment {}", p.id))),
            }
        }

        "listScenarios" => Ok(json!({ "scenarios": state.scenarios.list().await? })),

        "getScenario" => {
            #[derive(Deserialize)]
            struct Params {
                id: String,
            }
            let p: Params = parse_params(req.params)?;
            match state.scenarios.get(&p.id).await? {
                Some(scenario) => Ok(json!(scenario)),
                None => Err(Error::NotFound(format!("scenario {}", p.id))),
            }
        }

        other => Err(Error::MethodNotFound(other.to_string())),
    }
}

fn default_page_limit() -> i64 {
    200
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T> {
    serde_json::from_value(params).map_err(|e| Error::InvalidParams(e.to_string()))
}

fn parse_params_or_default<T: serde::de::DeserializeOwned + Default>(params: Value) -> Result<T> {
    if params.is_null() {
        return Ok(T::default());
    }
    parse_params(params)
}

#[derive(Deserialize)]
struct FilterParams {
    #[serde(default)]
    types: Option<Vec<String>>,
    #[serde(default)]
    agents: Option<Vec<String>>,
}

impl FilterParams {
    fn into_filter(self) -> SubscriptionFilter {
        SubscriptionFilter {
            types: self.types.map(|ts| ts.iter().filter_map(|t| EventType::from_str(t)).collect()),
            agents: self.agents,
        }
    }
}

/// Mirrors [`cv_domain::EventPayload::Message`]'s shape for inbound
/// `sendMessage` params, without requiring the caller to also supply the
/// `kind` tag `EventPayload`'s `Deserialize` expects.
#[derive(Deserialize)]
struct MessagePayloadParam {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    attachments: Option<Vec<String>>,
    #[serde(flatten)]
    raw: serde_json::Map<String, Value>,
}

impl MessagePayloadParam {
    fn into_payload(self) -> cv_domain::EventPayload {
        cv_domain::EventPayload::Message {
            text: self.text,
            attachments: self.attachments,
            raw: self.raw,
        }
    }
}

/// `subscribe`: backlog (`getEventsSince`) then live bus, deduplicated by
/// `seq` — the composition `cv-bus` explicitly leaves to callers.
fn start_conversation_subscription(
    state: &AppState,
    outbound_tx: mpsc::Sender<Value>,
    conversation_id: i64,
    filter: Option<SubscriptionFilter>,
    include_guidance: bool,
    since_seq: Option<i64>,
    subs: &Arc<SyncMutex<Subscriptions>>,
) -> Uuid {
    let store = state.store.clone();
    let bus = state.bridge.bus.clone();
    let live = bus.subscribe(conversation_id, filter, include_guidance);
    let sub_id = live.id;

    let task = tokio::spawn(async move {
        let mut last_seq = since_seq.unwrap_or(0);
        if let Ok(backlog) = store.get_events_since(conversation_id, last_seq) {
            for event in backlog {
                last_seq = event.seq;
                if outbound_tx
                    .send(json!({ "method": "event", "params": event }))
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }

        let mut receiver = live.receiver;
        while let Some(ev) = receiver.recv().await {
            let frame = match ev {
                BusEvent::Event(event) => {
                    if event.seq <= last_seq {
                        continue;
                    }
                    last_seq = event.seq;
                    json!({ "method": "event", "params": event })
                }
                BusEvent::Guidance(guidance) => json!({ "method": "guidance", "params": guidance }),
                BusEvent::Lagged { last_seen_seq } => json!({ "method": "lag", "params": { "lastSeenSeq": last_seen_seq } }),
            };
            if outbound_tx.send(frame).await.is_err() {
                break;
            }
        }
    });

    subs.lock().tasks.insert(sub_id, task);
    sub_id
}

fn start_all_subscription(
    state: &AppState,
    outbound_tx: mpsc::Sender<Value>,
    include_guidance: bool,
    subs: &Arc<SyncMutex<Subscriptions>>,
) -> Uuid {
    let bus = state.bridge.bus.clone();
    let live = bus.subscribe_all(None, include_guidance);
    let sub_id = live.id;
    let mut receiver = live.receiver;

    let task = tokio::spawn(async move {
        while let Some(ev) = receiver.recv().await {
            let frame = match ev {
                BusEvent::Event(event) => json!({ "method": "event", "params": event }),
                BusEvent::Guidance(guidance) => json!({ "method": "guidance", "params": guidance }),
                BusEvent::Lagged { last_seen_seq } => json!({ "method": "lag", "params": { "lastSeenSeq": last_seen_seq } }),
            };
            if outbound_tx.send(frame).await.is_err() {
                break;
            }
        }
    });

    subs.lock().tasks.insert(sub_id, task);
    sub_id
}

/// `subscribeConversations`: pushes `{method:"conversation",
/// params:{conversationId}}` whenever any conversation is created
/// (`meta_created`) or terminally closes (`finality=conversation`).
fn start_conversations_watch(state: &AppState, outbound_tx: mpsc::Sender<Value>, subs: &Arc<SyncMutex<Subscriptions>>) -> Uuid {
    let bus = state.bridge.bus.clone();
    let live = bus.subscribe_all(None, false);
    let sub_id = live.id;
    let mut receiver = live.receiver;

    let task = tokio::spawn(async move {
        while let Some(ev) = receiver.recv().await {
            let BusEvent::Event(event) = ev else { continue };
            let is_created = matches!(
                &event.payload,
                cv_domain::EventPayload::System { kind, .. } if kind.as_str() == cv_domain::SystemKind::META_CREATED
            );
            let is_closed = event.finality == cv_domain::Finality::Conversation;
            if !is_created && !is_closed {
                continue;
            }
            let frame = json!({ "method": "conversation", "params": { "conversationId": event.conversation_id } });
            if outbound_tx.send(frame).await.is_err() {
                break;
            }
        }
    });

    subs.lock().tasks.insert(sub_id, task);
    sub_id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_params_drops_unknown_event_types() {
        let p = FilterParams {
            types: Some(vec!["message".to_string(), "not_a_real_type".to_string()]),
            agents: Some(vec!["agentA".to_string()]),
        };
        let filter = p.into_filter();
        assert_eq!(filter.types, Some(vec![EventType::Message]));
        assert_eq!(filter.agents, Some(vec!["agentA".to_string()]));
    }

    #[test]
    fn filter_params_default_means_no_filter() {
        let filter = FilterParams { types: None, agents: None }.into_filter();
        assert!(filter.types.is_none());
        assert!(filter.agents.is_none());
    }

    #[test]
    fn message_payload_param_round_trips_raw_extension_fields() {
        let params: Value = json!({
            "text": "hello",
            "attachments": ["att-1"],
            "customField": 42,
        });
        let parsed: MessagePayloadParam = parse_params(params).unwrap();
        let payload = parsed.into_payload();
        match payload {
            cv_domain::EventPayload::Message { text, attachments, raw } => {
                assert_eq!(text.as_deref(), Some("hello"));
                assert_eq!(attachments, Some(vec!["att-1".to_string()]));
                assert_eq!(raw.get("customField").and_then(Value::as_i64), Some(42));
            }
            other => panic!("expected Message payload, got {other:?}"),
        }
    }

    #[test]
    fn message_payload_param_allows_missing_text() {
        let parsed: MessagePayloadParam = parse_params(json!({})).unwrap();
        let payload = parsed.into_payload();
        match payload {
            cv_domain::EventPayload::Message { text, attachments, .. } => {
                assert!(text.is_none());
                assert!(attachments.is_none());
            }
            other => panic!("expected Message payload, got {other:?}"),
        }
    }

    #[test]
    fn parse_params_or_default_accepts_null() {
        let filter: FilterParams = parse_params_or_default(Value::Null).unwrap();
        assert!(filter.types.is_none());
        assert!(filter.agents.is_none());
    }

    #[test]
    fn parse_params_rejects_wrong_shape() {
        let result: Result<FilterParams> = parse_params(json!("not an object"));
        assert!(result.is_err());
    }

    #[test]
    fn default_page_limit_matches_events_page_fallback() {
        assert_eq!(default_page_limit(), 200);
    }
}
