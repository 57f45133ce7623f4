//! A2A JSON-RPC method dispatch over a pair: `message/send`, `message/stream`,
//! `tasks/get`, `tasks/cancel`, `tasks/resubscribe`/`tasks/subscribe`.
//!
//! The streaming methods (`message/stream`, `tasks/resubscribe`) don't write
//! an SSE response themselves — this crate has no transport dependency — they
//! resolve to [`DispatchOutcome::Stream`], telling the caller which
//! conversation to subscribe to and where the reply stream should conceptually
//! start; an HTTP layer turns that into `text/event-stream` frames the way it
//! already turns a bus subscription into `events.log`.

use std::sync::Arc;

use cv_bus::Bus;
use cv_domain::config::BridgeConfig;
use cv_domain::{Error, Event, EventPayload, EventType, Finality, Result};
use cv_orchestrator::Orchestrator;
use serde_json::{json, Value};

use crate::finality::NextState;
use crate::lease::{LeaseStatus, LeaseTable};
use crate::pair::{task_id, Author, EpochInfo, PairStore};
use crate::rpc::{JsonRpcRequest, JsonRpcResponse};

/// The A2A-namespaced extension key under `message.metadata`.
pub const EXT_NAMESPACE: &str = "cv";

pub struct Bridge {
    pub orchestrator: Arc<Orchestrator>,
    pub bus: Arc<Bus>,
    pub pairs: PairStore,
    pub leases: LeaseTable,
    pub config: BridgeConfig,
}

pub enum DispatchOutcome {
    Response(JsonRpcResponse),
    /// Caller should open an SSE stream of status-update frames for
    /// `conversation_id`, having already applied `immediate` as the first
    /// frame (the result of the `send` half of `message/stream`).
    StreamMessage {
        conversation_id: i64,
        immediate: Value,
    },
    /// Caller should open an SSE stream of task frames for `conversation_id`
    /// starting after `since_seq`.
    StreamTask {
        conversation_id: i64,
        since_seq: i64,
    },
}

impl Bridge {
    /// Requires `X-Banterop-Backend-Lease` for responder-side writes:
    /// `method` is a write, `author` is the side attempting it, and if
    /// that side is `resp` the lease must be held and match `lease_id`.
    fn require_lease_for_responder_write(&self, pair_id: &str, author: Author, lease_id: Option<uuid::Uuid>) -> Result<()> {
        if author != Author::Resp {
            return Ok(());
        }
        match (self.leases.status(pair_id), lease_id) {
            (LeaseStatus::Held, Some(_)) => Ok(()),
            _ => Err(Error::BackendNotHeld),
        }
    }

    pub async fn dispatch(
        &self,
        pair_id: &str,
        req: JsonRpcRequest,
        lease_id: Option<uuid::Uuid>,
    ) -> DispatchOutcome {
        let id = req.id.clone();
        let result = match req.method.as_str() {
            "message/send" => self.message_send(pair_id, &req.params, lease_id).await,
            "tasks/get" => self.tasks_get(pair_id, &req.params),
            "tasks/cancel" => self.tasks_cancel(pair_id, &req.params, lease_id).await,
            "message/stream" => {
                return match self.message_send(pair_id, &req.params, lease_id).await {
                    Ok((snapshot, info)) => DispatchOutcome::StreamMessage {
                        conversation_id: info.conversation_id,
                        immediate: snapshot,
                    },
                    Err(e) => DispatchOutcome::Response(JsonRpcResponse::from_error(id, &e)),
                }
            }
            "tasks/resubscribe" | "tasks/subscribe" => {
                return match self.resolve_task_epoch(pair_id, &req.params) {
                    Ok(info) => DispatchOutcome::StreamTask {
                        conversation_id: info.conversation_id,
                        since_seq: 0,
                    },
                    Err(e) => DispatchOutcome::Response(JsonRpcResponse::from_error(id, &e)),
                }
            }
            other => {
                return DispatchOutcome::Response(JsonRpcResponse::invalid_request(
                    id,
                    format!("unknown method: {other}"),
                ))
            }
        };

        DispatchOutcome::Response(match result {
            Ok((snapshot, _)) => JsonRpcResponse::ok(id, snapshot),
            Err(e) => JsonRpcResponse::from_error(id, &e),
        })
    }

    fn resolve_task_epoch(&self, pair_id: &str, params: &Value) -> Result<EpochInfo> {
        if let Some(task_id_str) = params.get("taskId").and_then(|v| v.as_str()) {
            let (resolved_pair, epoch, _) = self
                .pairs
                .resolve_task(task_id_str)?
                .ok_or_else(|| Error::NotFound(format!("task {task_id_str}")))?;
            if resolved_pair != pair_id {
                return Err(Error::InvalidParams("taskId does not belong to this pair".into()));
            }
            return self
                .pairs
                .get_epoch(pair_id, epoch)?
                .ok_or_else(|| Error::NotFound(format!("epoch {epoch} for pair {pair_id}")));
        }
        self.pairs
            .current(pair_id)?
            .ok_or_else(|| Error::NotFound(format!("pair {pair_id} has no active epoch")))
    }

    /// `message/send`: appends to the current epoch, or starts a fresh one
    /// if `params.message.taskId` is absent or names a closed epoch.
    async fn message_send(
        &self,
        pair_id: &str,
        params: &Value,
        lease_id: Option<uuid::Uuid>,
    ) -> Result<(Value, EpochInfo)> {
        let message = params
            .get("message")
            .ok_or_else(|| Error::InvalidParams("message/send requires `message`".into()))?;

        let task_id_str = message.get("taskId").and_then(|v| v.as_str());
        let wants_fresh_epoch = match task_id_str {
            None => true,
            Some(t) => self
                .pairs
                .resolve_task(t)?
                .map(|(p, e, _)| {
                    p != pair_id
                        || self
                            .pairs
                            .current_epoch(pair_id)
                            .map(|cur| cur != e)
                            .unwrap_or(true)
                })
                .unwrap_or(true),
        };

        let info = if wants_fresh_epoch {
            self.pairs.begin_epoch(&self.orchestrator, pair_id).await?
        } else {
            self.pairs
                .current(pair_id)?
                .ok_or_else(|| Error::NotFound(format!("pair {pair_id} has no active epoch")))?
        };

        // The side posting determines who owns this task id; a message
        // targeting `resp:<pair>#<epoch>` is authored by the responder.
        let author = match task_id_str.and_then(|t| self.pairs.resolve_task(t).ok().flatten()) {
            Some((_, _, author)) => author,
            None => Author::Init,
        };
        self.require_lease_for_responder_write(pair_id, author, lease_id)?;

        let text = extract_text(message);
        let next_state = extract_next_state(message);
        let mut raw = serde_json::Map::new();
        raw.insert("a2a_message".into(), message.clone());
        raw.insert("next_state".into(), json!(next_state.as_task_state()));

        self.orchestrator
            .send_message(
                info.conversation_id,
                None,
                author.agent_id(),
                EventPayload::Message { text, attachments: None, raw },
                next_state.to_finality(),
                None,
            )
            .await?;

        let viewer = author;
        let snapshot = self.project_task(&info, viewer, author.task_id_of(&info))?;
        Ok((snapshot, info))
    }

    fn tasks_get(&self, pair_id: &str, params: &Value) -> Result<(Value, EpochInfo)> {
        let task_id_str = params
            .get("taskId")
            .or_else(|| params.get("id"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::InvalidParams("tasks/get requires `taskId`".into()))?;

        let (resolved_pair, epoch, author) = self
            .pairs
            .resolve_task(task_id_str)?
            .ok_or_else(|| Error::NotFound(format!("task {task_id_str}")))?;
        if resolved_pair != pair_id {
            return Err(Error::InvalidParams("taskId does not belong to this pair".into()));
        }
        let info = self
            .pairs
            .get_epoch(pair_id, epoch)?
            .ok_or_else(|| Error::NotFound(format!("epoch {epoch} for pair {pair_id}")))?;

        let viewer = params
            .get("viewer")
            .and_then(|v| v.as_str())
            .and_then(|s| if s == "resp" { Some(Author::Resp) } else if s == "init" { Some(Author::Init) } else { None })
            .unwrap_or(author);

        let snapshot = self.project_task(&info, viewer, task_id_str.to_string())?;
        Ok((snapshot, info))
    }

    async fn tasks_cancel(
        &self,
        pair_id: &str,
        params: &Value,
        lease_id: Option<uuid::Uuid>,
    ) -> Result<(Value, EpochInfo)> {
        let task_id_str = params
            .get("taskId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::InvalidParams("tasks/cancel requires `taskId`".into()))?;
        let (resolved_pair, epoch, author) = self
            .pairs
            .resolve_task(task_id_str)?
            .ok_or_else(|| Error::NotFound(format!("task {task_id_str}")))?;
        if resolved_pair != pair_id {
            return Err(Error::InvalidParams("taskId does not belong to this pair".into()));
        }
        self.require_lease_for_responder_write(pair_id, author, lease_id)?;

        let info = self
            .pairs
            .get_epoch(pair_id, epoch)?
            .ok_or_else(|| Error::NotFound(format!("epoch {epoch} for pair {pair_id}")))?;

        let mut raw = serde_json::Map::new();
        raw.insert("next_state".into(), json!(NextState::Canceled.as_task_state()));
        self.orchestrator
            .send_message(
                info.conversation_id,
                None,
                author.agent_id(),
                EventPayload::Message { text: None, attachments: None, raw },
                Finality::Conversation,
                None,
            )
            .await?;

        let snapshot = self.project_task(&info, author, task_id_str.to_string())?;
        Ok((snapshot, info))
    }

    /// Builds the A2A task snapshot for `task_id` as seen by `viewer`: own
    /// messages are `role=user`, the counterpart's are `role=agent`.
    pub fn project_task(&self, info: &EpochInfo, viewer: Author, task_id_out: String) -> Result<Value> {
        let snapshot = self.orchestrator.get_conversation_snapshot(info.conversation_id)?;

        let mut history = Vec::new();
        let mut state = NextState::Working;
        for ev in snapshot.events.iter().filter(|e| e.event_type == EventType::Message) {
            let Some(frame) = message_frame(ev, viewer) else { continue };
            history.push(frame);
            if let Some(s) = read_next_state(ev) {
                state = s;
            }
        }

        Ok(json!({
            "id": task_id_out,
            "contextId": info.pair_id,
            "status": { "state": state.as_task_state() },
            "history": history,
            "metadata": { EXT_NAMESPACE: { "epoch": info.epoch } },
        }))
    }
}

impl Author {
    fn task_id_of(self, info: &EpochInfo) -> String {
        task_id(&info.pair_id, info.epoch, self)
    }
}

fn extract_text(message: &Value) -> Option<String> {
    message.get("parts")?.as_array()?.iter().find_map(|p| {
        if p.get("kind").and_then(|k| k.as_str()) == Some("text") {
            p.get("text").and_then(|t| t.as_str()).map(|s| s.to_string())
        } else {
            None
        }
    })
}

fn extract_next_state(message: &Value) -> NextState {
    message
        .pointer(&format!("/metadata/{EXT_NAMESPACE}/nextState"))
        .and_then(|v| v.as_str())
        .and_then(|s| serde_json::from_value::<NextState>(Value::String(s.to_string())).ok())
        .unwrap_or(NextState::Working)
}

fn read_next_state(ev: &Event) -> Option<NextState> {
    let EventPayload::Message { raw, .. } = &ev.payload else { return None };
    raw.get("next_state")
        .and_then(|v| v.as_str())
        .and_then(|s| serde_json::from_value::<NextState>(Value::String(s.to_string())).ok())
}

fn message_frame(ev: &Event, viewer: Author) -> Option<Value> {
    let EventPayload::Message { text, raw, .. } = &ev.payload else { return None };
    let author = Author::from_agent_id(&ev.agent_id)?;
    let role = if author == viewer { "user" } else { "agent" };
    let mut frame = raw
        .get("a2a_message")
        .cloned()
        .unwrap_or_else(|| json!({ "parts": [{ "kind": "text", "text": text.clone().unwrap_or_default() }] }));
    if let Some(obj) = frame.as_object_mut() {
        obj.insert("role".into(), json!(role));
        obj.insert("timestamp".into(), json!(ev.ts.to_rfc3339()));
    }
    Some(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cv_bus::Bus;
    use cv_domain::Config;
    use cv_store::EventStore;
    use std::sync::Arc;

    struct NullAttachments;
    #[async_trait::async_trait]
    impl cv_domain::AttachmentStore for NullAttachments {
        async fn put(&self, _: i64, _: cv_domain::AttachmentMeta, _: Vec<u8>) -> Result<String> {
            unimplemented!()
        }
        async fn get_by_id(&self, _: &str) -> Result<Option<cv_domain::Attachment>> {
            Ok(None)
        }
        async fn get_by_doc_id(&self, _: i64, _: &str) -> Result<Option<cv_domain::Attachment>> {
            Ok(None)
        }
    }

    fn build() -> Bridge {
        let store = Arc::new(EventStore::open_in_memory().unwrap());
        let bus = Arc::new(Bus::new(64));
        let config = Arc::new(Config::default());
        let orchestrator = Arc::new(Orchestrator::new(store.clone(), bus.clone(), config.clone(), Arc::new(NullAttachments)));
        Bridge {
            orchestrator,
            bus,
            pairs: PairStore::new(store),
            leases: LeaseTable::new(config.bridge.lease_ttl_ms),
            config: config.bridge.clone(),
        }
    }

    fn send_params(text: &str, next_state: &str) -> Value {
        json!({
            "message": {
                "parts": [{ "kind": "text", "text": text }],
                "metadata": { EXT_NAMESPACE: { "nextState": next_state } }
            }
        })
    }

    #[tokio::test]
    async fn message_send_without_task_id_begins_a_fresh_epoch() {
        let bridge = build();
        let (snapshot, info) = bridge
            .message_send("room-1", &send_params("hello", "input-required"), None)
            .await
            .unwrap();
        assert_eq!(info.epoch, 1);
        assert_eq!(snapshot["status"]["state"], "input-required");
    }

    #[tokio::test]
    async fn second_send_without_task_id_advances_epoch() {
        let bridge = build();
        bridge
            .message_send("room-1", &send_params("hello", "input-required"), None)
            .await
            .unwrap();
        let (_, info2) = bridge
            .message_send("room-1", &send_params("again", "working"), None)
            .await
            .unwrap();
        assert_eq!(info2.epoch, 2);
    }

    #[tokio::test]
    async fn tasks_get_projects_counterpart_as_agent_role() {
        let bridge = build();
        let (_, info) = bridge
            .message_send("room-1", &send_params("hi", "input-required"), None)
            .await
            .unwrap();

        let (snapshot, _) = bridge
            .tasks_get(
                "room-1",
                &json!({ "taskId": info.resp_task_id, "viewer": "resp" }),
            )
            .unwrap();
        let history = snapshot["history"].as_array().unwrap();
        assert_eq!(history[0]["role"], "agent");
    }

    #[tokio::test]
    async fn tasks_cancel_closes_the_conversation() {
        let bridge = build();
        let (_, info) = bridge
            .message_send("room-1", &send_params("hi", "working"), None)
            .await
            .unwrap();

        let (snapshot, _) = bridge
            .tasks_cancel("room-1", &json!({ "taskId": info.init_task_id }), None)
            .await
            .unwrap();
        assert_eq!(snapshot["status"]["state"], "canceled");

        let conv = bridge.orchestrator.get_conversation_with_metadata(info.conversation_id).unwrap();
        assert_eq!(conv.status, cv_domain::ConversationStatus::Completed);
    }

    #[tokio::test]
    async fn responder_write_without_lease_is_rejected() {
        let bridge = build();
        let (_, info) = bridge
            .message_send("room-1", &send_params("hi", "working"), None)
            .await
            .unwrap();

        let params = json!({
            "message": {
                "taskId": info.resp_task_id,
                "parts": [{ "kind": "text", "text": "reply" }],
                "metadata": { EXT_NAMESPACE: { "nextState": "input-required" } }
            }
        });
        let err = bridge.message_send("room-1", &params, None).await.unwrap_err();
        assert!(matches!(err, Error::BackendNotHeld));
    }
}
