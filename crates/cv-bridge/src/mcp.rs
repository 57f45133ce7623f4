//! The three MCP tools, built directly on top of the pair/epoch model in
//! [`crate::pair`] and the same append path [`crate::a2a::Bridge`] uses for
//! A2A. `check_replies`'s bounded wait reuses the conversation's own bus
//! channel as the "per-pair condition variable" — a new event on that
//! channel is exactly the signal a waiting call needs, so there is no
//! separate notify structure to keep in sync with the event log.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use cv_bus::BusEvent;
use cv_domain::{Error, EventPayload, EventType, Result};
use serde_json::{json, Value};

use crate::a2a::Bridge;
use crate::finality::NextState;
use crate::pair::Author;

pub struct BeginChatThreadResult {
    pub conversation_id: String,
}

impl Bridge {
    /// `begin_chat_thread() -> {conversationId}`. Always starts a fresh
    /// epoch, mirroring the A2A rule that an MCP-initiated thread never
    /// resumes a closed one.
    pub async fn begin_chat_thread(&self, pair_id: &str) -> Result<BeginChatThreadResult> {
        let info = self.pairs.begin_epoch(&self.orchestrator, pair_id).await?;
        Ok(BeginChatThreadResult {
            conversation_id: info.epoch.to_string(),
        })
    }

    /// `send_message_to_chat_thread({conversationId, message, attachments?})
    /// -> {guidance, status}`. Appends as the initiator; validates the
    /// named epoch is the pair's current one.
    pub async fn send_message_to_chat_thread(
        &self,
        pair_id: &str,
        conversation_id: &str,
        message: &str,
        attachments: &[(String, String, Vec<u8>)],
    ) -> Result<Value> {
        let epoch: i64 = conversation_id
            .parse()
            .map_err(|_| Error::InvalidParams(format!("conversationId must be numeric, got {conversation_id}")))?;
        let current = self
            .pairs
            .current_epoch(pair_id)?;
        if current != epoch {
            return Err(Error::InvalidParams(format!(
                "conversationId {conversation_id} is not the current epoch ({current}) for pair {pair_id}"
            )));
        }
        let info = self
            .pairs
            .get_epoch(pair_id, epoch)?
            .ok_or_else(|| Error::NotFound(format!("epoch {epoch} for pair {pair_id}")))?;

        let mut raw = serde_json::Map::new();
        raw.insert("next_state".into(), json!(NextState::InputRequired.as_task_state()));
        if !attachments.is_empty() {
            let parts: Vec<Value> = attachments
                .iter()
                .map(|(name, content_type, bytes)| {
                    json!({
                        "kind": "file",
                        "file": {
                            "name": name,
                            "mimeType": content_type,
                            "bytes": STANDARD.encode(bytes),
                        }
                    })
                })
                .collect();
            raw.insert("attachments".into(), json!(parts));
        }

        let receipt = self
            .orchestrator
            .send_message(
                info.conversation_id,
                None,
                Author::Init.agent_id(),
                EventPayload::Message {
                    text: Some(message.to_string()),
                    attachments: None,
                    raw,
                },
                NextState::InputRequired.to_finality(),
                None,
            )
            .await?;

        Ok(json!({
            "guidance": { "nextAgentId": Author::Resp.agent_id(), "turn": receipt.turn },
            "status": NextState::InputRequired.as_task_state(),
        }))
    }

    /// `check_replies({conversationId, waitMs}) -> {messages, status,
    /// conversation_ended}`. Clamps `waitMs` to `[0, 120_000]` (default
    /// 10_000 for non-finite input), returns immediately if the projected
    /// state is already terminal or `input-required`, otherwise waits for
    /// at most one new pair event before re-collecting.
    pub async fn check_replies(
        &self,
        pair_id: &str,
        conversation_id: &str,
        wait_ms: &Value,
    ) -> Result<Value> {
        let wait_ms = extract_wait_ms(wait_ms);
        let epoch: i64 = conversation_id
            .parse()
            .map_err(|_| Error::InvalidParams(format!("conversationId must be numeric, got {conversation_id}")))?;
        let info = self
            .pairs
            .get_epoch(pair_id, epoch)?
            .ok_or_else(|| Error::NotFound(format!("epoch {epoch} for pair {pair_id}")))?;

        let clamped = clamp_wait_ms(wait_ms, self.config.check_replies_min_ms, self.config.check_replies_max_ms, self.config.check_replies_default_ms);

        let (messages, state) = self.collect_since_last_user_message(&info)?;
        if state.is_terminal() || state == NextState::InputRequired {
            return Ok(check_replies_response(messages, state));
        }

        let mut sub = self.bus.subscribe(info.conversation_id, None, false);
        let _ = tokio::time::timeout(std::time::Duration::from_millis(clamped), async {
            while let Some(ev) = sub.receiver.recv().await {
                if matches!(ev, BusEvent::Event(_)) {
                    break;
                }
            }
        })
        .await;

        let (messages, state) = self.collect_since_last_user_message(&info)?;
        Ok(check_replies_response(messages, state))
    }

    fn collect_since_last_user_message(&self, info: &crate::pair::EpochInfo) -> Result<(Vec<Value>, NextState)> {
        let snapshot = self.orchestrator.get_conversation_snapshot(info.conversation_id)?;
        let message_events: Vec<_> = snapshot
            .events
            .iter()
            .filter(|e| e.event_type == EventType::Message)
            .collect();

        let state = message_events
            .last()
            .copied()
            .and_then(read_next_state_from)
            .unwrap_or(NextState::Working);

        let last_user_idx = message_events
            .iter()
            .rposition(|e| e.agent_id == Author::Init.agent_id());
        let window_start = last_user_idx.map(|i| i + 1).unwrap_or(0);

        let messages: Vec<Value> = message_events[window_start..]
            .iter()
            .filter_map(|ev| {
                let EventPayload::Message { text, .. } = &ev.payload else { return None };
                Some(json!({ "from": ev.agent_id, "text": text.clone().unwrap_or_default() }))
            })
            .collect();

        Ok((messages, state))
    }
}

fn read_next_state_from(ev: &cv_domain::Event) -> Option<NextState> {
    let EventPayload::Message { raw, .. } = &ev.payload else { return None };
    raw.get("next_state")
        .and_then(|v| v.as_str())
        .and_then(|s| serde_json::from_value::<NextState>(Value::String(s.to_string())).ok())
}

fn check_replies_response(messages: Vec<Value>, state: NextState) -> Value {
    json!({
        "messages": messages,
        "status": state.as_task_state(),
        "conversation_ended": state.is_terminal(),
    })
}

/// `NaN`/negative/non-finite all fall back to `default_ms`; anything else
/// is clamped into `[min_ms, max_ms]`.
fn clamp_wait_ms(wait_ms: Option<f64>, min_ms: u64, max_ms: u64, default_ms: u64) -> u64 {
    match wait_ms {
        Some(ms) if ms.is_finite() && ms >= 0.0 => {
            (ms as u64).clamp(min_ms, max_ms)
        }
        _ => default_ms,
    }
}

/// Accepts a JSON number, or a string a client sent in place of one
/// (including the literal `"NaN"`, which `str::parse` resolves to `f64::NAN`
/// and which `clamp_wait_ms` then maps to the default).
fn extract_wait_ms(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::LeaseTable;
    use crate::pair::PairStore;
    use cv_bus::Bus;
    use cv_domain::Config;
    use cv_orchestrator::Orchestrator;
    use cv_store::EventStore;
    use std::sync::Arc;

    #[test]
    fn clamp_rejects_negative_and_non_finite() {
        assert_eq!(clamp_wait_ms(Some(-5.0), 0, 120_000, 10_000), 10_000);
        assert_eq!(clamp_wait_ms(Some(f64::NAN), 0, 120_000, 10_000), 10_000);
        assert_eq!(clamp_wait_ms(None, 0, 120_000, 10_000), 10_000);
    }

    #[test]
    fn clamp_caps_at_max() {
        assert_eq!(clamp_wait_ms(Some(10_000_000.0), 0, 120_000, 10_000), 120_000);
    }

    #[test]
    fn clamp_passes_through_in_range_value() {
        assert_eq!(clamp_wait_ms(Some(5_000.0), 0, 120_000, 10_000), 5_000);
    }

    #[test]
    fn extract_wait_ms_parses_nan_string_like_the_number() {
        let from_string = extract_wait_ms(&json!("NaN")).unwrap();
        assert!(from_string.is_nan());
    }

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

    #[tokio::test]
    async fn begin_chat_thread_returns_the_epoch_as_a_string() {
        let bridge = build();
        let result = bridge.begin_chat_thread("room-1").await.unwrap();
        assert_eq!(result.conversation_id, "1");
    }

    #[tokio::test]
    async fn send_message_rejects_stale_conversation_id() {
        let bridge = build();
        bridge.begin_chat_thread("room-1").await.unwrap();
        bridge.begin_chat_thread("room-1").await.unwrap();
        let err = bridge
            .send_message_to_chat_thread("room-1", "1", "hi", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParams(_)));
    }

    #[tokio::test]
    async fn check_replies_returns_immediately_when_awaiting_a_reply() {
        let bridge = build();
        let begun = bridge.begin_chat_thread("room-1").await.unwrap();
        bridge
            .send_message_to_chat_thread("room-1", &begun.conversation_id, "hi", &[])
            .await
            .unwrap();

        let result = bridge
            .check_replies("room-1", &begun.conversation_id, &json!(5_000))
            .await
            .unwrap();
        assert_eq!(result["status"], "input-required");
        assert_eq!(result["conversation_ended"], false);
    }
}
