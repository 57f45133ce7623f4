//! The Conversation Orchestrator: the only writer to
//! the Event Store, enforcing turn/finality invariants and synthesizing
//! guidance. Persists each append under a per-conversation serialization
//! primitive ([`lock::ConversationLocks`]) so invariants are checked and
//! committed atomically with respect to every other writer.

mod guidance;
mod lock;

use std::sync::Arc;

use chrono::Utc;
use cv_bus::{Bus, BusEvent};
use cv_domain::{
    AttachmentStore, Config, Conversation, ConversationFilter, ConversationMeta,
    ConversationStatus, ConversationSummary, Error, Event, EventPayload, EventType, Finality,
    Guidance, Result, SystemKind,
};
use cv_store::{ConversationSnapshot, EventStore};

pub use guidance::compute_guidance;

/// Everything needed to append one event, shared by `sendMessage`,
/// `sendTrace`, and `clearTurn`.
struct AppendRequest<'a> {
    conversation_id: i64,
    agent_id: &'a str,
    event_type: EventType,
    payload: EventPayload,
    finality: Finality,
    turn_hint: Option<i64>,
    client_request_id: Option<&'a str>,
}

/// `(seq, turn, event)` — returned by every append operation (step 9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Receipt {
    pub seq: i64,
    pub turn: i64,
    pub event: i64,
}

pub struct Orchestrator {
    store: Arc<EventStore>,
    bus: Arc<Bus>,
    config: Arc<Config>,
    locks: lock::ConversationLocks,
    attachments: Arc<dyn AttachmentStore>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<EventStore>,
        bus: Arc<Bus>,
        config: Arc<Config>,
        attachments: Arc<dyn AttachmentStore>,
    ) -> Self {
        Self {
            store,
            bus,
            config,
            locks: lock::ConversationLocks::new(),
            attachments,
        }
    }

    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<Bus> {
        &self.bus
    }

    // ── Conversation lifecycle ──────────────────────────────────────

    /// `createConversation(meta) -> conversation_id`. Emits
    /// `system{kind: meta_created}` at `seq=1, turn=1, event=1,
    /// finality=none` (Open Question, resolved: turn 1 not a
    /// pre-turn sentinel).
    pub async fn create_conversation(&self, metadata: ConversationMeta) -> Result<i64> {
        let conversation_id = self.store.create_conversation(&metadata)?;
        let _guard = self.locks.acquire(conversation_id).await;

        let event = self.store.append(
            conversation_id,
            1,
            1,
            EventType::System,
            &EventPayload::System {
                kind: SystemKind::meta_created(),
                raw: Default::default(),
            },
            Finality::None,
            "system",
            Utc::now(),
        )?;
        self.bus
            .publish(conversation_id, BusEvent::Event(event));
        self.emit_guidance(conversation_id).await;
        Ok(conversation_id)
    }

    pub fn get_conversation_with_metadata(&self, conversation_id: i64) -> Result<Conversation> {
        self.store.get_conversation(conversation_id)
    }

    pub fn get_conversation_snapshot(
        &self,
        conversation_id: i64,
    ) -> Result<ConversationSnapshot> {
        self.store.get_conversation_snapshot(conversation_id)
    }

    pub fn list_conversations(
        &self,
        filter: &ConversationFilter,
    ) -> Result<Vec<ConversationSummary>> {
        self.store.list_conversations(filter)
    }

    pub async fn get_attachment_by_doc_id(
        &self,
        conversation_id: i64,
        doc_id: &str,
    ) -> Result<Option<cv_domain::Attachment>> {
        self.attachments.get_by_doc_id(conversation_id, doc_id).await
    }

    // ── Appends ──────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub async fn send_message(
        &self,
        conversation_id: i64,
        turn_hint: Option<i64>,
        agent_id: &str,
        payload: EventPayload,
        finality: Finality,
        client_request_id: Option<&str>,
    ) -> Result<Receipt> {
        self.append(AppendRequest {
            conversation_id,
            agent_id,
            event_type: EventType::Message,
            payload,
            finality,
            turn_hint,
            client_request_id,
        })
        .await
    }

    pub async fn send_trace(
        &self,
        conversation_id: i64,
        turn_hint: Option<i64>,
        agent_id: &str,
        payload: EventPayload,
        client_request_id: Option<&str>,
    ) -> Result<Receipt> {
        self.append(AppendRequest {
            conversation_id,
            agent_id,
            event_type: EventType::Trace,
            payload,
            finality: Finality::None,
            turn_hint,
            client_request_id,
        })
        .await
    }

    /// `clearTurn(conversation_id, agent_id) -> {turn}`: abort the open
    /// turn owned by `agent_id` by emitting `system{kind: turn_cleared}`
    /// with `finality=turn`. Rejects if no turn is open, or if
    /// the open turn belongs to a different agent — only the owner may
    /// clear their own turn.
    pub async fn clear_turn(&self, conversation_id: i64, agent_id: &str) -> Result<i64> {
        let _guard = self.locks.acquire(conversation_id).await;
        let conversation = self.store.get_conversation(conversation_id)?;
        if conversation.status == ConversationStatus::Completed {
            return Err(Error::ConversationFinalized(conversation_id));
        }

        let last_ownership_bearing = self
            .store
            .get_events_since(conversation_id, 0)?
            .into_iter()
            .rev()
            .find(|e| e.is_ownership_bearing());

        let open_turn = match &last_ownership_bearing {
            Some(e) if e.finality == Finality::None => e,
            _ => {
                return Err(Error::TurnState(format!(
                    "conversation {conversation_id} has no open turn to clear"
                )))
            }
        };
        if open_turn.agent_id != agent_id {
            return Err(Error::TurnState(format!(
                "turn is owned by {}, not {agent_id}",
                open_turn.agent_id
            )));
        }

        let receipt = self
            .append_locked(
                conversation_id,
                AppendRequest {
                    conversation_id,
                    agent_id,
                    event_type: EventType::System,
                    payload: EventPayload::System {
                        kind: SystemKind::turn_cleared(),
                        raw: Default::default(),
                    },
                    finality: Finality::Turn,
                    turn_hint: None,
                    client_request_id: None,
                },
            )
            .await?;
        Ok(receipt.turn)
    }

    /// Force-closes the open turn with a `system{kind}` event on the
    /// executor's behalf (steps 4-6: deadline/error recovery in
    /// `restart` mode). Distinct from `clear_turn` in that it is issued by
    /// the runtime, not requested by the agent, so no ownership match is
    /// enforced beyond `agent_id` matching the turn it force-closes.
    pub async fn force_close_turn(
        &self,
        conversation_id: i64,
        agent_id: &str,
        kind: SystemKind,
    ) -> Result<Receipt> {
        self.append(AppendRequest {
            conversation_id,
            agent_id,
            event_type: EventType::System,
            payload: EventPayload::System {
                kind,
                raw: Default::default(),
            },
            finality: Finality::Turn,
            turn_hint: None,
            client_request_id: None,
        })
        .await
    }

    /// `pokeGuidance`: re-emit current guidance without an append, used
    /// right after starting agents on a conversation with no messages yet
    /// (`ensure`).
    pub async fn poke_guidance(&self, conversation_id: i64) {
        self.emit_guidance(conversation_id).await;
    }

    /// `getGuidanceSnapshot`: recompute guidance from the current log state
    /// without publishing it.
    pub fn get_guidance_snapshot(&self, conversation_id: i64) -> Result<Option<Guidance>> {
        let snapshot = self.store.get_conversation_snapshot(conversation_id)?;
        Ok(compute_guidance(&snapshot, self.config.turn.default_deadline_ms).map(|mut g| {
            g.conversation_id = conversation_id;
            g
        }))
    }

    // ── Internals ────────────────────────────────────────────────────

    async fn append(&self, req: AppendRequest<'_>) -> Result<Receipt> {
        let conversation_id = req.conversation_id;
        let _guard = self.locks.acquire(conversation_id).await;
        self.append_locked(conversation_id, req).await
    }

    /// The append pipeline. Caller must already hold the conversation's
    /// append lock.
    async fn append_locked(&self, conversation_id: i64, req: AppendRequest<'_>) -> Result<Receipt> {
        // Step 1: idempotency check.
        if let Some(key) = req.client_request_id {
            if let Some((seq, turn, event)) = self.store.find_idempotent(conversation_id, key)? {
                return Ok(Receipt { seq, turn, event });
            }
        }

        // Step 2: conversation status check.
        let conversation = self.store.get_conversation(conversation_id)?;
        if conversation.status == ConversationStatus::Completed {
            return Err(Error::ConversationFinalized(conversation_id));
        }

        // Step 4: finality legality (checked before turn assignment since
        // it doesn't depend on log state).
        if req.event_type != EventType::Message && req.finality != Finality::None {
            return Err(Error::BadFinality(format!(
                "{:?} events may not carry finality {:?}",
                req.event_type, req.finality
            )));
        }

        // Step 3: turn assignment.
        let last_ownership_bearing = self
            .store
            .get_events_since(conversation_id, 0)?
            .into_iter()
            .rev()
            .find(|e| e.is_ownership_bearing());

        let (turn, event_no) = match &last_ownership_bearing {
            Some(last) if last.finality == Finality::None => {
                if last.agent_id != req.agent_id {
                    return Err(Error::TurnState(format!(
                        "turn {} is open and owned by {}, not {}",
                        last.turn, last.agent_id, req.agent_id
                    )));
                }
                (last.turn, last.event + 1)
            }
            last => {
                let computed_turn = last.map(|e| e.turn).unwrap_or(0) + 1;
                if let Some(hint) = req.turn_hint {
                    if hint != computed_turn {
                        return Err(Error::TurnHintMismatch(format!(
                            "expected turn {computed_turn}, got hint {hint}"
                        )));
                    }
                }
                (computed_turn, 1)
            }
        };

        // Step 5 + 6: persist, setting conversation status atomically
        // under the same lock if this closes the conversation.
        let ts = Utc::now();
        let event = self.store.append(
            conversation_id,
            turn,
            event_no,
            req.event_type,
            &req.payload,
            req.finality,
            req.agent_id,
            ts,
        )?;
        if req.finality == Finality::Conversation {
            self.store
                .set_conversation_status(conversation_id, ConversationStatus::Completed)?;
        } else {
            self.store.touch_conversation(conversation_id)?;
        }

        if let Some(key) = req.client_request_id {
            self.store
                .record_idempotent(conversation_id, key, event.seq, event.turn, event.event)?;
        }

        // Step 7: publish.
        self.bus
            .publish(conversation_id, BusEvent::Event(event.clone()));

        // Step 8: guidance emission, best-effort .
        self.emit_guidance(conversation_id).await;

        // Step 9.
        Ok(Receipt {
            seq: event.seq,
            turn: event.turn,
            event: event.event,
        })
    }

    async fn emit_guidance(&self, conversation_id: i64) {
        let snapshot = match self.store.get_conversation_snapshot(conversation_id) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(conversation_id, error = %e, "guidance: failed to load snapshot");
                return;
            }
        };
        if let Some(mut guidance) =
            compute_guidance(&snapshot, self.config.turn.default_deadline_ms)
        {
            guidance.conversation_id = conversation_id;
            self.bus
                .publish(conversation_id, BusEvent::Guidance(guidance));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cv_domain::{AgentKind, AgentSpec, ConversationConfig};
    use serde_json::Value;

    struct NullAttachments;

    #[async_trait::async_trait]
    impl AttachmentStore for NullAttachments {
        async fn put(
            &self,
            _conversation_id: i64,
            _meta: cv_domain::AttachmentMeta,
            _bytes: Vec<u8>,
        ) -> Result<String> {
            unimplemented!()
        }
        async fn get_by_id(&self, _id: &str) -> Result<Option<cv_domain::Attachment>> {
            Ok(None)
        }
        async fn get_by_doc_id(
            &self,
            _conversation_id: i64,
            _doc_id: &str,
        ) -> Result<Option<cv_domain::Attachment>> {
            Ok(None)
        }
    }

    fn orchestrator() -> Orchestrator {
        let store = Arc::new(EventStore::open_in_memory().unwrap());
        let bus = Arc::new(Bus::new(64));
        let config = Arc::new(Config::default());
        Orchestrator::new(store, bus, config, Arc::new(NullAttachments))
    }

    fn two_agent_meta(starting: &str) -> ConversationMeta {
        ConversationMeta {
            title: "t".into(),
            scenario_id: None,
            agents: vec![
                AgentSpec {
                    agent_id: "alice".into(),
                    kind: AgentKind::Internal,
                    agent_class: None,
                },
                AgentSpec {
                    agent_id: "bob".into(),
                    kind: AgentKind::Internal,
                    agent_class: None,
                },
            ],
            starting_agent_id: Some(starting.to_string()),
            config: ConversationConfig::default(),
            custom: Value::Null,
        }
    }

    fn text_message(text: &str) -> EventPayload {
        EventPayload::Message {
            text: Some(text.to_string()),
            attachments: None,
            raw: Default::default(),
        }
    }

    #[tokio::test]
    async fn create_conversation_emits_meta_created_at_seq_1() {
        let o = orchestrator();
        let cid = o.create_conversation(two_agent_meta("alice")).await.unwrap();
        let snap = o.get_conversation_snapshot(cid).unwrap();
        assert_eq!(snap.events.len(), 1);
        assert_eq!(snap.events[0].seq, 1);
        assert_eq!(snap.events[0].turn, 1);
        assert_eq!(snap.events[0].event, 1);
        assert_eq!(snap.status, ConversationStatus::Active);
    }

    #[tokio::test]
    async fn alternation_across_four_turns() {
        let o = orchestrator();
        let cid = o.create_conversation(two_agent_meta("alice")).await.unwrap();

        o.send_message(cid, None, "alice", text_message("turn-1"), Finality::Turn, None)
            .await
            .unwrap();
        o.send_message(cid, None, "bob", text_message("turn-2"), Finality::Turn, None)
            .await
            .unwrap();
        o.send_message(cid, None, "alice", text_message("turn-3"), Finality::Turn, None)
            .await
            .unwrap();
        o.send_message(cid, None, "bob", text_message("turn-4"), Finality::Turn, None)
            .await
            .unwrap();

        let snap = o.get_conversation_snapshot(cid).unwrap();
        let owners: Vec<&str> = snap
            .events
            .iter()
            .filter(|e| e.event_type == EventType::Message)
            .map(|e| e.agent_id.as_str())
            .collect();
        assert_eq!(owners, vec!["alice", "bob", "alice", "bob"]);
        assert!(snap.events.len() >= 5);
    }

    #[tokio::test]
    async fn idempotent_retry_returns_same_receipt_and_appends_once() {
        let o = orchestrator();
        let cid = o.create_conversation(two_agent_meta("alice")).await.unwrap();

        let r1 = o
            .send_message(
                cid,
                None,
                "alice",
                text_message("hi"),
                Finality::Turn,
                Some("R1"),
            )
            .await
            .unwrap();
        let r2 = o
            .send_message(
                cid,
                None,
                "alice",
                text_message("hi-different-payload-ignored"),
                Finality::Turn,
                Some("R1"),
            )
            .await
            .unwrap();
        assert_eq!(r1, r2);

        let snap = o.get_conversation_snapshot(cid).unwrap();
        let message_events: Vec<_> = snap
            .events
            .iter()
            .filter(|e| e.event_type == EventType::Message)
            .collect();
        assert_eq!(message_events.len(), 1);
    }

    #[tokio::test]
    async fn turn_hint_mismatch_is_rejected() {
        let o = orchestrator();
        let cid = o.create_conversation(two_agent_meta("alice")).await.unwrap();
        let err = o
            .send_message(
                cid,
                Some(99),
                "alice",
                text_message("hi"),
                Finality::Turn,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TurnHintMismatch(_)));
    }

    #[tokio::test]
    async fn second_agent_cannot_append_to_open_turn() {
        let o = orchestrator();
        let cid = o.create_conversation(two_agent_meta("alice")).await.unwrap();
        o.send_message(cid, None, "alice", text_message("hi"), Finality::None, None)
            .await
            .unwrap();
        let err = o
            .send_message(cid, None, "bob", text_message("hi"), Finality::Turn, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TurnState(_)));
    }

    #[tokio::test]
    async fn trace_with_finality_turn_is_bad_finality() {
        let o = orchestrator();
        let cid = o.create_conversation(two_agent_meta("alice")).await.unwrap();
        let err = o
            .send_trace(cid, None, "alice", EventPayload::Trace { raw: Default::default() }, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadFinality(_)));
    }

    #[tokio::test]
    async fn conversation_finality_rejects_further_appends() {
        let o = orchestrator();
        let cid = o.create_conversation(two_agent_meta("alice")).await.unwrap();
        o.send_message(cid, None, "alice", text_message("bye"), Finality::Conversation, None)
            .await
            .unwrap();
        let err = o
            .send_message(cid, None, "bob", text_message("too late"), Finality::Turn, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConversationFinalized(_)));
    }

    #[tokio::test]
    async fn clear_turn_requires_the_owner() {
        let o = orchestrator();
        let cid = o.create_conversation(two_agent_meta("alice")).await.unwrap();
        o.send_message(cid, None, "alice", text_message("hi"), Finality::None, None)
            .await
            .unwrap();

        let err = o.clear_turn(cid, "bob").await.unwrap_err();
        assert!(matches!(err, Error::TurnState(_)));

        let turn = o.clear_turn(cid, "alice").await.unwrap();
        assert_eq!(turn, 1);

        let snap = o.get_conversation_snapshot(cid).unwrap();
        let last = snap.events.last().unwrap();
        assert_eq!(last.finality, Finality::Turn);
    }

    #[tokio::test]
    async fn guidance_snapshot_names_starting_agent_before_any_message() {
        let o = orchestrator();
        let cid = o.create_conversation(two_agent_meta("alice")).await.unwrap();
        let g = o.get_guidance_snapshot(cid).unwrap().unwrap();
        assert_eq!(g.next_agent_id, "alice");
        assert_eq!(g.conversation_id, cid);
    }

    #[tokio::test]
    async fn guidance_is_none_after_conversation_completes() {
        let o = orchestrator();
        let cid = o.create_conversation(two_agent_meta("alice")).await.unwrap();
        o.send_message(cid, None, "alice", text_message("bye"), Finality::Conversation, None)
            .await
            .unwrap();
        assert!(o.get_guidance_snapshot(cid).unwrap().is_none());
    }
}
