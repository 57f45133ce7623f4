//! The Turn-Loop Executor: the single-turn driver used
//! by every agent — internal or the external A2A/MCP bridge's proxy — to
//! claim guidance, run one turn, and post events back through the
//! orchestrator.
//!
//! Mirrors a single-turn driver that builds context, calls the strategy,
//! and handles the result, generalized from "one LLM call with tool loop"
//! to "one `Agent::take_turn` call with a deadline and a cancellation
//! token." Uses a reader/writer task split for an "explicit tasks + typed
//! channels" pattern in place of async generators.

mod agent;
mod transport;

pub use agent::{Agent, TurnContext};
pub use transport::Transport;

use std::sync::Arc;

use cv_bus::{Bus, BusEvent, SubscriptionFilter};
use cv_domain::{ConversationStatus, EventType, Finality, SystemKind, TurnRecoveryMode};
use cv_orchestrator::Orchestrator;
use tokio_util::sync::CancellationToken;

pub struct ExecutorConfig {
    pub deadline_floor_ms: u64,
    pub recovery_mode: TurnRecoveryMode,
}

/// One executor instance per `(conversation_id, agent_id)` worker.
pub struct Executor {
    orchestrator: Arc<Orchestrator>,
    bus: Arc<Bus>,
    conversation_id: i64,
    agent_id: String,
    agent: Arc<dyn Agent>,
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        bus: Arc<Bus>,
        conversation_id: i64,
        agent_id: String,
        agent: Arc<dyn Agent>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            orchestrator,
            bus,
            conversation_id,
            agent_id,
            agent,
            config,
        }
    }

    /// Runs until `cancel` is tripped or the conversation closes, cycling
    /// through an IDLE/CLAIM/EXECUTING/ABORTED state machine.
    pub async fn run(&self, cancel: CancellationToken) {
        let filter = SubscriptionFilter {
            types: Some(vec![EventType::Message, EventType::System]),
            agents: None,
        };
        let mut sub = self.bus.subscribe(self.conversation_id, Some(filter), true);

        // Dedup: the last `(turn, seq)` claimed, so a re-emitted identical
        // guidance is
        // not acted on twice (step 7).
        let mut last_claimed: Option<(i64, i64)> = None;

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                ev = sub.receiver.recv() => ev,
            };
            let Some(ev) = received else { break };

            match ev {
                BusEvent::Event(e) if e.finality == Finality::Conversation => break,
                BusEvent::Event(_) | BusEvent::Lagged { .. } => continue,
                BusEvent::Guidance(g) => {
                    if g.next_agent_id != self.agent_id {
                        continue;
                    }
                    let key = (g.turn, g.seq.floor() as i64);
                    if last_claimed == Some(key) {
                        continue;
                    }
                    last_claimed = Some(key);

                    self.claim_and_run_turn(g, cancel.child_token()).await;
                }
            }
        }
    }

    async fn claim_and_run_turn(&self, guidance: cv_domain::Guidance, cancel: CancellationToken) {
        let snapshot = match self.orchestrator.get_conversation_snapshot(self.conversation_id) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(
                    conversation_id = self.conversation_id,
                    agent_id = %self.agent_id,
                    error = %e,
                    "failed to snapshot conversation for turn"
                );
                return;
            }
        };
        if snapshot.status == ConversationStatus::Completed {
            return;
        }

        let effective_ms = guidance.deadline_ms.max(self.config.deadline_floor_ms);
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_millis(effective_ms);

        let ctx = TurnContext {
            snapshot,
            transport: Transport::new(
                self.orchestrator.clone(),
                self.conversation_id,
                self.agent_id.clone(),
            ),
            agent_id: self.agent_id.clone(),
            turn: guidance.turn,
            deadline,
            cancel: cancel.clone(),
        };

        let agent = self.agent.clone();
        let run = async move { agent.take_turn(&ctx).await };

        let outcome = tokio::time::timeout_at(deadline, run).await;
        match outcome {
            Ok(Ok(())) => {
                self.reconcile_after_turn(SystemKind::turn_aborted()).await;
            }
            Ok(Err(e)) => {
                tracing::warn!(
                    conversation_id = self.conversation_id,
                    agent_id = %self.agent_id,
                    error = %e,
                    "agent turn returned an error"
                );
                self.reconcile_after_turn(SystemKind::turn_aborted()).await;
            }
            Err(_elapsed) => {
                cancel.cancel();
                tracing::warn!(
                    conversation_id = self.conversation_id,
                    agent_id = %self.agent_id,
                    turn = guidance.turn,
                    "turn deadline exceeded"
                );
                self.reconcile_after_turn(SystemKind::turn_timeout()).await;
            }
        }
    }

    /// Closes the turn with `kind` if the agent returned/errored/timed out
    /// without posting a turn-closing event itself (steps 4-6).
    /// In `resume` mode the executor re-enters IDLE without forcing
    /// closure, leaving the turn open for a future claim.
    async fn reconcile_after_turn(&self, kind: SystemKind) {
        if self.config.recovery_mode == TurnRecoveryMode::Resume {
            return;
        }
        let snapshot = match self.orchestrator.get_conversation_snapshot(self.conversation_id) {
            Ok(s) => s,
            Err(_) => return,
        };
        if snapshot.status == ConversationStatus::Completed {
            return;
        }
        let still_open_and_ours = snapshot
            .events
            .iter()
            .rev()
            .find(|e| e.is_ownership_bearing())
            .map(|e| e.finality == Finality::None && e.agent_id == self.agent_id)
            .unwrap_or(false);
        if !still_open_and_ours {
            return;
        }
        if let Err(e) = self
            .orchestrator
            .force_close_turn(self.conversation_id, &self.agent_id, kind)
            .await
        {
            tracing::warn!(
                conversation_id = self.conversation_id,
                agent_id = %self.agent_id,
                error = %e,
                "failed to force-close abandoned turn"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cv_domain::{AgentKind, AgentSpec, Config, ConversationConfig, ConversationMeta, EventPayload};
    use cv_store::EventStore;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullAttachments;
    #[async_trait]
    impl cv_domain::AttachmentStore for NullAttachments {
        async fn put(&self, _: i64, _: cv_domain::AttachmentMeta, _: Vec<u8>) -> cv_domain::Result<String> {
            unimplemented!()
        }
        async fn get_by_id(&self, _: &str) -> cv_domain::Result<Option<cv_domain::Attachment>> {
            Ok(None)
        }
        async fn get_by_doc_id(&self, _: i64, _: &str) -> cv_domain::Result<Option<cv_domain::Attachment>> {
            Ok(None)
        }
    }

    fn two_agent_meta(starting: &str) -> ConversationMeta {
        ConversationMeta {
            title: "t".into(),
            scenario_id: None,
            agents: vec![
                AgentSpec { agent_id: "alice".into(), kind: AgentKind::Internal, agent_class: None },
                AgentSpec { agent_id: "bob".into(), kind: AgentKind::Internal, agent_class: None },
            ],
            starting_agent_id: Some(starting.to_string()),
            config: ConversationConfig::default(),
            custom: Value::Null,
        }
    }

    struct ClosesTurnAgent;
    #[async_trait]
    impl Agent for ClosesTurnAgent {
        async fn take_turn(&self, ctx: &TurnContext) -> cv_domain::Result<()> {
            ctx.transport
                .post_message(
                    EventPayload::Message { text: Some("hi".into()), attachments: None, raw: Default::default() },
                    Finality::Turn,
                )
                .await?;
            Ok(())
        }
    }

    struct SilentAgent(Arc<AtomicUsize>);
    #[async_trait]
    impl Agent for SilentAgent {
        async fn take_turn(&self, _ctx: &TurnContext) -> cv_domain::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn agent_that_closes_its_own_turn_is_not_force_closed() {
        let store = Arc::new(EventStore::open_in_memory().unwrap());
        let bus = Arc::new(Bus::new(64));
        let config = Arc::new(Config::default());
        let orchestrator = Arc::new(Orchestrator::new(store, bus.clone(), config, Arc::new(NullAttachments)));
        let cid = orchestrator.create_conversation(two_agent_meta("alice")).await.unwrap();

        let executor = Executor::new(
            orchestrator.clone(),
            bus,
            cid,
            "alice".into(),
            Arc::new(ClosesTurnAgent),
            ExecutorConfig { deadline_floor_ms: 100, recovery_mode: TurnRecoveryMode::Restart },
        );
        let cancel = CancellationToken::new();
        let guidance = orchestrator.get_guidance_snapshot(cid).unwrap().unwrap();
        executor.claim_and_run_turn(guidance, cancel).await;

        let snap = orchestrator.get_conversation_snapshot(cid).unwrap();
        let messages: Vec<_> = snap.events.iter().filter(|e| e.event_type == EventType::Message).collect();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].finality, Finality::Turn);
    }

    #[tokio::test]
    async fn silent_agent_is_force_closed_in_restart_mode() {
        let store = Arc::new(EventStore::open_in_memory().unwrap());
        let bus = Arc::new(Bus::new(64));
        let config = Arc::new(Config::default());
        let orchestrator = Arc::new(Orchestrator::new(store, bus.clone(), config, Arc::new(NullAttachments)));
        let cid = orchestrator.create_conversation(two_agent_meta("alice")).await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let executor = Executor::new(
            orchestrator.clone(),
            bus,
            cid,
            "alice".into(),
            Arc::new(SilentAgent(calls.clone())),
            ExecutorConfig { deadline_floor_ms: 100, recovery_mode: TurnRecoveryMode::Restart },
        );
        let cancel = CancellationToken::new();
        let guidance = orchestrator.get_guidance_snapshot(cid).unwrap().unwrap();
        executor.claim_and_run_turn(guidance, cancel).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let snap = orchestrator.get_conversation_snapshot(cid).unwrap();
        let last = snap.events.last().unwrap();
        assert_eq!(last.event_type, EventType::System);
        assert_eq!(last.finality, Finality::Turn);
    }

    #[tokio::test]
    async fn silent_agent_in_resume_mode_leaves_turn_open() {
        let store = Arc::new(EventStore::open_in_memory().unwrap());
        let bus = Arc::new(Bus::new(64));
        let config = Arc::new(Config::default());
        let orchestrator = Arc::new(Orchestrator::new(store, bus.clone(), config, Arc::new(NullAttachments)));
        let cid = orchestrator.create_conversation(two_agent_meta("alice")).await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let executor = Executor::new(
            orchestrator.clone(),
            bus,
            cid,
            "alice".into(),
            Arc::new(SilentAgent(calls)),
            ExecutorConfig { deadline_floor_ms: 100, recovery_mode: TurnRecoveryMode::Resume },
        );
        let cancel = CancellationToken::new();
        let guidance = orchestrator.get_guidance_snapshot(cid).unwrap().unwrap();
        executor.claim_and_run_turn(guidance, cancel).await;

        let snap = orchestrator.get_conversation_snapshot(cid).unwrap();
        // Only the meta_created event; nothing was force-closed.
        assert_eq!(snap.events.len(), 1);
    }
}
