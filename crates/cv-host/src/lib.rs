//! The Agent Host + Runner Registry: starts, supervises,
//! and stops in-process agent workers per conversation, with crash
//! resumption from the durable registry.
//!
//! Process supervision: spawn a task per sub-agent, hold a cancellation
//! handle, deduplicate concurrent starts. `list` falls back to the
//! live-connection table during a startup race: if none alive but rows
//! exist in the registry, it returns the registered intent.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use cv_bus::{Bus, BusEvent};
use cv_domain::{AgentSpec, Config, Finality, Result};
use cv_executor::{Agent, Executor, ExecutorConfig};
use cv_orchestrator::Orchestrator;
use cv_store::EventStore;
use parking_lot::Mutex as SyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Instantiates the `Agent` strategy for a given roster entry. The host
/// never inspects agent internals — it only needs something
/// that can build one.
pub trait AgentFactory: Send + Sync {
    fn create(&self, conversation_id: i64, spec: &AgentSpec) -> Arc<dyn Agent>;
}

/// A live worker's supervision handle.
struct Worker {
    cancel: CancellationToken,
    join: JoinHandle<()>,
    agent_class: Option<String>,
}

/// What `list` returns for one agent, whether live or recovered from the
/// registry (`list`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnsuredAgent {
    pub id: String,
    pub class: Option<String>,
}

pub struct AgentHost {
    store: Arc<EventStore>,
    bus: Arc<Bus>,
    orchestrator: Arc<Orchestrator>,
    config: Arc<Config>,
    factory: Arc<dyn AgentFactory>,
    workers: SyncMutex<HashMap<(i64, String), Worker>>,
    /// Conversations currently being `ensure`d, to dedupe concurrent calls.
    inflight: tokio::sync::Mutex<HashSet<i64>>,
}

impl AgentHost {
    pub fn new(
        store: Arc<EventStore>,
        bus: Arc<Bus>,
        orchestrator: Arc<Orchestrator>,
        config: Arc<Config>,
        factory: Arc<dyn AgentFactory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            bus,
            orchestrator,
            config,
            factory,
            workers: SyncMutex::new(HashMap::new()),
            inflight: tokio::sync::Mutex::new(HashSet::new()),
        })
    }

    /// Spawns the background task that auto-stops a conversation's workers
    /// the moment it closes. Call once at startup.
    pub fn spawn_completion_watcher(self: &Arc<Self>) -> JoinHandle<()> {
        let host = self.clone();
        let mut sub = host.bus.subscribe_all(None, false);
        tokio::spawn(async move {
            while let Some(ev) = sub.receiver.recv().await {
                if let BusEvent::Event(e) = ev {
                    if e.finality == Finality::Conversation {
                        host.stop(e.conversation_id, None).await;
                    }
                }
            }
        })
    }

    /// Resumes every conversation that was active with at least one
    /// registry row at last shutdown. Intended to
    /// run to completion before accepting new RPCs; callers that instead
    /// want non-blocking startup can `tokio::spawn` this and rely on
    /// `list`'s registry fallback in the meantime.
    pub async fn resume_from_registry(self: &Arc<Self>) -> Result<()> {
        for (conversation_id, agent_ids) in self.store.list_active_runner_intents()? {
            self.ensure(conversation_id, Some(agent_ids)).await?;
        }
        Ok(())
    }

    /// `ensure(conversation_id, agent_ids?)`: starts workers for the
    /// requested agents, defaulting to every `kind=internal` roster entry.
    pub async fn ensure(&self, conversation_id: i64, agent_ids: Option<Vec<String>>) -> Result<Vec<EnsuredAgent>> {
        let mut guard = self.inflight.lock().await;
        if !guard.insert(conversation_id) {
            // Another `ensure` for this conversation is already running;
            // let it finish and report current state.
            drop(guard);
            return Ok(self.list(conversation_id));
        }
        drop(guard);

        let result = self.ensure_inner(conversation_id, agent_ids).await;
        self.inflight.lock().await.remove(&conversation_id);
        result
    }

    async fn ensure_inner(&self, conversation_id: i64, agent_ids: Option<Vec<String>>) -> Result<Vec<EnsuredAgent>> {
        let conversation = self.orchestrator.get_conversation_with_metadata(conversation_id)?;
        let wanted: Vec<&AgentSpec> = match &agent_ids {
            Some(ids) => conversation
                .metadata
                .agents
                .iter()
                .filter(|a| ids.contains(&a.agent_id))
                .collect(),
            None => conversation
                .metadata
                .agents
                .iter()
                .filter(|a| a.kind == cv_domain::AgentKind::Internal)
                .collect(),
        };

        for spec in &wanted {
            self.start_one(conversation_id, spec);
            self.store.register_runner(conversation_id, &spec.agent_id)?;
        }

        if !wanted.is_empty() {
            self.orchestrator.poke_guidance(conversation_id).await;
        }
        Ok(self.list(conversation_id))
    }

    fn start_one(&self, conversation_id: i64, spec: &AgentSpec) {
        let key = (conversation_id, spec.agent_id.clone());
        if self.workers.lock().contains_key(&key) {
            return; // already running
        }

        let agent = self.factory.create(conversation_id, spec);
        let executor = Executor::new(
            self.orchestrator.clone(),
            self.bus.clone(),
            conversation_id,
            spec.agent_id.clone(),
            agent,
            ExecutorConfig {
                deadline_floor_ms: self.config.turn.deadline_floor_ms,
                recovery_mode: self.config.turn.recovery_mode,
            },
        );
        let cancel = CancellationToken::new();
        let cancel_for_task = cancel.clone();
        let join = tokio::spawn(async move {
            executor.run(cancel_for_task).await;
        });

        self.workers.lock().insert(
            key,
            Worker {
                cancel,
                join,
                agent_class: spec.agent_class.clone(),
            },
        );
    }

    /// `list(conversation_id) -> [{id, class?}]`: live workers,
    /// or the registered intent if none are alive (startup race).
    pub fn list(&self, conversation_id: i64) -> Vec<EnsuredAgent> {
        let live: Vec<EnsuredAgent> = self
            .workers
            .lock()
            .iter()
            .filter(|((cid, _), _)| *cid == conversation_id)
            .map(|((_, agent_id), worker)| EnsuredAgent {
                id: agent_id.clone(),
                class: worker.agent_class.clone(),
            })
            .collect();
        if !live.is_empty() {
            return live;
        }
        self.store
            .list_runners(conversation_id)
            .unwrap_or_default()
            .into_iter()
            .map(|id| EnsuredAgent { id, class: None })
            .collect()
    }

    /// `stop(conversation_id, agent_ids?)`: stops named workers (default
    /// all), removing their registry rows. Cancellation is cooperative —
    /// `cancel()` trips the token; the worker's current in-flight post
    /// finishes before its task observes cancellation and exits.
    pub async fn stop(&self, conversation_id: i64, agent_ids: Option<Vec<String>>) {
        let removed: Vec<(String, Worker)> = {
            let mut workers = self.workers.lock();
            let keys: Vec<(i64, String)> = workers
                .keys()
                .filter(|(cid, agent_id)| {
                    *cid == conversation_id
                        && agent_ids.as_ref().map(|ids| ids.contains(agent_id)).unwrap_or(true)
                })
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|k| workers.remove(&k).map(|w| (k.1, w)))
                .collect()
        };

        for (agent_id, worker) in removed {
            worker.cancel.cancel();
            let _ = worker.join.await;
            if let Err(e) = self.store.deregister_runner(conversation_id, &agent_id) {
                tracing::warn!(conversation_id, agent_id, error = %e, "failed to deregister runner");
            }
        }
    }

    /// `stopAll()`: used at process shutdown.
    pub async fn stop_all(&self) {
        let conversation_ids: HashSet<i64> = self.workers.lock().keys().map(|(cid, _)| *cid).collect();
        for cid in conversation_ids {
            self.stop(cid, None).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cv_domain::{AgentKind, ConversationConfig, ConversationMeta, EventPayload};
    use serde_json::Value;

    struct NullAttachments;
    #[async_trait]
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

    struct EchoAgent;
    #[async_trait]
    impl Agent for EchoAgent {
        async fn take_turn(&self, ctx: &cv_executor::TurnContext) -> Result<()> {
            ctx.transport
                .post_message(
                    EventPayload::Message { text: Some("ok".into()), attachments: None, raw: Default::default() },
                    Finality::Turn,
                )
                .await?;
            Ok(())
        }
    }

    struct EchoFactory;
    impl AgentFactory for EchoFactory {
        fn create(&self, _conversation_id: i64, _spec: &AgentSpec) -> Arc<dyn Agent> {
            Arc::new(EchoAgent)
        }
    }

    fn meta(starting: &str) -> ConversationMeta {
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

    fn build() -> (Arc<Orchestrator>, Arc<AgentHost>) {
        let store = Arc::new(EventStore::open_in_memory().unwrap());
        let bus = Arc::new(Bus::new(64));
        let config = Arc::new(Config::default());
        let orchestrator = Arc::new(Orchestrator::new(store.clone(), bus.clone(), config.clone(), Arc::new(NullAttachments)));
        let host = AgentHost::new(store, bus, orchestrator.clone(), config, Arc::new(EchoFactory));
        (orchestrator, host)
    }

    #[tokio::test]
    async fn ensure_starts_internal_agents_and_registers_them() {
        let (orchestrator, host) = build();
        let cid = orchestrator.create_conversation(meta("alice")).await.unwrap();

        let ensured = host.ensure(cid, None).await.unwrap();
        assert_eq!(ensured.len(), 2);

        let listed = host.list(cid);
        assert_eq!(listed.len(), 2);
    }

    #[tokio::test]
    async fn stop_deregisters_and_list_falls_back_to_empty() {
        let (orchestrator, host) = build();
        let cid = orchestrator.create_conversation(meta("alice")).await.unwrap();
        host.ensure(cid, None).await.unwrap();

        host.stop(cid, None).await;
        assert!(host.list(cid).is_empty());
    }

    #[tokio::test]
    async fn completion_watcher_stops_workers_when_conversation_closes() {
        let (orchestrator, host) = build();
        let cid = orchestrator.create_conversation(meta("alice")).await.unwrap();
        host.ensure(cid, None).await.unwrap();
        let watcher = host.spawn_completion_watcher();

        orchestrator
            .send_message(
                cid,
                None,
                "alice",
                EventPayload::Message { text: Some("bye".into()), attachments: None, raw: Default::default() },
                Finality::Conversation,
                None,
            )
            .await
            .unwrap();

        // Give the watcher a chance to observe and react.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(host.list(cid).is_empty());
        watcher.abort();
    }
}
