//! Wires the concrete services behind `AppState` by hand before the router
//! is built: one `EventStore`, one `Bus`, the `Orchestrator`/`AgentHost`/
//! `Bridge` triangle wired around them, and the token hashes read once from
//! the environment.

use std::sync::Arc;

use cv_bridge::{Bridge, LeaseTable, PairStore};
use cv_bus::Bus;
use cv_collab::{EchoProvider, LlmProvider, ScriptedProvider, SqliteAttachmentStore, SqliteScenarioStore};
use cv_domain::Config;
use cv_host::AgentHost;
use cv_orchestrator::Orchestrator;
use cv_store::EventStore;
use sha2::{Digest, Sha256};

use crate::llm_agent::DefaultAgentFactory;
use crate::state::AppState;

/// Reads `CV_LLM_PROVIDER` to pick a collaborator: `echo` (default, no
/// config needed) or `scripted` (reads newline-separated replies from
/// `CV_LLM_SCRIPTED_REPLIES`, for deterministic demos/tests). A real
/// network-backed provider is a registry entry away but out of scope —
/// nothing here needs one to exercise the full turn loop.
fn build_llm_provider() -> Arc<dyn LlmProvider> {
    match std::env::var("CV_LLM_PROVIDER").as_deref() {
        Ok("scripted") => {
            let replies = std::env::var("CV_LLM_SCRIPTED_REPLIES")
                .unwrap_or_default()
                .lines()
                .map(str::to_string)
                .filter(|l| !l.is_empty())
                .collect();
            Arc::new(ScriptedProvider::new(replies))
        }
        _ => Arc::new(EchoProvider),
    }
}

/// SHA-256 of the env var named `env_var`, or `None` if it's unset/empty
/// (dev mode — see `api::auth`).
fn token_hash(env_var: &str) -> Option<Vec<u8>> {
    let value = std::env::var(env_var).ok().filter(|v| !v.is_empty())?;
    Some(Sha256::digest(value.as_bytes()).to_vec())
}

pub struct Bootstrapped {
    pub state: AppState,
}

pub fn build(config: Arc<Config>) -> anyhow::Result<Bootstrapped> {
    let store = Arc::new(EventStore::open(&config.store.db_path)?);
    let bus = Arc::new(Bus::new(config.bus.subscriber_queue_depth));
    let attachments: Arc<dyn cv_domain::AttachmentStore> = Arc::new(SqliteAttachmentStore::new(store.clone()));
    let scenarios: Arc<dyn cv_domain::ScenarioStore> = Arc::new(SqliteScenarioStore::new(store.clone()));
    let orchestrator = Arc::new(Orchestrator::new(store.clone(), bus.clone(), config.clone(), attachments.clone()));

    let llm = build_llm_provider();
    let factory = Arc::new(DefaultAgentFactory::new(llm.clone()));
    let host = AgentHost::new(store.clone(), bus.clone(), orchestrator.clone(), config.clone(), factory);

    let bridge = Arc::new(Bridge {
        orchestrator: orchestrator.clone(),
        bus: bus.clone(),
        pairs: PairStore::new(store.clone()),
        leases: LeaseTable::new(config.bridge.lease_ttl_ms),
        config: config.bridge.clone(),
    });

    let api_token_hash = token_hash(&config.server.api_token_env);
    if api_token_hash.is_none() {
        tracing::warn!(
            env_var = %config.server.api_token_env,
            "no API token configured — /api/* is unauthenticated (dev mode)"
        );
    }
    let edit_token_hash = token_hash("CV_EDIT_TOKEN");

    Ok(Bootstrapped {
        state: AppState {
            config,
            store,
            orchestrator,
            host,
            bridge,
            llm,
            attachments,
            scenarios,
            api_token_hash,
            edit_token_hash,
        },
    })
}
