//! The application state every handler is built against: one
//! `#[derive(Clone)]` struct of `Arc`'d services, cheap to clone per
//! request, constructed once in `bootstrap`.

use std::sync::Arc;

use cv_bridge::Bridge;
use cv_collab::LlmProvider;
use cv_domain::{AttachmentStore, Config, ScenarioStore};
use cv_host::AgentHost;
use cv_orchestrator::Orchestrator;
use cv_store::EventStore;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<EventStore>,
    pub orchestrator: Arc<Orchestrator>,
    pub host: Arc<AgentHost>,
    pub bridge: Arc<Bridge>,
    pub llm: Arc<dyn LlmProvider>,
    pub attachments: Arc<dyn AttachmentStore>,
    pub scenarios: Arc<dyn ScenarioStore>,
    /// `None` in dev mode (no `CV_API_TOKEN` set) — see `api::auth`.
    pub api_token_hash: Option<Vec<u8>>,
    /// `None` disables the scenario-edit-token guard entirely.
    pub edit_token_hash: Option<Vec<u8>>,
}
