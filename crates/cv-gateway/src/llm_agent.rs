//! The one built-in `Agent`: a turn strategy that hands the stable snapshot
//! to an `LlmProvider` and posts back whatever it returns, closing its own
//! turn. Every internal-kind roster entry gets one of these unless a
//! conversation names a different `agent_class` the host knows how to
//! build instead (none exist yet — this is the only internal strategy in
//! the repo).

use std::sync::Arc;

use async_trait::async_trait;
use cv_collab::{CompletionMessage, CompletionRequest, LlmProvider};
use cv_domain::{AgentSpec, Error, EventPayload, EventType, Finality, Result};
use cv_executor::{Agent, TurnContext};
use cv_host::AgentFactory;

pub struct LlmAgent {
    llm: Arc<dyn LlmProvider>,
}

impl LlmAgent {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Agent for LlmAgent {
    async fn take_turn(&self, ctx: &TurnContext) -> Result<()> {
        let messages: Vec<CompletionMessage> = ctx
            .snapshot
            .events
            .iter()
            .filter(|e| e.event_type == EventType::Message)
            .filter_map(|e| {
                let EventPayload::Message { text, .. } = &e.payload else { return None };
                let content = text.clone()?;
                let role = if e.agent_id == ctx.agent_id { "assistant" } else { "user" };
                Some(CompletionMessage { role: role.into(), content })
            })
            .collect();

        let response = self
            .llm
            .complete(CompletionRequest { messages, ..Default::default() })
            .await
            .map_err(|e| Error::Provider(e.to_string()))?;

        ctx.transport
            .post_message(
                EventPayload::Message {
                    text: Some(response.content),
                    attachments: None,
                    raw: Default::default(),
                },
                Finality::Turn,
            )
            .await?;
        Ok(())
    }
}

/// Every conversation's internal agents are `LlmAgent`s sharing the one
/// configured provider — there is no per-agent-class strategy registry
/// yet, since nothing here needs more than one internal strategy.
pub struct DefaultAgentFactory {
    llm: Arc<dyn LlmProvider>,
}

impl DefaultAgentFactory {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }
}

impl AgentFactory for DefaultAgentFactory {
    fn create(&self, _conversation_id: i64, _spec: &AgentSpec) -> Arc<dyn Agent> {
        Arc::new(LlmAgent::new(self.llm.clone()))
    }
}
