//! `ctx.transport`: the only way an agent strategy may append to the log.
//! Wraps the orchestrator so an agent can never bypass the append
//! pipeline's invariants.

use std::sync::Arc;

use cv_domain::{EventPayload, Finality, Result};
use cv_orchestrator::{Orchestrator, Receipt};

#[derive(Clone)]
pub struct Transport {
    orchestrator: Arc<Orchestrator>,
    conversation_id: i64,
    agent_id: String,
}

impl Transport {
    pub fn new(orchestrator: Arc<Orchestrator>, conversation_id: i64, agent_id: String) -> Self {
        Self {
            orchestrator,
            conversation_id,
            agent_id,
        }
    }

    /// Posts a `message` event. The agent must pass `finality=Turn` or
    /// `Conversation` at least once per turn to end it (step 4).
    pub async fn post_message(&self, payload: EventPayload, finality: Finality) -> Result<Receipt> {
        self.orchestrator
            .send_message(
                self.conversation_id,
                None,
                &self.agent_id,
                payload,
                finality,
                None,
            )
            .await
    }

    /// Posts a `trace` event. Always `finality=none` (Event invariants).
    pub async fn post_trace(&self, payload: EventPayload) -> Result<Receipt> {
        self.orchestrator
            .send_trace(self.conversation_id, None, &self.agent_id, payload, None)
            .await
    }
}
