//! The `Agent` strategy contract: a `take_turn(ctx)` call where `ctx`
//! provides a stable snapshot, a transport handle, a deadline, and identity.
//! The runtime never inspects agent internals.

use async_trait::async_trait;
use cv_domain::Result;
use cv_store::ConversationSnapshot;
use tokio_util::sync::CancellationToken;

use crate::transport::Transport;

/// A stable, point-in-time view of the conversation handed to the agent at
/// turn start — the agent must not reference the live log directly.
pub struct TurnContext {
    pub snapshot: ConversationSnapshot,
    pub transport: Transport,
    pub agent_id: String,
    pub turn: i64,
    pub deadline: tokio::time::Instant,
    pub cancel: CancellationToken,
}

impl TurnContext {
    pub fn time_remaining(&self) -> std::time::Duration {
        self.deadline.saturating_duration_since(tokio::time::Instant::now())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Implemented by every participant strategy — LLM-backed, script-backed,
/// or a thin proxy fronting an external A2A/MCP client. The runtime calls
/// `take_turn` exactly once per claimed turn (step 3).
#[async_trait]
pub trait Agent: Send + Sync {
    async fn take_turn(&self, ctx: &TurnContext) -> Result<()>;
}
