//! The ephemeral `Guidance` hint — never persisted.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuidanceKind {
    StartTurn,
    ContinueTurn,
}

/// Names the agent expected to act next. Guidance `seq` is a deliberately
/// separate, opaque numbering space from the Event Store's `seq` (/// Open Question) — it is never compared against event sequence numbers,
/// only used as a recency tiebreaker for duplicate suppression.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Guidance {
    pub conversation_id: i64,
    pub next_agent_id: String,
    pub kind: GuidanceKind,
    pub turn: i64,
    pub seq: f64,
    pub deadline_ms: u64,
}
