//! The `Conversation` entity and its metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Active,
    Completed,
}

impl ConversationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ConversationStatus::Active => "active",
            ConversationStatus::Completed => "completed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(ConversationStatus::Active),
            "completed" => Some(ConversationStatus::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Internal,
    External,
}

/// One participant in a conversation's roster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub agent_id: String,
    pub kind: AgentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_class: Option<String>,
}

/// The turn-assignment policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulePolicy {
    RoundRobin,
    StrictAlternation,
}

impl Default for SchedulePolicy {
    fn default() -> Self {
        SchedulePolicy::RoundRobin
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationConfig {
    #[serde(default)]
    pub policy: SchedulePolicy,
    /// Overrides the default 30s turn deadline, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_turn_ms: Option<u64>,
}

/// Conversation-level metadata, set at creation and mutated only by
/// `updated_at` bumps on append.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMeta {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario_id: Option<String>,
    pub agents: Vec<AgentSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starting_agent_id: Option<String>,
    #[serde(default)]
    pub config: ConversationConfig,
    #[serde(default)]
    pub custom: Value,
}

impl ConversationMeta {
    /// The next agent after `current` in roster order, wrapping around.
    /// Returns `None` for an empty or single-member roster with no other
    /// candidate.
    pub fn round_robin_next(&self, current: &str) -> Option<String> {
        if self.agents.is_empty() {
            return None;
        }
        let idx = self.agents.iter().position(|a| a.agent_id == current);
        let next_idx = match idx {
            Some(i) => (i + 1) % self.agents.len(),
            None => 0,
        };
        self.agents.get(next_idx).map(|a| a.agent_id.clone())
    }

    /// `strict-alternation`'s counterpart lookup; requires exactly two
    /// agents
    pub fn alternation_other(&self, current: &str) -> Option<String> {
        if self.agents.len() != 2 {
            return None;
        }
        self.agents
            .iter()
            .map(|a| &a.agent_id)
            .find(|id| id.as_str() != current)
            .cloned()
    }

    pub fn contains_agent(&self, agent_id: &str) -> bool {
        self.agents.iter().any(|a| a.agent_id == agent_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub conversation_id: i64,
    pub status: ConversationStatus,
    pub metadata: ConversationMeta,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lightweight listing row for `GET /api/conversations`.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummary {
    pub conversation_id: i64,
    pub title: String,
    pub status: ConversationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scenario_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct ConversationFilter {
    pub status: Option<ConversationStatus>,
    pub scenario_id: Option<String>,
    /// Only conversations updated within the last N hours.
    pub hours: Option<i64>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(ids: &[&str]) -> ConversationMeta {
        ConversationMeta {
            title: "t".into(),
            scenario_id: None,
            agents: ids
                .iter()
                .map(|id| AgentSpec {
                    agent_id: id.to_string(),
                    kind: AgentKind::Internal,
                    agent_class: None,
                })
                .collect(),
            starting_agent_id: None,
            config: ConversationConfig::default(),
            custom: Value::Null,
        }
    }

    #[test]
    fn round_robin_wraps() {
        let m = meta(&["alice", "bob", "carol"]);
        assert_eq!(m.round_robin_next("alice").as_deref(), Some("bob"));
        assert_eq!(m.round_robin_next("carol").as_deref(), Some("alice"));
    }

    #[test]
    fn round_robin_unknown_agent_starts_over() {
        let m = meta(&["alice", "bob"]);
        assert_eq!(m.round_robin_next("ghost").as_deref(), Some("alice"));
    }

    #[test]
    fn alternation_requires_exactly_two() {
        let pair = meta(&["alice", "bob"]);
        assert_eq!(pair.alternation_other("alice").as_deref(), Some("bob"));

        let trio = meta(&["alice", "bob", "carol"]);
        assert_eq!(trio.alternation_other("alice"), None);
    }
}
