//! The unified event log record and its payload shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closes the current turn (`Turn`) or the whole conversation (`Conversation`).
/// `None` means the turn stays open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Finality {
    None,
    Turn,
    Conversation,
}

impl Finality {
    pub fn closes_turn(self) -> bool {
        matches!(self, Finality::Turn | Finality::Conversation)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Finality::None => "none",
            Finality::Turn => "turn",
            Finality::Conversation => "conversation",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Finality::None),
            "turn" => Some(Finality::Turn),
            "conversation" => Some(Finality::Conversation),
            _ => None,
        }
    }
}

/// The three event kinds. Only `Message` may carry a non-`None` finality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Message,
    Trace,
    System,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Message => "message",
            EventType::Trace => "trace",
            EventType::System => "system",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "message" => Some(EventType::Message),
            "trace" => Some(EventType::Trace),
            "system" => Some(EventType::System),
            _ => None,
        }
    }
}

/// Tagged payload. Each variant keeps a `raw` escape hatch so fields the
/// core doesn't interpret still round-trip losslessly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    Message {
        text: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attachments: Option<Vec<String>>,
        #[serde(flatten)]
        raw: serde_json::Map<String, Value>,
    },
    Trace {
        #[serde(flatten)]
        raw: serde_json::Map<String, Value>,
    },
    System {
        kind: SystemKind,
        #[serde(flatten)]
        raw: serde_json::Map<String, Value>,
    },
}

/// `system` event sub-kind. Kept as a newtype over `String` rather than a
/// closed enum so unrecognized kinds from a future core version still
/// round-trip losslessly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SystemKind(pub String);

impl SystemKind {
    pub const META_CREATED: &'static str = "meta_created";
    pub const TURN_CLEARED: &'static str = "turn_cleared";
    pub const TURN_ABORTED: &'static str = "turn_aborted";
    pub const TURN_TIMEOUT: &'static str = "turn_timeout";

    pub fn meta_created() -> Self {
        Self(Self::META_CREATED.into())
    }

    pub fn turn_cleared() -> Self {
        Self(Self::TURN_CLEARED.into())
    }

    pub fn turn_aborted() -> Self {
        Self(Self::TURN_ABORTED.into())
    }

    pub fn turn_timeout() -> Self {
        Self(Self::TURN_TIMEOUT.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A single immutable append to a conversation's log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub conversation_id: i64,
    pub seq: i64,
    pub turn: i64,
    pub event: i64,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub payload: EventPayload,
    pub finality: Finality,
    pub agent_id: String,
    pub ts: DateTime<Utc>,
}

impl Event {
    /// `true` for events other than `system` — these are the ones that
    /// determine turn ownership Event invariants.
    pub fn is_ownership_bearing(&self) -> bool {
        self.event_type != EventType::System
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finality_round_trips_through_str() {
        for f in [Finality::None, Finality::Turn, Finality::Conversation] {
            assert_eq!(Finality::from_str(f.as_str()), Some(f));
        }
    }

    #[test]
    fn event_type_round_trips_through_str() {
        for t in [EventType::Message, EventType::Trace, EventType::System] {
            assert_eq!(EventType::from_str(t.as_str()), Some(t));
        }
    }

    #[test]
    fn system_event_is_not_ownership_bearing() {
        let ev = Event {
            conversation_id: 1,
            seq: 1,
            turn: 1,
            event: 1,
            event_type: EventType::System,
            payload: EventPayload::System {
                kind: SystemKind::meta_created(),
                raw: Default::default(),
            },
            finality: Finality::None,
            agent_id: "system".into(),
            ts: Utc::now(),
        };
        assert!(!ev.is_ownership_bearing());
    }
}
