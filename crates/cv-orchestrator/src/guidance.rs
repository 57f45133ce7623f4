//! Guidance policy: given a conversation snapshot, compute
//! the `Guidance` hint naming the next agent expected to act, or `None`
//! when no hint applies.
//!
//! Kept as a pure function of `ConversationSnapshot` (rather than a method
//! that mutates orchestrator state) so both the append pipeline's "emit
//! after commit" path and `getGuidanceSnapshot`'s "recompute for a late
//! subscriber" path share one implementation and can never disagree.

use cv_domain::{
    AgentKind, ConversationStatus, EventType, Finality, Guidance, GuidanceKind, SchedulePolicy,
};
use cv_store::ConversationSnapshot;

/// `deadline_ms = now + default` — the default turn deadline, overridden
/// by `metadata.config.idle_turn_ms`.
pub fn compute_guidance(
    snapshot: &ConversationSnapshot,
    default_deadline_ms: u64,
) -> Option<Guidance> {
    if snapshot.status == ConversationStatus::Completed {
        return None;
    }

    let deadline_ms = snapshot
        .metadata
        .config
        .idle_turn_ms
        .unwrap_or(default_deadline_ms);

    let last_message = snapshot
        .events
        .iter()
        .rev()
        .find(|e| e.event_type == EventType::Message);

    let last_message = match last_message {
        None => {
            // No message events yet: only a configured starting agent can
            // produce a guidance hint.
            let starting = snapshot.metadata.starting_agent_id.as_ref()?;
            if !snapshot.metadata.contains_agent(starting) {
                return None;
            }
            return Some(Guidance {
                conversation_id: 0, // filled in by caller, which knows the id
                next_agent_id: starting.clone(),
                kind: GuidanceKind::StartTurn,
                turn: 1,
                seq: 0.1,
                deadline_ms,
            });
        }
        Some(e) => e,
    };

    match last_message.finality {
        Finality::Conversation => None, // suppressed by the status check above in practice
        Finality::Turn => {
            let next_agent_id = next_agent(snapshot, &last_message.agent_id)?;
            Some(Guidance {
                conversation_id: 0,
                next_agent_id,
                kind: GuidanceKind::StartTurn,
                turn: last_message.turn + 1,
                seq: last_message.seq as f64 + 0.1,
                deadline_ms,
            })
        }
        Finality::None => {
            // The owner of the still-open turn is the latest non-system
            // event's agent_id.
            let owner = snapshot
                .events
                .iter()
                .rev()
                .find(|e| e.is_ownership_bearing())
                .map(|e| e.agent_id.clone())?;
            Some(Guidance {
                conversation_id: 0,
                next_agent_id: owner,
                kind: GuidanceKind::ContinueTurn,
                turn: last_message.turn,
                seq: last_message.seq as f64 + 0.1,
                deadline_ms,
            })
        }
    }
}

/// Schedule-policy dispatch for "who goes after `owner`". `strict-alternation`
/// falls back to round-robin (logged, not rejected) when the roster isn't
/// exactly two agents.
fn next_agent(snapshot: &ConversationSnapshot, owner: &str) -> Option<String> {
    match snapshot.metadata.config.policy {
        SchedulePolicy::RoundRobin => round_robin_skip_external_if_forbidden(snapshot, owner),
        SchedulePolicy::StrictAlternation => {
            if let Some(other) = snapshot.metadata.alternation_other(owner) {
                Some(other)
            } else {
                tracing::warn!(
                    agents = snapshot.metadata.agents.len(),
                    "strict-alternation policy requires exactly two agents; falling back to round-robin"
                );
                snapshot.metadata.round_robin_next(owner)
            }
        }
    }
}

/// Round-robin next, skipping agents whose `kind == external` only when an
/// explicit `starting_agent_id` policy forbids it (not forbidden by
/// default) — there is no such forbidding policy surfaced today, so this
/// is presently equivalent to a plain wraparound; kept as its own function
/// as the seam for that policy if it's ever added.
fn round_robin_skip_external_if_forbidden(
    snapshot: &ConversationSnapshot,
    owner: &str,
) -> Option<String> {
    let _ = AgentKind::External; // seam: would filter snapshot.metadata.agents by kind here
    snapshot.metadata.round_robin_next(owner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use cv_domain::{AgentSpec, ConversationConfig, ConversationMeta, Event, EventPayload};
    use serde_json::Value;

    fn meta(agents: &[&str], starting: Option<&str>, policy: SchedulePolicy) -> ConversationMeta {
        ConversationMeta {
            title: "t".into(),
            scenario_id: None,
            agents: agents
                .iter()
                .map(|id| AgentSpec {
                    agent_id: id.to_string(),
                    kind: AgentKind::Internal,
                    agent_class: None,
                })
                .collect(),
            starting_agent_id: starting.map(|s| s.to_string()),
            config: ConversationConfig {
                policy,
                idle_turn_ms: None,
            },
            custom: Value::Null,
        }
    }

    fn message_event(turn: i64, seq: i64, agent_id: &str, finality: Finality) -> Event {
        Event {
            conversation_id: 1,
            seq,
            turn,
            event: 1,
            event_type: EventType::Message,
            payload: EventPayload::Message {
                text: Some("x".into()),
                attachments: None,
                raw: Default::default(),
            },
            finality,
            agent_id: agent_id.to_string(),
            ts: Utc::now(),
        }
    }

    #[test]
    fn no_messages_and_no_starting_agent_yields_no_guidance() {
        let snap = ConversationSnapshot {
            status: ConversationStatus::Active,
            metadata: meta(&["a", "b"], None, SchedulePolicy::RoundRobin),
            events: vec![],
            last_closed_seq: 0,
        };
        assert!(compute_guidance(&snap, 30_000).is_none());
    }

    #[test]
    fn no_messages_with_starting_agent_yields_start_turn() {
        let snap = ConversationSnapshot {
            status: ConversationStatus::Active,
            metadata: meta(&["a", "b"], Some("a"), SchedulePolicy::RoundRobin),
            events: vec![],
            last_closed_seq: 0,
        };
        let g = compute_guidance(&snap, 30_000).unwrap();
        assert_eq!(g.next_agent_id, "a");
        assert_eq!(g.kind, GuidanceKind::StartTurn);
        assert_eq!(g.turn, 1);
    }

    #[test]
    fn closed_turn_advances_to_round_robin_next() {
        let snap = ConversationSnapshot {
            status: ConversationStatus::Active,
            metadata: meta(&["a", "b"], None, SchedulePolicy::RoundRobin),
            events: vec![message_event(1, 1, "a", Finality::Turn)],
            last_closed_seq: 1,
        };
        let g = compute_guidance(&snap, 30_000).unwrap();
        assert_eq!(g.next_agent_id, "b");
        assert_eq!(g.kind, GuidanceKind::StartTurn);
        assert_eq!(g.turn, 2);
        assert_eq!(g.seq, 1.1);
    }

    #[test]
    fn open_turn_continues_with_current_owner() {
        let snap = ConversationSnapshot {
            status: ConversationStatus::Active,
            metadata: meta(&["a", "b"], None, SchedulePolicy::RoundRobin),
            events: vec![message_event(1, 1, "a", Finality::None)],
            last_closed_seq: 0,
        };
        let g = compute_guidance(&snap, 30_000).unwrap();
        assert_eq!(g.next_agent_id, "a");
        assert_eq!(g.kind, GuidanceKind::ContinueTurn);
    }

    #[test]
    fn completed_conversation_yields_no_guidance() {
        let snap = ConversationSnapshot {
            status: ConversationStatus::Completed,
            metadata: meta(&["a", "b"], None, SchedulePolicy::RoundRobin),
            events: vec![message_event(1, 1, "a", Finality::Conversation)],
            last_closed_seq: 1,
        };
        assert!(compute_guidance(&snap, 30_000).is_none());
    }

    #[test]
    fn strict_alternation_picks_the_other_of_two() {
        let snap = ConversationSnapshot {
            status: ConversationStatus::Active,
            metadata: meta(&["a", "b"], None, SchedulePolicy::StrictAlternation),
            events: vec![message_event(1, 1, "a", Finality::Turn)],
            last_closed_seq: 1,
        };
        let g = compute_guidance(&snap, 30_000).unwrap();
        assert_eq!(g.next_agent_id, "b");
    }

    #[test]
    fn idle_turn_ms_overrides_default_deadline() {
        let mut m = meta(&["a", "b"], Some("a"), SchedulePolicy::RoundRobin);
        m.config.idle_turn_ms = Some(5_000);
        let snap = ConversationSnapshot {
            status: ConversationStatus::Active,
            metadata: m,
            events: vec![],
            last_closed_seq: 0,
        };
        let g = compute_guidance(&snap, 30_000).unwrap();
        assert_eq!(g.deadline_ms, 5_000);
    }
}
