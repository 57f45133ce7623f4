//! A2A `nextState` <-> internal `Finality` mapping. A message's
//! `metadata.<ext>.nextState` is the only place the wire protocol expresses
//! what the internal event log models as `finality` plus turn ownership.

use cv_domain::Finality;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NextState {
    Working,
    InputRequired,
    Completed,
    Canceled,
    Failed,
    Rejected,
    AuthRequired,
}

impl NextState {
    /// `working -> none`; `input-required -> turn` (flips ownership to the
    /// counterpart); the four terminal states -> `conversation`.
    pub fn to_finality(self) -> Finality {
        match self {
            NextState::Working => Finality::None,
            NextState::InputRequired => Finality::Turn,
            NextState::Completed
            | NextState::Canceled
            | NextState::Failed
            | NextState::Rejected
            | NextState::AuthRequired => Finality::Conversation,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.to_finality() == Finality::Conversation
    }

    /// The A2A `TaskState` string carried in `status.state` of a task
    /// snapshot — distinct from `nextState` (an instruction on a message)
    /// but sharing the same vocabulary for everything except `working`,
    /// which becomes `"working"` either way.
    pub fn as_task_state(self) -> &'static str {
        match self {
            NextState::Working => "working",
            NextState::InputRequired => "input-required",
            NextState::Completed => "completed",
            NextState::Canceled => "canceled",
            NextState::Failed => "failed",
            NextState::Rejected => "rejected",
            NextState::AuthRequired => "auth-required",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn working_keeps_turn_open() {
        assert_eq!(NextState::Working.to_finality(), Finality::None);
        assert!(!NextState::Working.is_terminal());
    }

    #[test]
    fn input_required_closes_turn_not_conversation() {
        assert_eq!(NextState::InputRequired.to_finality(), Finality::Turn);
        assert!(!NextState::InputRequired.is_terminal());
    }

    #[test]
    fn terminal_states_close_the_conversation() {
        for s in [
            NextState::Completed,
            NextState::Canceled,
            NextState::Failed,
            NextState::Rejected,
            NextState::AuthRequired,
        ] {
            assert_eq!(s.to_finality(), Finality::Conversation);
            assert!(s.is_terminal());
        }
    }
}
