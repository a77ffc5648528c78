// Workflow states - the named conditions of a state machine

//! # States
//!
//! A [`State`] is one named condition an activity can be in. States are
//! identified by a small integer code that is stable across versions of a
//! state machine definition, so persisted activities only need to remember
//! the code.
//!
//! A state knows which transitions leave it. That set is not part of the
//! definition document: it is rebuilt by [`StateMachine::validate`] from the
//! transitions' origin codes, so it always equals "every transition whose
//! origin is this state".
//!
//! [`StateMachine::validate`]: super::state_machine::StateMachine::validate

use serde::{Deserialize, Serialize};
use std::fmt;

use super::transition::TransitionId;

/// Integer code of a state inside one state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateId(pub i32);

impl StateId {
    pub fn new(code: i32) -> Self {
        StateId(code)
    }

    pub fn code(&self) -> i32 {
        self.0
    }
}

impl From<i32> for StateId {
    fn from(code: i32) -> Self {
        StateId(code)
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One named condition of a state machine
///
/// `finished` marks a finishing state: reaching it makes the owning activity
/// cascade to its successor (see `Workflow::run_next`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    pub id: StateId,
    pub name: String,

    #[serde(default)]
    pub finished: bool,

    /// Outgoing transitions, derived at validation time
    #[serde(skip)]
    pub(crate) possible_transitions: Vec<TransitionId>,
}

impl State {
    pub fn new<S: Into<String>>(id: i32, name: S, finished: bool) -> Self {
        State {
            id: StateId(id),
            name: name.into(),
            finished,
            possible_transitions: Vec::new(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Ids of the transitions whose origin is this state, in definition order
    pub fn possible_transitions(&self) -> &[TransitionId] {
        &self.possible_transitions
    }

    pub(crate) fn add_possible_transition(&mut self, transition: TransitionId) {
        if !self.possible_transitions.contains(&transition) {
            self.possible_transitions.push(transition);
        }
    }
}

impl PartialEq for State {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for State {}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_identity_is_by_code() {
        let a = State::new(1, "Started", false);
        let b = State::new(1, "Renamed", true);
        assert_eq!(a, b);
        assert_ne!(a, State::new(2, "Started", false));
    }

    #[test]
    fn test_possible_transitions_are_deduplicated() {
        let mut state = State::new(0, "Waiting", false);
        state.add_possible_transition(TransitionId(3));
        state.add_possible_transition(TransitionId(3));
        state.add_possible_transition(TransitionId(1));
        assert_eq!(state.possible_transitions(), &[TransitionId(3), TransitionId(1)]);
    }
}
