// State machine definitions - validated graphs of states and transitions

//! # State Machines
//!
//! A [`StateMachine`] is the declarative description every activity is bound
//! to. It is loaded from a definition document (JSON, see
//! `resources/state_machines/`), then [`validate`](StateMachine::validate)d:
//! validation rebuilds the lookup indices, binds every transition to its
//! endpoints and derives each state's outgoing transition set.
//!
//! Only a coherent machine may drive execution. A machine is coherent when the
//! initial state exists and every transition resolves both endpoints.
//!
//! ## Rust Learning Notes:
//!
//! ### Index maps instead of references
//! States and transitions live in plain `Vec`s in definition order. The
//! lookup maps store positions into those vectors rather than references, so
//! the machine stays an owned, cloneable value that can be shared behind an
//! `Arc` by every activity bound to it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::activity::Activity;
use super::identity::AgentRef;
use super::state::{State, StateId};
use super::transition::{Transition, TransitionId};
use crate::engine::Directory;
use crate::{LifecycleError, Result};

/// Machine bound to atomic activities without an explicit binding
pub const DEFAULT_MACHINE: &str = "Default";

/// Machine bound to composite activities without an explicit binding
pub const COMPOSITE_MACHINE: &str = "CompositeActivity";

/// Built-in transition of composite machines that enters the sub-workflow
pub const START: TransitionId = TransitionId(0);

/// Built-in transition of composite machines that closes the composite
pub const COMPLETE: TransitionId = TransitionId(1);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateMachine {
    pub name: String,
    #[serde(default)]
    pub version: i32,
    pub initial_state: StateId,
    pub states: Vec<State>,
    pub transitions: Vec<Transition>,

    #[serde(skip)]
    coherent: bool,
    #[serde(skip)]
    state_index: HashMap<StateId, usize>,
    #[serde(skip)]
    transition_index: HashMap<TransitionId, usize>,
}

impl StateMachine {
    pub fn new<S: Into<String>>(name: S, version: i32, initial_state: i32) -> Self {
        StateMachine {
            name: name.into(),
            version,
            initial_state: StateId(initial_state),
            states: Vec::new(),
            transitions: Vec::new(),
            coherent: false,
            state_index: HashMap::new(),
            transition_index: HashMap::new(),
        }
    }

    pub fn with_state(mut self, state: State) -> Self {
        self.states.push(state);
        self.validate();
        self
    }

    pub fn with_transition(mut self, transition: Transition) -> Self {
        self.transitions.push(transition);
        self.validate();
        self
    }

    /// Parse a definition document and validate it
    pub fn from_json(document: &str) -> Result<Self> {
        let mut machine: StateMachine = serde_json::from_str(document)?;
        machine.validate();
        Ok(machine)
    }

    /// Rebuild indices, resolve endpoints and recompute coherence
    ///
    /// Must be re-run whenever states or transitions are replaced wholesale.
    pub fn validate(&mut self) -> bool {
        self.state_index = self
            .states
            .iter()
            .enumerate()
            .map(|(pos, state)| (state.id, pos))
            .collect();
        self.transition_index = self
            .transitions
            .iter()
            .enumerate()
            .map(|(pos, transition)| (transition.id, pos))
            .collect();

        let finished: HashMap<StateId, bool> = self.states.iter().map(|s| (s.id, s.finished)).collect();

        for state in &mut self.states {
            state.possible_transitions.clear();
        }

        let mut coherent = self.state_index.contains_key(&self.initial_state);
        for transition in &mut self.transitions {
            coherent &= transition.resolve_states(&finished);
            if let Some(pos) = self.state_index.get(&transition.origin) {
                self.states[*pos].add_possible_transition(transition.id);
            }
        }

        self.coherent = coherent;
        coherent
    }

    pub fn is_coherent(&self) -> bool {
        self.coherent
    }

    pub fn state(&self, id: StateId) -> Option<&State> {
        self.state_index.get(&id).map(|pos| &self.states[*pos])
    }

    pub fn transition(&self, id: TransitionId) -> Option<&Transition> {
        self.transition_index.get(&id).map(|pos| &self.transitions[*pos])
    }

    pub fn transition_by_name(&self, name: &str) -> Option<&Transition> {
        self.transitions.iter().find(|t| t.name == name)
    }

    pub fn initial_state(&self) -> Result<&State> {
        self.state(self.initial_state).ok_or_else(|| {
            LifecycleError::InvalidData(format!(
                "Initial state {} missing from state machine {} v{}",
                self.initial_state, self.name, self.version
            ))
        })
    }

    /// State the activity is currently in, the initial state before binding
    pub fn current_state(&self, activity: &Activity) -> Result<&State> {
        let id = activity.state.unwrap_or(self.initial_state);
        self.state(id).ok_or_else(|| {
            LifecycleError::InvalidData(format!(
                "Activity {} is in state {} which is not defined in {} v{}",
                activity.name, id, self.name, self.version
            ))
        })
    }

    /// Outgoing transitions of the current state the agent may perform
    ///
    /// Authorization failures exclude the transition silently; any other
    /// error propagates.
    pub fn possible_transitions(&self, activity: &Activity, agent: &AgentRef, directory: &dyn Directory) -> Result<Vec<&Transition>> {
        let current = self.current_state(activity)?;
        let mut possible = Vec::new();
        for id in current.possible_transitions() {
            let Some(transition) = self.transition(*id) else {
                continue;
            };
            match transition.performing_role(activity, agent, directory) {
                Ok(_) => possible.push(transition),
                Err(e) if e.is_access_error() => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(possible)
    }

    /// Check the transition starts from the activity's current state and
    /// return its target
    ///
    /// This never mutates the activity; the caller applies the new state.
    pub fn traverse(&self, activity: &Activity, transition: &Transition, agent: &AgentRef, directory: &dyn Directory) -> Result<&State> {
        let current = self.current_state(activity)?;
        if transition.origin != current.id {
            return Err(LifecycleError::InvalidTransition {
                transition: transition.name.clone(),
                state: current.name.clone(),
            });
        }
        transition.performing_role(activity, agent, directory)?;
        self.state(transition.target).ok_or_else(|| {
            LifecycleError::InvalidData(format!(
                "Transition {} targets unknown state {}",
                transition.name, transition.target
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::InMemoryDirectory;
    use proptest::prelude::*;

    fn review_machine() -> StateMachine {
        StateMachine::new("Review", 0, 0)
            .with_state(State::new(0, "Waiting", false))
            .with_state(State::new(1, "Started", false))
            .with_state(State::new(2, "Finished", true))
            .with_transition(Transition::new(0, "Start", 0, 1))
            .with_transition(Transition::new(1, "Complete", 1, 2))
    }

    #[test]
    fn test_validate_derives_possible_transitions() {
        let machine = review_machine();
        assert!(machine.is_coherent());
        let waiting = machine.state(StateId(0)).unwrap();
        assert_eq!(waiting.possible_transitions(), &[TransitionId(0)]);
        assert!(machine.transition(TransitionId(1)).unwrap().is_finishing());
        assert!(!machine.transition(TransitionId(0)).unwrap().is_finishing());
    }

    #[test]
    fn test_incoherent_endpoints() {
        let machine = review_machine().with_transition(Transition::new(2, "Vanish", 1, 9));
        assert!(!machine.is_coherent());

        let machine = review_machine().with_transition(Transition::new(2, "Appear", 9, 1));
        assert!(!machine.is_coherent());
    }

    #[test]
    fn test_missing_initial_state() {
        let mut machine = review_machine();
        machine.initial_state = StateId(7);
        assert!(!machine.validate());
        assert!(machine.initial_state().unwrap_err().is_data_error());
    }

    #[test]
    fn test_from_json() {
        let machine = StateMachine::from_json(
            r#"{
                "name": "Tiny", "version": 2, "initial_state": 0,
                "states": [{"id": 0, "name": "Open"}, {"id": 1, "name": "Closed", "finished": true}],
                "transitions": [{"id": 0, "name": "Close", "origin": 0, "target": 1, "reservation": "clear"}]
            }"#,
        )
        .unwrap();
        assert!(machine.is_coherent());
        assert_eq!(machine.version, 2);
        assert!(machine.transition_by_name("Close").unwrap().requires_active);
    }

    #[test]
    fn test_possible_transitions_filters_unauthorized() {
        let directory = InMemoryDirectory::new();
        let machine = review_machine()
            .with_transition(Transition::new(3, "Skip", 0, 2).with_enabled_property("Skippable"));
        let mut activity = Activity::new("Review");
        activity.state = Some(StateId(0));
        activity.active = true;

        let agent = AgentRef::new("alice");
        let names: Vec<_> = machine
            .possible_transitions(&activity, &agent, &directory)
            .unwrap()
            .into_iter()
            .map(|t| t.name.as_str())
            .collect();
        assert_eq!(names, vec!["Start"]);

        activity.properties.put("Skippable", true);
        assert_eq!(machine.possible_transitions(&activity, &agent, &directory).unwrap().len(), 2);
    }

    proptest! {
        #[test]
        fn traverse_succeeds_only_from_origin(current in 0i32..3, transition in 0i32..2) {
            let directory = InMemoryDirectory::new();
            let machine = review_machine();
            let mut activity = Activity::new("Review");
            activity.state = Some(StateId(current));
            activity.active = true;
            let before = activity.clone();

            let t = machine.transition(TransitionId(transition)).unwrap();
            let result = machine.traverse(&activity, t, &AgentRef::new("alice"), &directory);

            if t.origin == StateId(current) {
                prop_assert_eq!(result.unwrap().id, t.target);
            } else {
                let is_invalid_transition = matches!(result, Err(LifecycleError::InvalidTransition { .. }));
                prop_assert!(is_invalid_transition);
            }
            prop_assert_eq!(activity.state, before.state);
        }

        #[test]
        fn coherence_tracks_endpoints(origin in 0i32..5, target in 0i32..5) {
            let machine = review_machine().with_transition(Transition::new(9, "Probe", origin, target));
            prop_assert_eq!(machine.is_coherent(), origin < 3 && target < 3);
        }
    }
}
