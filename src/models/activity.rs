// Activities - workflow vertices bound to a state machine

//! # Activities
//!
//! An [`Activity`] is one step of an item's workflow. It tracks only:
//!
//! - the current state code of its bound [`StateMachine`]
//! - an orthogonal `active` flag gating whether it accepts requests
//! - a [`Properties`] bag (role, reservation, outcome schema, ...)
//! - the time of the last state change
//!
//! The state machine is resolved lazily from the `StateMachineName` and
//! `StateMachineVersion` properties on first use and cached on the activity.
//! Composite activities wrap an [`Activity`] in a [`CompositeActivity`] and
//! add the designated start vertex of their child graph.
//!
//! Activities never change state by themselves: the graph walker in
//! `engine::execution` applies the result of [`StateMachine::traverse`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::properties::{self, Properties};
use super::state::StateId;
use super::state_machine::{StateMachine, COMPOSITE_MACHINE, DEFAULT_MACHINE};
use super::vertex::VertexId;
use crate::engine::DefinitionLoader;
use crate::{LifecycleError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    pub name: String,

    /// Activity type, used to select registered step logic
    #[serde(default)]
    pub type_name: String,

    #[serde(default)]
    pub properties: Properties,

    /// Current state code; `None` until the machine is first bound
    #[serde(default)]
    pub state: Option<StateId>,

    #[serde(default)]
    pub active: bool,

    pub state_date: DateTime<Utc>,

    /// Machine name used when no `StateMachineName` property is set
    default_machine: String,

    #[serde(skip)]
    machine: Option<Arc<StateMachine>>,
}

impl Activity {
    /// Atomic activity bound to the `Default` machine unless configured
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self::with_default_machine(name, DEFAULT_MACHINE)
    }

    fn with_default_machine<S: Into<String>>(name: S, machine: &str) -> Self {
        let name = name.into();
        Activity {
            type_name: name.clone(),
            name,
            properties: Properties::new(),
            state: None,
            active: false,
            state_date: Utc::now(),
            default_machine: machine.to_string(),
            machine: None,
        }
    }

    pub fn with_type<S: Into<String>>(mut self, type_name: S) -> Self {
        self.type_name = type_name.into();
        self
    }

    pub fn with_property<K: Into<String>, V: Into<serde_json::Value>>(mut self, key: K, value: V) -> Self {
        self.properties.put(key, value);
        self
    }

    pub fn description(&self) -> String {
        self.properties
            .non_empty(properties::DESCRIPTION)
            .unwrap_or_else(|| "No description".to_string())
    }

    /// Name of the bound machine, from properties or the kind's default
    pub fn machine_name(&self) -> String {
        self.properties
            .non_empty(properties::STATE_MACHINE_NAME)
            .unwrap_or_else(|| self.default_machine.clone())
    }

    /// Version of the bound machine; absent means version 0
    pub fn machine_version(&self) -> Result<i32> {
        Ok(self.properties.version_number(properties::STATE_MACHINE_VERSION)?.unwrap_or(0))
    }

    /// Resolve and cache the bound state machine
    ///
    /// On first binding an unset state is moved to the machine's initial
    /// state. Missing or incoherent machines are data errors.
    pub fn state_machine(&mut self, definitions: &dyn DefinitionLoader) -> Result<Arc<StateMachine>> {
        if let Some(machine) = &self.machine {
            return Ok(machine.clone());
        }

        let name = self.machine_name();
        let version = self.machine_version()?;
        let machine = definitions.load_state_machine(&name, version).map_err(|e| match e {
            LifecycleError::ObjectNotFound(msg) => LifecycleError::InvalidData(format!(
                "Could not load state machine {} v{} for activity {}: {}",
                name, version, self.name, msg
            )),
            other => other,
        })?;
        if !machine.is_coherent() {
            return Err(LifecycleError::InvalidData(format!(
                "State machine {} v{} is not coherent",
                name, version
            )));
        }

        if self.state.is_none() {
            self.state = Some(machine.initial_state()?.id);
        }
        self.machine = Some(machine.clone());
        Ok(machine)
    }

    /// Drop the cached machine, e.g. after the binding properties changed
    pub fn unbind_machine(&mut self) {
        self.machine = None;
    }

    pub fn state_name(&mut self, definitions: &dyn DefinitionLoader) -> Result<String> {
        let machine = self.state_machine(definitions)?;
        Ok(machine.current_state(self)?.name.clone())
    }

    pub fn is_finished(&mut self, definitions: &dyn DefinitionLoader) -> Result<bool> {
        let machine = self.state_machine(definitions)?;
        Ok(machine.current_state(self)?.is_finished())
    }

    pub fn set_state(&mut self, state: StateId) {
        self.state = Some(state);
        self.state_date = Utc::now();
    }

    /// Return to the machine's initial state
    pub fn reinit(&mut self, definitions: &dyn DefinitionLoader) -> Result<()> {
        let machine = self.state_machine(definitions)?;
        let initial = machine.initial_state()?.id;
        self.set_state(initial);
        Ok(())
    }

    pub fn is_breakpoint(&self) -> bool {
        self.properties.flag(properties::BREAKPOINT)
    }
}

/// An activity that owns a nested child graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeActivity {
    pub activity: Activity,

    /// Designated entry vertex of the child graph
    #[serde(default)]
    pub start_vertex: Option<VertexId>,
}

impl CompositeActivity {
    /// Composite bound to the `CompositeActivity` machine unless configured
    pub fn new<S: Into<String>>(name: S) -> Self {
        CompositeActivity {
            activity: Activity::with_default_machine(name, COMPOSITE_MACHINE),
            start_vertex: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::InMemoryDefinitions;
    use crate::models::{State, Transition};

    #[test]
    fn test_lazy_binding_sets_initial_state() {
        let definitions = InMemoryDefinitions::with_bootstrap();
        let mut activity = Activity::new("Review");
        assert_eq!(activity.state, None);

        let machine = activity.state_machine(&definitions).unwrap();
        assert_eq!(machine.name, DEFAULT_MACHINE);
        assert_eq!(activity.state, Some(StateId(0)));
        assert_eq!(activity.state_name(&definitions).unwrap(), "Waiting");
        assert!(!activity.is_finished(&definitions).unwrap());
    }

    #[test]
    fn test_composite_default_machine() {
        let definitions = InMemoryDefinitions::with_bootstrap();
        let mut composite = CompositeActivity::new("Stage");
        let machine = composite.activity.state_machine(&definitions).unwrap();
        assert_eq!(machine.name, COMPOSITE_MACHINE);
    }

    #[test]
    fn test_binding_errors_are_data_errors() {
        let definitions = InMemoryDefinitions::with_bootstrap();

        let mut bad_version = Activity::new("Review").with_property(properties::STATE_MACHINE_VERSION, "x");
        assert!(bad_version.state_machine(&definitions).unwrap_err().is_data_error());

        let mut missing = Activity::new("Review").with_property(properties::STATE_MACHINE_NAME, "Nowhere");
        assert!(missing.state_machine(&definitions).unwrap_err().is_data_error());

        let broken = StateMachine::new("Broken", 0, 0)
            .with_state(State::new(0, "Only", false))
            .with_transition(Transition::new(0, "Out", 0, 4));
        definitions.insert_unchecked(broken);
        let mut incoherent = Activity::new("Review").with_property(properties::STATE_MACHINE_NAME, "Broken");
        assert!(incoherent.state_machine(&definitions).unwrap_err().is_data_error());
    }

    #[test]
    fn test_description_default() {
        let activity = Activity::new("Review");
        assert_eq!(activity.description(), "No description");
        let described = activity.with_property(properties::DESCRIPTION, "Peer review");
        assert_eq!(described.description(), "Peer review");
    }
}
