// State machine definition loading

//! # Definition Loader
//!
//! Activities bind to state machines by `(name, version)`. The
//! [`DefinitionLoader`] trait is how the engine obtains those definitions;
//! [`InMemoryDefinitions`] keeps validated machines in a registry and can fall
//! back to the machines packaged with the crate:
//!
//! - `Default` v0, bound to atomic activities
//! - `CompositeActivity` v0, bound to composite activities
//!
//! The fallback only applies to version 0 of those two names and only until
//! a definition with the same key has been registered.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::DefinitionsConfig;
use crate::models::{StateMachine, COMPOSITE_MACHINE, DEFAULT_MACHINE};
use crate::{LifecycleError, Result};

const DEFAULT_DEFINITION: &str = include_str!("../../resources/state_machines/Default.json");
const COMPOSITE_DEFINITION: &str = include_str!("../../resources/state_machines/CompositeActivity.json");

pub trait DefinitionLoader: Send + Sync {
    /// Load a validated machine, [`LifecycleError::ObjectNotFound`] if unknown
    fn load_state_machine(&self, name: &str, version: i32) -> Result<Arc<StateMachine>>;
}

/// Packaged definition for a bootstrap key
fn packaged_definition(name: &str, version: i32) -> Option<&'static str> {
    match (name, version) {
        (DEFAULT_MACHINE, 0) => Some(DEFAULT_DEFINITION),
        (COMPOSITE_MACHINE, 0) => Some(COMPOSITE_DEFINITION),
        _ => None,
    }
}

/// Registry of validated state machines
#[derive(Debug, Default)]
pub struct InMemoryDefinitions {
    machines: RwLock<HashMap<(String, i32), Arc<StateMachine>>>,
    bootstrap: bool,
}

impl InMemoryDefinitions {
    /// Empty registry without packaged fallbacks
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty registry that falls back to the packaged machines
    pub fn with_bootstrap() -> Self {
        InMemoryDefinitions {
            machines: RwLock::new(HashMap::new()),
            bootstrap: true,
        }
    }

    pub fn from_config(config: &DefinitionsConfig) -> Self {
        if config.bootstrap_defaults {
            Self::with_bootstrap()
        } else {
            Self::new()
        }
    }

    /// Validate and register a machine, replacing any with the same key
    pub fn register(&self, mut machine: StateMachine) -> Result<Arc<StateMachine>> {
        if !machine.validate() {
            return Err(LifecycleError::InvalidData(format!(
                "State machine {} v{} is not coherent",
                machine.name, machine.version
            )));
        }
        let machine = Arc::new(machine);
        info!(name = %machine.name, version = machine.version, "registered state machine");
        self.machines
            .write()
            .insert((machine.name.clone(), machine.version), machine.clone());
        Ok(machine)
    }

    /// Parse and register a definition document
    pub fn import_json(&self, document: &str) -> Result<Arc<StateMachine>> {
        self.register(StateMachine::from_json(document)?)
    }

    #[cfg(test)]
    pub(crate) fn insert_unchecked(&self, machine: StateMachine) {
        self.machines
            .write()
            .insert((machine.name.clone(), machine.version), Arc::new(machine));
    }
}

impl DefinitionLoader for InMemoryDefinitions {
    fn load_state_machine(&self, name: &str, version: i32) -> Result<Arc<StateMachine>> {
        if let Some(machine) = self.machines.read().get(&(name.to_string(), version)) {
            return Ok(machine.clone());
        }

        let document = match packaged_definition(name, version) {
            Some(document) if self.bootstrap => document,
            _ => {
                return Err(LifecycleError::ObjectNotFound(format!(
                    "State machine {} v{} not found",
                    name, version
                )))
            }
        };

        debug!(name, version, "loading packaged state machine");
        let machine = Arc::new(StateMachine::from_json(document)?);
        if !machine.is_coherent() {
            return Err(LifecycleError::InvalidData(format!(
                "Packaged state machine {} is not coherent",
                name
            )));
        }
        let mut machines = self.machines.write();
        let cached = machines.entry((name.to_string(), version)).or_insert(machine);
        Ok(cached.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{State, StateId, Transition, TransitionId};

    #[test]
    fn test_packaged_machines() {
        let definitions = InMemoryDefinitions::with_bootstrap();

        let default = definitions.load_state_machine(DEFAULT_MACHINE, 0).unwrap();
        assert!(default.is_coherent());
        assert_eq!(default.states.len(), 4);
        assert!(default.state(StateId(2)).unwrap().is_finished());
        assert_eq!(
            default.transition_by_name("Skip").unwrap().enabled_property.as_deref(),
            Some("Skippable")
        );

        let composite = definitions.load_state_machine(COMPOSITE_MACHINE, 0).unwrap();
        assert!(composite.transition(TransitionId(1)).unwrap().is_finishing());

        // Cached after the first load
        assert!(Arc::ptr_eq(&default, &definitions.load_state_machine(DEFAULT_MACHINE, 0).unwrap()));
    }

    #[test]
    fn test_fallback_only_for_version_zero() {
        let definitions = InMemoryDefinitions::with_bootstrap();
        assert!(definitions.load_state_machine(DEFAULT_MACHINE, 1).unwrap_err().is_not_found());
        assert!(definitions.load_state_machine("Custom", 0).unwrap_err().is_not_found());

        let plain = InMemoryDefinitions::new();
        assert!(plain.load_state_machine(DEFAULT_MACHINE, 0).unwrap_err().is_not_found());
    }

    #[test]
    fn test_registered_machine_wins() {
        let definitions = InMemoryDefinitions::with_bootstrap();
        let custom = StateMachine::new(DEFAULT_MACHINE, 0, 0)
            .with_state(State::new(0, "Open", false))
            .with_state(State::new(1, "Done", true))
            .with_transition(Transition::new(0, "Close", 0, 1));
        definitions.register(custom).unwrap();

        let loaded = definitions.load_state_machine(DEFAULT_MACHINE, 0).unwrap();
        assert_eq!(loaded.states.len(), 2);
    }

    #[test]
    fn test_register_rejects_incoherent() {
        let definitions = InMemoryDefinitions::new();
        let broken = StateMachine::new("Broken", 0, 5).with_state(State::new(0, "Only", false));
        assert!(definitions.register(broken).unwrap_err().is_data_error());
    }
}
