// Transition definitions - authorized edges between states

//! # Transitions
//!
//! A [`Transition`] is a named edge from one state to another. Beyond the two
//! endpoints it carries everything needed to decide whether a given agent may
//! fire it on a given activity:
//!
//! - an optional **enabling property** that must be set on the activity
//! - whether the activity must currently be **active**
//! - an optional **role override** template (`${name}` placeholders) that
//!   replaces the activity's own role and bypasses ownership
//! - the **reservation policy** deciding who owns the activity afterwards
//! - optional **outcome** and **script** requirements, also templated so an
//!   activity can opt out by leaving the referenced properties empty
//!
//! ## Authorization order
//!
//! [`Transition::performing_role`] fails at the first violated rule:
//!
//! 1. enabling property present and truthy
//! 2. activity active, when required
//! 3. ownership: a reserved activity is usable only by its holder, unless a
//!    role override applies
//! 4. role resolution: override template, else the activity's `Agent Role`
//! 5. the agent holds the role, or holds `Admin`
//! 6. no role at all means open to every agent passing 1-3

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::trace;

use super::activity::Activity;
use super::identity::{AgentRef, RoleRef, ADMIN_ROLE};
use super::properties::{self, Properties};
use super::state::StateId;
use crate::engine::Directory;
use crate::{LifecycleError, Result};

/// Integer code of a transition inside one state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransitionId(pub i32);

impl TransitionId {
    pub fn code(&self) -> i32 {
        self.0
    }
}

impl From<i32> for TransitionId {
    fn from(code: i32) -> Self {
        TransitionId(code)
    }
}

impl fmt::Display for TransitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who holds the activity after the transition fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationPolicy {
    /// Clear when the target state is finishing, set otherwise
    #[default]
    Unset,
    /// Reserve the activity for the requesting agent
    Set,
    /// Release the activity
    Clear,
}

/// Outcome document a transition expects, as property templates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRequirement {
    pub schema_name: String,
    pub schema_version: String,
    #[serde(default = "default_true")]
    pub required: bool,
}

/// Script a transition asks the agent to run, as property templates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptRequirement {
    pub script_name: String,
    pub script_version: String,
}

/// Resolved outcome schema reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaRef {
    pub name: String,
    pub version: i32,
}

/// Resolved script reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptRef {
    pub name: String,
    pub version: i32,
}

fn default_true() -> bool {
    true
}

/// One named edge between two states
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    pub id: TransitionId,
    pub name: String,
    pub origin: StateId,
    pub target: StateId,

    /// Boolean activity property that enables this transition, e.g. `Skippable`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled_property: Option<String>,

    #[serde(default = "default_true")]
    pub requires_active: bool,

    /// Role template that replaces the activity's role and bypasses ownership
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_override: Option<String>,

    #[serde(default)]
    pub reservation: ReservationPolicy,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<OutcomeRequirement>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<ScriptRequirement>,

    /// Whether the target state is finishing, set when endpoints resolve
    #[serde(skip)]
    pub(crate) finishing: bool,
}

impl Transition {
    pub fn new<S: Into<String>>(id: i32, name: S, origin: i32, target: i32) -> Self {
        Transition {
            id: TransitionId(id),
            name: name.into(),
            origin: StateId(origin),
            target: StateId(target),
            enabled_property: None,
            requires_active: true,
            role_override: None,
            reservation: ReservationPolicy::Unset,
            outcome: None,
            script: None,
            finishing: false,
        }
    }

    pub fn with_enabled_property<S: Into<String>>(mut self, property: S) -> Self {
        self.enabled_property = Some(property.into());
        self
    }

    pub fn with_requires_active(mut self, requires_active: bool) -> Self {
        self.requires_active = requires_active;
        self
    }

    pub fn with_role_override<S: Into<String>>(mut self, role: S) -> Self {
        self.role_override = Some(role.into());
        self
    }

    pub fn with_reservation(mut self, reservation: ReservationPolicy) -> Self {
        self.reservation = reservation;
        self
    }

    pub fn with_outcome<N: Into<String>, V: Into<String>>(mut self, schema_name: N, schema_version: V, required: bool) -> Self {
        self.outcome = Some(OutcomeRequirement {
            schema_name: schema_name.into(),
            schema_version: schema_version.into(),
            required,
        });
        self
    }

    pub fn with_script<N: Into<String>, V: Into<String>>(mut self, script_name: N, script_version: V) -> Self {
        self.script = Some(ScriptRequirement {
            script_name: script_name.into(),
            script_version: script_version.into(),
        });
        self
    }

    pub fn is_finishing(&self) -> bool {
        self.finishing
    }

    /// Bind the endpoints against the machine's state table
    ///
    /// `states` maps every known state code to its finished flag. Returns
    /// false when either endpoint is missing.
    pub(crate) fn resolve_states(&mut self, states: &HashMap<StateId, bool>) -> bool {
        let origin_found = states.contains_key(&self.origin);
        match states.get(&self.target) {
            Some(finished) => {
                self.finishing = *finished;
                origin_found
            }
            None => false,
        }
    }

    pub fn is_enabled(&self, props: &Properties) -> bool {
        match &self.enabled_property {
            None => true,
            Some(prop) => props.flag(prop),
        }
    }

    /// Decide whether `agent` may fire this transition on `activity`
    ///
    /// Returns the role the agent acts under, or `None` for an open
    /// transition. Authorization failures are [`LifecycleError::AccessRights`];
    /// a role name that the directory cannot resolve is
    /// [`LifecycleError::ObjectNotFound`].
    pub fn performing_role(&self, activity: &Activity, agent: &AgentRef, directory: &dyn Directory) -> Result<Option<String>> {
        let props = &activity.properties;

        if !self.is_enabled(props) {
            return Err(LifecycleError::AccessRights(format!(
                "Transition '{}' is disabled by the '{}' property.",
                self.name,
                self.enabled_property.as_deref().unwrap_or_default()
            )));
        }

        if self.requires_active && !activity.active {
            return Err(LifecycleError::AccessRights(
                "Activity must be active to perform this transition".to_string(),
            ));
        }

        let overriding_role = self
            .role_override
            .as_deref()
            .map(|template| props.resolve(template));

        if overriding_role.is_none() {
            if let Some(holder) = props.non_empty(properties::AGENT_NAME) {
                if holder != agent.name {
                    return Err(LifecycleError::AccessRights(format!(
                        "Agent '{}' cannot perform this transition because the activity '{}' is currently owned by {}",
                        agent.name, activity.name, holder
                    )));
                }
            }
        }

        let role_name = overriding_role.or_else(|| props.non_empty(properties::AGENT_ROLE));
        let role = match role_name {
            Some(name) => directory.resolve_role(&name)?,
            None => return Ok(None),
        };

        if directory.agent_has_role(agent, &role) {
            return Ok(Some(role.name));
        }
        if holds_admin(agent, directory) {
            trace!(agent = %agent, role = %role, "admin override for transition {}", self.name);
            return Ok(Some(ADMIN_ROLE.to_string()));
        }

        Err(LifecycleError::AccessRights(format!(
            "Agent '{}' does not hold a suitable role '{}' for the activity {}",
            agent.name, role.name, activity.name
        )))
    }

    /// New value of the activity's `Agent Name` after this transition
    pub fn reservation_for(&self, activity: &Activity, agent: &AgentRef) -> String {
        let policy = match self.reservation {
            ReservationPolicy::Unset if self.finishing => ReservationPolicy::Clear,
            ReservationPolicy::Unset => ReservationPolicy::Set,
            other => other,
        };
        match policy {
            ReservationPolicy::Set => agent.name.clone(),
            ReservationPolicy::Clear => String::new(),
            ReservationPolicy::Unset => activity
                .properties
                .get_string(properties::AGENT_NAME)
                .unwrap_or_default(),
        }
    }

    /// True only when both the resolved schema name and version are non-empty
    pub fn has_outcome(&self, props: &Properties) -> bool {
        match &self.outcome {
            Some(outcome) => {
                !props.resolve(&outcome.schema_name).is_empty() && !props.resolve(&outcome.schema_version).is_empty()
            }
            None => false,
        }
    }

    /// Resolved outcome schema, `None` when the activity opts out
    pub fn schema(&self, props: &Properties) -> Result<Option<SchemaRef>> {
        let outcome = match &self.outcome {
            Some(outcome) if self.has_outcome(props) => outcome,
            _ => return Ok(None),
        };
        let version_text = props.resolve(&outcome.schema_version);
        let version = version_text.trim().parse::<i32>().map_err(|_| {
            LifecycleError::InvalidData(format!(
                "Bad schema version number: {} ({})",
                outcome.schema_version, version_text
            ))
        })?;
        Ok(Some(SchemaRef {
            name: props.resolve(&outcome.schema_name),
            version,
        }))
    }

    pub fn outcome_required(&self) -> bool {
        self.outcome.as_ref().map_or(false, |o| o.required)
    }

    /// True only when both the resolved script name and version are non-empty
    pub fn has_script(&self, props: &Properties) -> bool {
        match &self.script {
            Some(script) => {
                !props.resolve(&script.script_name).is_empty() && !props.resolve(&script.script_version).is_empty()
            }
            None => false,
        }
    }

    pub fn script_ref(&self, props: &Properties) -> Result<Option<ScriptRef>> {
        let script = match &self.script {
            Some(script) if self.has_script(props) => script,
            _ => return Ok(None),
        };
        let version_text = props.resolve(&script.script_version);
        let version = version_text.trim().parse::<i32>().map_err(|_| {
            LifecycleError::InvalidData(format!(
                "Bad Script version number: {} ({})",
                script.script_version, version_text
            ))
        })?;
        Ok(Some(ScriptRef {
            name: props.resolve(&script.script_name),
            version,
        }))
    }
}

fn holds_admin(agent: &AgentRef, directory: &dyn Directory) -> bool {
    directory
        .resolve_role(ADMIN_ROLE)
        .map(|admin: RoleRef| directory.agent_has_role(agent, &admin))
        .unwrap_or(false)
}

impl PartialEq for Transition {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Transition {}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::InMemoryDirectory;

    fn directory() -> InMemoryDirectory {
        let directory = InMemoryDirectory::new();
        directory.add_role("Reviewer", true);
        directory.add_role("QAManager", true);
        directory.add_role(ADMIN_ROLE, false);
        directory.add_agent("alice", &["Reviewer"]);
        directory.add_agent("bob", &[]);
        directory.add_agent("root", &[ADMIN_ROLE]);
        directory.add_agent("quinn", &["QAManager"]);
        directory
    }

    fn active_activity() -> Activity {
        let mut activity = Activity::new("Review");
        activity.active = true;
        activity
    }

    #[test]
    fn test_disabled_by_missing_property() {
        let directory = directory();
        let transition = Transition::new(6, "Skip", 0, 2).with_enabled_property("Skippable");
        let mut activity = active_activity();

        let err = transition
            .performing_role(&activity, &AgentRef::new("bob"), &directory)
            .unwrap_err();
        assert!(err.is_access_error());

        activity.properties.put("Skippable", true);
        assert_eq!(
            transition.performing_role(&activity, &AgentRef::new("bob"), &directory).unwrap(),
            None
        );
    }

    #[test]
    fn test_requires_active() {
        let directory = directory();
        let transition = Transition::new(0, "Start", 0, 1);
        let mut activity = Activity::new("Review");

        assert!(transition
            .performing_role(&activity, &AgentRef::new("bob"), &directory)
            .unwrap_err()
            .is_access_error());

        let passive = transition.clone().with_requires_active(false);
        assert!(passive.performing_role(&activity, &AgentRef::new("bob"), &directory).is_ok());

        activity.active = true;
        assert!(transition.performing_role(&activity, &AgentRef::new("bob"), &directory).is_ok());
    }

    #[test]
    fn test_ownership_and_override() {
        let directory = directory();
        let mut activity = active_activity();
        activity.properties.put(properties::AGENT_NAME, "alice");

        let plain = Transition::new(2, "Complete", 1, 2);
        assert!(plain
            .performing_role(&activity, &AgentRef::new("bob"), &directory)
            .unwrap_err()
            .is_access_error());
        assert_eq!(plain.performing_role(&activity, &AgentRef::new("alice"), &directory).unwrap(), None);

        // Override bypasses ownership but still needs the overriding role
        activity.properties.put("Dept", "QA");
        let overridden = plain.clone().with_role_override("${Dept}Manager");
        assert_eq!(
            overridden.performing_role(&activity, &AgentRef::new("quinn"), &directory).unwrap(),
            Some("QAManager".to_string())
        );
        assert!(overridden
            .performing_role(&activity, &AgentRef::new("bob"), &directory)
            .unwrap_err()
            .is_access_error());

        // An override resolving to nothing is still looked up
        let unresolved = plain.clone().with_role_override("${Missing}");
        assert!(unresolved
            .performing_role(&activity, &AgentRef::new("alice"), &directory)
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_role_and_admin() {
        let directory = directory();
        let mut activity = active_activity();
        activity.properties.put(properties::AGENT_ROLE, "Reviewer");
        let transition = Transition::new(0, "Start", 0, 1);

        assert_eq!(
            transition.performing_role(&activity, &AgentRef::new("alice"), &directory).unwrap(),
            Some("Reviewer".to_string())
        );
        assert_eq!(
            transition.performing_role(&activity, &AgentRef::new("root"), &directory).unwrap(),
            Some(ADMIN_ROLE.to_string())
        );
        assert!(transition
            .performing_role(&activity, &AgentRef::new("bob"), &directory)
            .unwrap_err()
            .is_access_error());

        activity.properties.put(properties::AGENT_ROLE, "Ghost");
        assert!(transition
            .performing_role(&activity, &AgentRef::new("alice"), &directory)
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_reservation_defaults() {
        let mut activity = active_activity();
        activity.properties.put(properties::AGENT_NAME, "carol");
        let agent = AgentRef::new("alice");

        let mut to_started = Transition::new(0, "Start", 0, 1);
        to_started.finishing = false;
        assert_eq!(to_started.reservation_for(&activity, &agent), "alice");

        let mut to_finished = Transition::new(2, "Complete", 1, 2);
        to_finished.finishing = true;
        assert_eq!(to_finished.reservation_for(&activity, &agent), "");

        let forced = to_finished.clone().with_reservation(ReservationPolicy::Set);
        assert_eq!(forced.reservation_for(&activity, &agent), "alice");
    }

    #[test]
    fn test_outcome_opt_out_and_bad_version() {
        let transition = Transition::new(2, "Complete", 1, 2).with_outcome("${SchemaType}", "${SchemaVersion}", true);
        let mut props = Properties::new();
        assert!(!transition.has_outcome(&props));
        assert_eq!(transition.schema(&props).unwrap(), None);

        props.put(properties::SCHEMA_TYPE, "Report");
        assert!(!transition.has_outcome(&props));

        props.put(properties::SCHEMA_VERSION, "1");
        assert_eq!(
            transition.schema(&props).unwrap(),
            Some(SchemaRef { name: "Report".into(), version: 1 })
        );

        props.put(properties::SCHEMA_VERSION, "one");
        assert!(transition.schema(&props).unwrap_err().is_data_error());
    }

    #[test]
    fn test_script_requirement() {
        let transition = Transition::new(2, "Complete", 1, 2).with_script("${ScriptName}", "${ScriptVersion}");
        let mut props = Properties::new();
        props.put(properties::SCRIPT_NAME, "Notify");
        assert!(!transition.has_script(&props));

        props.put(properties::SCRIPT_VERSION, 3);
        assert_eq!(
            transition.script_ref(&props).unwrap(),
            Some(ScriptRef { name: "Notify".into(), version: 3 })
        );
    }
}
