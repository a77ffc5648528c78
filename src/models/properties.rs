// Activity property bag and `${name}` template substitution

//! # Activity Properties
//!
//! Every vertex carries an ordered, string-keyed bag of JSON values. The bag
//! holds both static configuration copied from the workflow template (role
//! names, state machine binding, outcome schema) and runtime bookkeeping
//! (who currently owns the activity).
//!
//! Transition definitions refer to properties through `${name}` placeholders,
//! so one state machine can be reused by many activities that each plug in
//! their own role, schema or script. [`resolve_placeholders`] is the single
//! place where that substitution happens.
//!
//! ## Well-known keys
//!
//! | Key | Meaning |
//! |---|---|
//! | [`STATE_MACHINE_NAME`] / [`STATE_MACHINE_VERSION`] | state machine binding |
//! | [`AGENT_NAME`] | agent currently holding the activity (reservation) |
//! | [`AGENT_ROLE`] | role required to perform transitions |
//! | [`VIEWPOINT`] | extra named view updated with each outcome |
//! | [`BREAKPOINT`] | stop the cascade on the first finishing transition |
//! | [`ROUTING_EXPR`] | branch selection template for splits |

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::{LifecycleError, Result};

pub const STATE_MACHINE_NAME: &str = "StateMachineName";
pub const STATE_MACHINE_VERSION: &str = "StateMachineVersion";
pub const AGENT_NAME: &str = "Agent Name";
pub const AGENT_ROLE: &str = "Agent Role";
pub const VIEWPOINT: &str = "Viewpoint";
pub const BREAKPOINT: &str = "Breakpoint";
pub const DESCRIPTION: &str = "Description";
pub const ROUTING_EXPR: &str = "RoutingExpr";
pub const SCHEMA_TYPE: &str = "SchemaType";
pub const SCHEMA_VERSION: &str = "SchemaVersion";
pub const SCRIPT_NAME: &str = "ScriptName";
pub const SCRIPT_VERSION: &str = "ScriptVersion";

lazy_static! {
    static ref PLACEHOLDER: Regex = Regex::new(r"\$\{(.+?)\}").expect("placeholder pattern");
}

/// Ordered string-keyed property bag
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Properties(BTreeMap<String, Value>);

impl Properties {
    pub fn new() -> Self {
        Properties(BTreeMap::new())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn put<K: Into<String>, V: Into<Value>>(&mut self, key: K, value: V) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Text form of a property; `None` when absent or null
    ///
    /// Strings come back unquoted, other scalars through their JSON form.
    pub fn get_string(&self, key: &str) -> Option<String> {
        self.0.get(key).and_then(value_text)
    }

    /// Text form of a property, absent and empty collapsed to `None`
    pub fn non_empty(&self, key: &str) -> Option<String> {
        self.get_string(key).filter(|s| !s.is_empty())
    }

    /// Whether a flag property is present and truthy
    ///
    /// `true` and the string `"true"` (any case) count as set; everything
    /// else, including absence, does not.
    pub fn flag(&self, key: &str) -> bool {
        match self.0.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
            _ => false,
        }
    }

    /// Integer version stored under `key`
    ///
    /// Absent, empty and `-1` all mean "no version"; anything else that does
    /// not parse is a data error.
    pub fn version_number(&self, key: &str) -> Result<Option<i32>> {
        let text = match self.get_string(key) {
            Some(text) if !text.is_empty() && text != "-1" => text,
            _ => return Ok(None),
        };
        text.trim()
            .parse::<i32>()
            .map(Some)
            .map_err(|_| LifecycleError::InvalidData(format!("Invalid version number '{}' in property '{}'", text, key)))
    }

    /// Substitute `${name}` placeholders in `template` from this bag
    pub fn resolve(&self, template: &str) -> String {
        resolve_placeholders(template, self)
    }
}

impl FromIterator<(String, Value)> for Properties {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Properties(iter.into_iter().collect())
    }
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Replace every `${name}` in `template` with the text of property `name`
///
/// Missing properties substitute the empty string, so a template made only of
/// placeholders resolves to `""` when the activity does not define them. That
/// is how activities opt out of outcome or script requirements.
pub fn resolve_placeholders(template: &str, props: &Properties) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &regex::Captures<'_>| {
            props.get_string(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_placeholder_substitution() {
        let mut props = Properties::new();
        props.put("Dept", "QA");
        props.put("Level", 3);

        assert_eq!(resolve_placeholders("${Dept}Manager", &props), "QAManager");
        assert_eq!(resolve_placeholders("${Dept}-${Level}", &props), "QA-3");
        assert_eq!(resolve_placeholders("${Missing}", &props), "");
        assert_eq!(resolve_placeholders("Admin", &props), "Admin");
    }

    #[test]
    fn test_flags() {
        let mut props = Properties::new();
        assert!(!props.flag(BREAKPOINT));

        props.put(BREAKPOINT, true);
        assert!(props.flag(BREAKPOINT));

        props.put("Skippable", "TRUE");
        assert!(props.flag("Skippable"));

        props.put("Skippable", json!(1));
        assert!(!props.flag("Skippable"));
    }

    #[test]
    fn test_version_numbers() {
        let mut props = Properties::new();
        assert_eq!(props.version_number(STATE_MACHINE_VERSION).unwrap(), None);

        props.put(STATE_MACHINE_VERSION, "2");
        assert_eq!(props.version_number(STATE_MACHINE_VERSION).unwrap(), Some(2));

        props.put(STATE_MACHINE_VERSION, 4);
        assert_eq!(props.version_number(STATE_MACHINE_VERSION).unwrap(), Some(4));

        props.put(STATE_MACHINE_VERSION, "-1");
        assert_eq!(props.version_number(STATE_MACHINE_VERSION).unwrap(), None);

        props.put(STATE_MACHINE_VERSION, "two");
        assert!(props.version_number(STATE_MACHINE_VERSION).unwrap_err().is_data_error());
    }

    #[test]
    fn test_string_views() {
        let mut props = Properties::new();
        props.put(AGENT_NAME, "");
        assert_eq!(props.get_string(AGENT_NAME), Some(String::new()));
        assert_eq!(props.non_empty(AGENT_NAME), None);

        props.put(AGENT_NAME, Value::Null);
        assert_eq!(props.get_string(AGENT_NAME), None);
    }
}
