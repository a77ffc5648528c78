// Directory lookup contract - roles and agents

//! # Directory
//!
//! Role and agent lookups the engine needs for authorization and job routing.
//! The real directory service is an external collaborator; the engine only
//! depends on the [`Directory`] trait. [`InMemoryDirectory`] is a small
//! implementation for tests, demos and single-process deployments.
//!
//! Lookups are synchronous: they run inside authorization checks that are
//! themselves pure functions of the activity and the agent.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

use crate::models::{AgentRef, RoleRef};
use crate::{LifecycleError, Result};

pub trait Directory: Send + Sync {
    /// Resolve a role by name, [`LifecycleError::ObjectNotFound`] if unknown
    fn resolve_role(&self, name: &str) -> Result<RoleRef>;

    fn agent_has_role(&self, agent: &AgentRef, role: &RoleRef) -> bool;

    /// Whether agents of this role receive pushed job lists
    fn role_has_subscribers(&self, role: &RoleRef) -> bool;

    /// Direct sub-roles of a role
    fn children_of(&self, role: &RoleRef) -> Vec<RoleRef>;

    /// Agents holding a role directly
    fn agents_of(&self, role: &RoleRef) -> Vec<AgentRef>;
}

#[derive(Debug, Default)]
struct RoleEntry {
    has_subscribers: bool,
    children: Vec<String>,
}

#[derive(Debug, Default)]
struct DirectoryData {
    roles: HashMap<String, RoleEntry>,
    agents: HashMap<String, HashSet<String>>,
}

/// In-memory role and agent registry
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    data: RwLock<DirectoryData>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a role; `has_subscribers` enables job pushes for its agents
    pub fn add_role(&self, name: &str, has_subscribers: bool) -> RoleRef {
        let mut data = self.data.write();
        data.roles.entry(name.to_string()).or_default().has_subscribers = has_subscribers;
        RoleRef::new(name)
    }

    /// Register `child` as a sub-role of `parent`
    pub fn add_child_role(&self, parent: &str, child: &str, has_subscribers: bool) -> Result<RoleRef> {
        let mut data = self.data.write();
        if !data.roles.contains_key(parent) {
            return Err(LifecycleError::ObjectNotFound(format!("Role '{}' not found", parent)));
        }
        data.roles.entry(child.to_string()).or_default().has_subscribers = has_subscribers;
        if let Some(entry) = data.roles.get_mut(parent) {
            if !entry.children.iter().any(|c| c == child) {
                entry.children.push(child.to_string());
            }
        }
        Ok(RoleRef::new(child))
    }

    /// Register an agent holding the given roles
    pub fn add_agent(&self, name: &str, roles: &[&str]) -> AgentRef {
        let mut data = self.data.write();
        let held = data.agents.entry(name.to_string()).or_default();
        held.extend(roles.iter().map(|role| role.to_string()));
        AgentRef::new(name)
    }

    pub fn grant_role(&self, agent: &str, role: &str) -> Result<()> {
        let mut data = self.data.write();
        if !data.roles.contains_key(role) {
            return Err(LifecycleError::ObjectNotFound(format!("Role '{}' not found", role)));
        }
        data.agents.entry(agent.to_string()).or_default().insert(role.to_string());
        Ok(())
    }
}

impl Directory for InMemoryDirectory {
    fn resolve_role(&self, name: &str) -> Result<RoleRef> {
        if self.data.read().roles.contains_key(name) {
            Ok(RoleRef::new(name))
        } else {
            Err(LifecycleError::ObjectNotFound(format!("Role '{}' not found", name)))
        }
    }

    fn agent_has_role(&self, agent: &AgentRef, role: &RoleRef) -> bool {
        self.data
            .read()
            .agents
            .get(&agent.name)
            .map_or(false, |roles| roles.contains(&role.name))
    }

    fn role_has_subscribers(&self, role: &RoleRef) -> bool {
        self.data
            .read()
            .roles
            .get(&role.name)
            .map_or(false, |entry| entry.has_subscribers)
    }

    fn children_of(&self, role: &RoleRef) -> Vec<RoleRef> {
        self.data
            .read()
            .roles
            .get(&role.name)
            .map(|entry| entry.children.iter().map(RoleRef::new).collect())
            .unwrap_or_default()
    }

    fn agents_of(&self, role: &RoleRef) -> Vec<AgentRef> {
        let data = self.data.read();
        let mut agents: Vec<AgentRef> = data
            .agents
            .iter()
            .filter(|(_, roles)| roles.contains(&role.name))
            .map(|(name, _)| AgentRef::new(name.as_str()))
            .collect();
        agents.sort_by(|a, b| a.name.cmp(&b.name));
        agents
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles_and_agents() {
        let directory = InMemoryDirectory::new();
        let reviewer = directory.add_role("Reviewer", true);
        let senior = directory.add_child_role("Reviewer", "SeniorReviewer", false).unwrap();
        let alice = directory.add_agent("alice", &["Reviewer"]);
        let bob = directory.add_agent("bob", &["SeniorReviewer"]);

        assert_eq!(directory.resolve_role("Reviewer").unwrap(), reviewer);
        assert!(directory.resolve_role("Nobody").unwrap_err().is_not_found());
        assert!(directory.agent_has_role(&alice, &reviewer));
        assert!(!directory.agent_has_role(&bob, &reviewer));
        assert!(directory.role_has_subscribers(&reviewer));
        assert!(!directory.role_has_subscribers(&senior));
        assert_eq!(directory.children_of(&reviewer), vec![senior.clone()]);
        assert_eq!(directory.agents_of(&senior), vec![bob]);

        assert!(directory.add_child_role("Ghost", "Child", true).is_err());
        assert!(directory.grant_role("carol", "Ghost").is_err());
        directory.grant_role("carol", "Reviewer").unwrap();
        assert_eq!(directory.agents_of(&reviewer).len(), 2);
    }
}
