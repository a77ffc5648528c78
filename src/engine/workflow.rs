// Workflow instance - the vertex arena of one item

//! # Workflow
//!
//! A [`Workflow`] is the graph of vertices that drives one item. Vertices live
//! in a flat arena and refer to each other only by [`VertexId`]: edges are id
//! lists, parents are ids. Back edges that close a loop are therefore plain
//! data and never form ownership cycles.
//!
//! The arena always starts with the root vertex, a composite named `domain`
//! with no parent. The root never runs its own state machine; it owns the
//! top-level graph, and a vertex whose parent is the root is a root-level
//! vertex. Paths follow the nesting: `workflow/domain/3/7` is vertex 7 inside
//! composite 3.
//!
//! This file holds construction, structural verification, loop
//! re-initialisation and job calculation. The asynchronous graph walk
//! (`run`, `run_next`, `request`) lives in `execution.rs`.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

use super::context::ExecutionContext;
use super::dispatch::JobNotification;
use crate::models::properties;
use crate::models::{
    Activity, AgentRef, CompositeActivity, ItemId, Job, JoinKind, Properties, SplitKind, StateMachine, Vertex,
    VertexId, VertexKind,
};
use crate::{LifecycleError, Result};

pub const WORKFLOW_PATH: &str = "workflow";
pub const ROOT_NAME: &str = "domain";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    item_id: ItemId,
    vertices: Vec<Vertex>,
    root: VertexId,
}

impl Workflow {
    pub fn new(item_id: ItemId) -> Self {
        let root = VertexId(0);
        Workflow {
            item_id,
            vertices: vec![Vertex::new(
                root,
                ROOT_NAME,
                None,
                VertexKind::Composite(CompositeActivity::new(ROOT_NAME)),
            )],
            root,
        }
    }

    pub fn item_id(&self) -> ItemId {
        self.item_id
    }

    pub fn root(&self) -> VertexId {
        self.root
    }

    pub fn vertices(&self) -> impl Iterator<Item = &Vertex> {
        self.vertices.iter()
    }

    pub fn vertex(&self, id: VertexId) -> Result<&Vertex> {
        self.vertices
            .get(id.0)
            .ok_or_else(|| LifecycleError::ObjectNotFound(format!("Vertex {} not found", id)))
    }

    pub fn vertex_mut(&mut self, id: VertexId) -> Result<&mut Vertex> {
        self.vertices
            .get_mut(id.0)
            .ok_or_else(|| LifecycleError::ObjectNotFound(format!("Vertex {} not found", id)))
    }

    pub fn activity(&self, id: VertexId) -> Result<&Activity> {
        let vertex = self.vertex(id)?;
        vertex
            .activity()
            .ok_or_else(|| LifecycleError::InvalidData(format!("Vertex {} ({}) is not an activity", id, vertex.name)))
    }

    pub fn activity_mut(&mut self, id: VertexId) -> Result<&mut Activity> {
        let vertex = self.vertex_mut(id)?;
        let name = vertex.name.clone();
        vertex
            .activity_mut()
            .ok_or_else(|| LifecycleError::InvalidData(format!("Vertex {} ({}) is not an activity", id, name)))
    }

    pub fn set_property<K: Into<String>, V: Into<serde_json::Value>>(&mut self, id: VertexId, key: K, value: V) -> Result<()> {
        let vertex = self.vertex_mut(id)?;
        vertex.properties_mut().put(key, value);
        if let Some(activity) = vertex.activity_mut() {
            activity.unbind_machine();
        }
        Ok(())
    }

    fn add_vertex(&mut self, parent: VertexId, name: &str, kind: VertexKind, first: bool) -> Result<VertexId> {
        let id = VertexId(self.vertices.len());
        let parent_vertex = self.vertex_mut(parent)?;
        let VertexKind::Composite(composite) = &mut parent_vertex.kind else {
            return Err(LifecycleError::InvalidData(format!(
                "Cannot add {} under {}: not a composite activity",
                name, parent_vertex.name
            )));
        };
        if first {
            composite.start_vertex = Some(id);
        }
        self.vertices.push(Vertex::new(id, name, Some(parent), kind));
        Ok(id)
    }

    /// Add an atomic activity bound to the default machine
    pub fn add_atomic(&mut self, parent: VertexId, name: &str, first: bool) -> Result<VertexId> {
        self.add_activity(parent, Activity::new(name), first)
    }

    /// Add a preconfigured atomic activity
    pub fn add_activity(&mut self, parent: VertexId, activity: Activity, first: bool) -> Result<VertexId> {
        let name = activity.name.clone();
        self.add_vertex(parent, &name, VertexKind::Atomic(activity), first)
    }

    pub fn add_composite(&mut self, parent: VertexId, name: &str, first: bool) -> Result<VertexId> {
        self.add_vertex(parent, name, VertexKind::Composite(CompositeActivity::new(name)), first)
    }

    pub fn add_split(&mut self, parent: VertexId, name: &str, kind: SplitKind, first: bool) -> Result<VertexId> {
        let properties = Properties::new();
        self.add_vertex(parent, name, VertexKind::Split { kind, properties }, first)
    }

    pub fn add_join(&mut self, parent: VertexId, name: &str, kind: JoinKind, first: bool) -> Result<VertexId> {
        let properties = Properties::new();
        self.add_vertex(parent, name, VertexKind::Join { kind, properties }, first)
    }

    /// Connect two vertices of the same child graph
    pub fn add_next(&mut self, from: VertexId, to: VertexId) -> Result<()> {
        let from_parent = self.vertex(from)?.parent;
        let to_parent = self.vertex(to)?.parent;
        if from_parent.is_none() || from_parent != to_parent {
            return Err(LifecycleError::InvalidData(format!(
                "Vertices {} and {} are not in the same graph",
                from, to
            )));
        }
        self.vertex_mut(from)?.outgoing.push(to);
        self.vertex_mut(to)?.incoming.push(from);
        Ok(())
    }

    /// Direct children of a composite, in creation order
    pub fn children(&self, id: VertexId) -> Vec<VertexId> {
        self.vertices
            .iter()
            .filter(|vertex| vertex.parent == Some(id))
            .map(|vertex| vertex.id)
            .collect()
    }

    pub fn start_vertex(&self, id: VertexId) -> Option<VertexId> {
        self.vertex(id).ok()?.composite()?.start_vertex
    }

    pub fn path(&self, id: VertexId) -> String {
        match self.vertex(id) {
            Ok(Vertex { parent: Some(parent), .. }) => format!("{}/{}", self.path(*parent), id),
            _ => format!("{}/{}", WORKFLOW_PATH, ROOT_NAME),
        }
    }

    /// Find a vertex by its path
    pub fn search(&self, path: &str) -> Option<VertexId> {
        self.vertices
            .iter()
            .map(|vertex| vertex.id)
            .find(|id| self.path(*id) == path)
    }

    pub fn is_root_level(&self, id: VertexId) -> bool {
        self.vertex(id).map_or(false, |vertex| vertex.parent == Some(self.root))
    }

    /// Bind (once) and return the vertex's state machine
    pub fn state_machine(&mut self, ctx: &ExecutionContext, id: VertexId) -> Result<Arc<StateMachine>> {
        let definitions = ctx.definitions.clone();
        self.activity_mut(id)?.state_machine(definitions.as_ref())
    }

    pub fn is_finished(&mut self, ctx: &ExecutionContext, id: VertexId) -> Result<bool> {
        let definitions = ctx.definitions.clone();
        self.activity_mut(id)?.is_finished(definitions.as_ref())
    }

    pub fn state_name(&mut self, ctx: &ExecutionContext, id: VertexId) -> Result<String> {
        let definitions = ctx.definitions.clone();
        self.activity_mut(id)?.state_name(definitions.as_ref())
    }

    /// Structural check of one vertex, recursing into composites
    pub fn verify(&self, id: VertexId) -> std::result::Result<(), String> {
        let vertex = self.vertex(id).map_err(|e| e.to_string())?;

        if let Some(parent) = vertex.parent {
            let is_start = self.start_vertex(parent) == Some(id);
            if vertex.incoming.is_empty() && !is_start {
                return Err("Unreachable".to_string());
            }
            match &vertex.kind {
                VertexKind::Join { .. } => {}
                _ if vertex.incoming.len() > 1 => return Err("Bad nb of previous".to_string()),
                _ => {}
            }
            match &vertex.kind {
                VertexKind::Split { kind: SplitKind::Loop, .. } if vertex.outgoing.len() != 2 => {
                    return Err("Bad nb of next".to_string())
                }
                VertexKind::Split { .. } if vertex.outgoing.is_empty() => return Err("No next".to_string()),
                VertexKind::Split { .. } => {}
                _ if vertex.outgoing.len() > 1 => return Err("too many next".to_string()),
                _ if vertex.outgoing.is_empty() && self.endpoint_count(parent) != 1 => {
                    return Err("too many endpoints".to_string())
                }
                _ => {}
            }
        }

        if vertex.is_composite() {
            for child in self.children(id) {
                if let Err(reason) = self.verify(child) {
                    debug!(vertex = %child, "child failed verification: {}", reason);
                    return Err("error in children".to_string());
                }
            }
        }
        Ok(())
    }

    /// Verify the whole graph from the root
    pub fn verify_all(&self) -> std::result::Result<(), String> {
        self.verify(self.root)
    }

    fn endpoint_count(&self, composite: VertexId) -> usize {
        self.vertices
            .iter()
            .filter(|vertex| vertex.parent == Some(composite) && vertex.outgoing.is_empty())
            .count()
    }

    /// Reset `from` and everything reachable after it to initial states
    ///
    /// The walk stops at `stop` (the loop split that triggered it). A
    /// composite that is not finished after the reset also re-initialises
    /// its start vertex.
    pub fn reinit(&mut self, ctx: &ExecutionContext, from: VertexId, stop: VertexId) -> Result<()> {
        let definitions = ctx.definitions.clone();
        let mut visited = HashSet::new();
        let mut pending = vec![from];

        while let Some(current) = pending.pop() {
            if current == stop || !visited.insert(current) {
                continue;
            }
            let vertex = self.vertex_mut(current)?;
            if let Some(activity) = vertex.activity_mut() {
                activity.reinit(definitions.as_ref())?;
            }
            if let VertexKind::Composite(composite) = &mut vertex.kind {
                if let Some(start) = composite.start_vertex {
                    if !composite.activity.is_finished(definitions.as_ref())? {
                        pending.push(start);
                    }
                }
            }
            pending.extend(vertex.outgoing.iter().copied());
            debug!(vertex = %current, "reinitialised");
        }
        Ok(())
    }

    /// Jobs `agent` may perform on active activities at or below `id`
    ///
    /// With `recurse`, a composite contributes its own jobs only while none
    /// of its child activities is active.
    pub fn calculate_jobs(&mut self, ctx: &ExecutionContext, agent: &AgentRef, id: VertexId, recurse: bool) -> Result<Vec<Job>> {
        self.collect_jobs(ctx, agent, id, recurse, false)
    }

    /// Jobs at or below `id` regardless of activation, composites included
    pub fn calculate_all_jobs(&mut self, ctx: &ExecutionContext, agent: &AgentRef, id: VertexId, recurse: bool) -> Result<Vec<Job>> {
        self.collect_jobs(ctx, agent, id, recurse, true)
    }

    fn collect_jobs(
        &mut self,
        ctx: &ExecutionContext,
        agent: &AgentRef,
        id: VertexId,
        recurse: bool,
        include_inactive: bool,
    ) -> Result<Vec<Job>> {
        let vertex = self.vertex(id)?;
        if !vertex.is_activity() {
            return Ok(Vec::new());
        }

        let mut jobs = Vec::new();
        let mut child_active = false;
        if vertex.is_composite() && recurse {
            for child in self.children(id) {
                let Some(activity) = self.vertex(child)?.activity() else {
                    continue;
                };
                child_active |= activity.active;
                jobs.extend(self.collect_jobs(ctx, agent, child, recurse, include_inactive)?);
            }
        }

        if id != self.root && (include_inactive || !child_active) {
            jobs.extend(self.own_jobs(ctx, agent, id, include_inactive)?);
        }
        Ok(jobs)
    }

    fn own_jobs(&mut self, ctx: &ExecutionContext, agent: &AgentRef, id: VertexId, include_inactive: bool) -> Result<Vec<Job>> {
        let machine = self.state_machine(ctx, id)?;
        let activity_path = self.path(id);
        let activity = self.activity(id)?;
        if !include_inactive && !activity.active {
            return Ok(Vec::new());
        }

        let directory = ctx.directory.as_ref();
        machine
            .possible_transitions(activity, agent, directory)?
            .into_iter()
            .map(|transition| {
                Ok(Job {
                    item_id: self.item_id,
                    activity_path: activity_path.clone(),
                    activity_name: activity.name.clone(),
                    transition_id: transition.id,
                    transition_name: transition.name.clone(),
                    agent: agent.name.clone(),
                    role: transition.performing_role(activity, agent, directory)?,
                    schema: transition.schema(&activity.properties)?,
                    script: transition.script_ref(&activity.properties)?,
                })
            })
            .collect()
    }

    /// Recompute and queue job lists for the agents of the activity's role
    ///
    /// Best effort: a missing role or dispatcher and any calculation error
    /// are logged, never returned.
    pub fn push_jobs_to_agents(&mut self, ctx: &ExecutionContext, id: VertexId) {
        let Some(dispatcher) = ctx.dispatcher.clone() else {
            return;
        };
        let Ok(activity) = self.activity(id) else {
            return;
        };
        let Some(role_name) = activity.properties.non_empty(properties::AGENT_ROLE) else {
            return;
        };
        let directory = ctx.directory.clone();
        let role = match directory.resolve_role(&role_name) {
            Ok(role) => role,
            Err(e) => {
                debug!(role = %role_name, "no job push: {}", e);
                return;
            }
        };

        let mut roles = vec![role];
        let mut pos = 0;
        while pos < roles.len() {
            for child in directory.children_of(&roles[pos]) {
                if !roles.contains(&child) {
                    roles.push(child);
                }
            }
            pos += 1;
        }

        let activity_path = self.path(id);
        let mut notified = HashSet::new();
        for role in roles.iter().filter(|role| directory.role_has_subscribers(role)) {
            for agent in directory.agents_of(role) {
                if !notified.insert(agent.name.clone()) {
                    continue;
                }
                match self
                    .calculate_jobs(ctx, &agent, id, false)
                    .and_then(|jobs| Job::serialize_list(&jobs))
                {
                    Ok(jobs) => {
                        dispatcher.dispatch(JobNotification {
                            agent,
                            item: self.item_id,
                            activity_path: activity_path.clone(),
                            jobs,
                        });
                    }
                    Err(e) => warn!(agent = %agent, activity = %activity_path, "job calculation failed: {}", e),
                }
            }
        }
    }

    /// Re-push the jobs of every activity below a composite
    pub fn refresh_jobs(&mut self, ctx: &ExecutionContext, id: VertexId) {
        let mut pending = self.children(id);
        while let Some(child) = pending.pop() {
            let Ok(vertex) = self.vertex(child) else {
                continue;
            };
            if vertex.is_composite() {
                pending.extend(self.children(child));
            }
            if vertex.is_activity() {
                self.push_jobs_to_agents(ctx, child);
            }
        }
    }

    pub(crate) fn touch(&mut self, id: VertexId) -> Result<()> {
        self.activity_mut(id)?.state_date = Utc::now();
        Ok(())
    }
}
