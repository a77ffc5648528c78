// Graph walking - run, run_next and the transactional request

//! # Execution
//!
//! The asynchronous half of [`Workflow`]: every vertex kind obeys the same
//! `run` / `run_next` contract, dispatched on [`VertexKind`]:
//!
//! | Vertex | `run` | `run_next` |
//! |---|---|---|
//! | activity | activate; cascade if already finished, else push jobs | deactivate, run the successor or bubble up |
//! | composite | as activity, then enter the start child | self-request `Complete`, then as activity |
//! | split | run the selected branches | follow the single successor |
//! | join | proceed once no upstream activity is active | follow the single successor |
//!
//! [`Workflow::request`] is the core transactional operation: authorize,
//! validate, mutate, stage the records under a fresh [`Locker`], commit, then
//! cascade.
//!
//! ## Rust Learning Notes:
//!
//! ### Recursive async functions
//! `run`, `run_next` and `request` call each other recursively. An `async fn`
//! cannot contain itself, so these return `BoxFuture`: the recursive call is
//! boxed and the future has a known size.

use futures::future::{BoxFuture, FutureExt};
use std::collections::HashSet;
use tracing::{debug, info, warn};

use super::context::ExecutionContext;
use super::history::History;
use super::transaction::Locker;
use super::workflow::Workflow;
use crate::models::properties::{self, AGENT_NAME};
use crate::models::{
    ActivityStateRecord, AgentRef, Event, ItemId, JoinKind, OutcomeRecord, Record, SchemaRef, SplitKind,
    TransitionId, VertexId, VertexKind, Viewpoint, COMPLETE, LAST_VIEW, START,
};
use crate::{LifecycleError, Result};

/// Dispatch tag of a vertex, copied out so the arena can be mutated
#[derive(Debug, Clone, Copy)]
enum Shape {
    Activity { composite: bool },
    Split(SplitKind),
    Join(JoinKind),
}

/// Everything one request stages, in staging order
struct TransitionRecords {
    event: Event,
    state: ActivityStateRecord,
    outcome: Option<(SchemaRef, String)>,
    view_name: Option<String>,
}

impl Workflow {
    fn shape(&self, id: VertexId) -> Result<Shape> {
        Ok(match &self.vertex(id)?.kind {
            VertexKind::Atomic(_) => Shape::Activity { composite: false },
            VertexKind::Composite(_) => Shape::Activity { composite: true },
            VertexKind::Split { kind, .. } => Shape::Split(*kind),
            VertexKind::Join { kind, .. } => Shape::Join(*kind),
        })
    }

    /// Start the workflow by running the root's start vertex
    pub async fn start(&mut self, ctx: &ExecutionContext, agent: &AgentRef) -> Result<()> {
        let start = self
            .start_vertex(self.root())
            .ok_or_else(|| LifecycleError::InvalidData("Workflow has no start vertex".to_string()))?;
        info!(item = %self.item_id(), agent = %agent, "starting workflow");
        self.run_first(ctx, agent, start).await
    }

    /// `run` for the first vertex of a (sub)workflow
    pub fn run_first<'a>(&'a mut self, ctx: &'a ExecutionContext, agent: &'a AgentRef, id: VertexId) -> BoxFuture<'a, Result<()>> {
        self.run(ctx, agent, id)
    }

    pub fn run<'a>(&'a mut self, ctx: &'a ExecutionContext, agent: &'a AgentRef, id: VertexId) -> BoxFuture<'a, Result<()>> {
        async move {
            debug!(vertex = %id, path = %self.path(id), "run");
            match self.shape(id)? {
                Shape::Activity { composite } => self.run_activity(ctx, agent, id, composite).await,
                Shape::Split(kind) => self.run_split(ctx, agent, id, kind).await,
                Shape::Join(JoinKind::Route) => self.run_next(ctx, agent, id).await,
                Shape::Join(JoinKind::Join) => {
                    if self.has_active_predecessors(id)? {
                        debug!(vertex = %id, "join waiting for active branches");
                        Ok(())
                    } else {
                        self.run_next(ctx, agent, id).await
                    }
                }
            }
        }
        .boxed()
    }

    async fn run_activity(&mut self, ctx: &ExecutionContext, agent: &AgentRef, id: VertexId, composite: bool) -> Result<()> {
        self.activity_mut(id)?.active = true;
        if self.is_finished(ctx, id)? {
            self.run_next(ctx, agent, id).await?;
        } else {
            self.touch(id)?;
            self.push_jobs_to_agents(ctx, id);
        }

        if composite && !self.is_finished(ctx, id)? {
            if let Some(start) = self.start_vertex(id) {
                self.run_first(ctx, agent, start).await?;
            }
        }
        Ok(())
    }

    async fn run_split(&mut self, ctx: &ExecutionContext, agent: &AgentRef, id: VertexId, kind: SplitKind) -> Result<()> {
        let outgoing = self.vertex(id)?.outgoing.clone();
        match kind {
            SplitKind::And => {
                for next in outgoing {
                    self.run(ctx, agent, next).await?;
                }
            }
            SplitKind::Or | SplitKind::XOr => {
                let branches = self.routing_branches(id)?;
                if branches.is_empty() {
                    return Err(LifecycleError::InvalidData(format!("Split {} selected no branch", id)));
                }
                if kind == SplitKind::XOr && branches.len() != 1 {
                    return Err(LifecycleError::InvalidData(format!(
                        "XOr split {} selected {} branches",
                        id,
                        branches.len()
                    )));
                }
                for branch in branches {
                    self.run(ctx, agent, outgoing[branch]).await?;
                }
            }
            SplitKind::Loop => {
                let again = self.routing_expression(id)?.trim().eq_ignore_ascii_case("true");
                let edge = if again { 1 } else { 0 };
                let next = *outgoing.get(edge).ok_or_else(|| {
                    LifecycleError::InvalidData(format!("Loop split {} has no edge {}", id, edge))
                })?;
                if again {
                    self.reinit(ctx, next, id)?;
                }
                self.run(ctx, agent, next).await?;
            }
        }
        Ok(())
    }

    fn routing_expression(&self, id: VertexId) -> Result<String> {
        let props = self.vertex(id)?.properties();
        Ok(props
            .get_string(properties::ROUTING_EXPR)
            .map(|template| props.resolve(&template))
            .unwrap_or_default())
    }

    /// Edge indexes named by the split's routing expression
    fn routing_branches(&self, id: VertexId) -> Result<Vec<usize>> {
        let expression = self.routing_expression(id)?;
        let edges = self.vertex(id)?.outgoing.len();
        let mut branches = Vec::new();
        for alias in expression.split(',').map(str::trim).filter(|alias| !alias.is_empty()) {
            let branch = alias
                .parse::<usize>()
                .ok()
                .filter(|branch| *branch < edges)
                .ok_or_else(|| LifecycleError::InvalidData(format!("Split {} has no branch '{}'", id, alias)))?;
            if !branches.contains(&branch) {
                branches.push(branch);
            }
        }
        Ok(branches)
    }

    /// Whether an activity upstream of a join, back to the nearest splits,
    /// is still active
    fn has_active_predecessors(&self, join: VertexId) -> Result<bool> {
        let mut visited = HashSet::new();
        let mut pending = self.vertex(join)?.incoming.clone();
        while let Some(current) = pending.pop() {
            if !visited.insert(current) {
                continue;
            }
            let vertex = self.vertex(current)?;
            if vertex.is_split() {
                continue;
            }
            if vertex.activity().map_or(false, |activity| activity.active) {
                return Ok(true);
            }
            pending.extend(vertex.incoming.iter().copied());
        }
        Ok(false)
    }

    pub fn run_next<'a>(&'a mut self, ctx: &'a ExecutionContext, agent: &'a AgentRef, id: VertexId) -> BoxFuture<'a, Result<()>> {
        async move {
            match self.shape(id)? {
                Shape::Activity { composite: true } => {
                    if !self.is_finished(ctx, id)? {
                        match self.request(ctx, agent, id, COMPLETE, "").await {
                            // A finishing Complete has already cascaded past this
                            // composite, even if a loop has reset it since
                            Ok(_) => {
                                let machine = self.state_machine(ctx, id)?;
                                if machine.transition(COMPLETE).map_or(false, |t| t.is_finishing()) {
                                    return Ok(());
                                }
                            }
                            // The child's transition is already committed
                            Err(e) => warn!(vertex = %id, "composite could not complete itself: {}", e),
                        }
                    }
                    self.activity_run_next(ctx, agent, id).await
                }
                Shape::Activity { composite: false } => self.activity_run_next(ctx, agent, id).await,
                Shape::Split(_) | Shape::Join(_) => self.follow_next(ctx, agent, id).await,
            }
        }
        .boxed()
    }

    async fn activity_run_next(&mut self, ctx: &ExecutionContext, agent: &AgentRef, id: VertexId) -> Result<()> {
        self.activity_mut(id)?.active = false;
        let result = self.follow_next(ctx, agent, id).await;
        if let Err(e) = &result {
            if e.is_data_error() {
                self.activity_mut(id)?.active = true;
            }
        }
        result
    }

    /// Run the successor, or finish the enclosing graph
    async fn follow_next(&mut self, ctx: &ExecutionContext, agent: &AgentRef, id: VertexId) -> Result<()> {
        let vertex = self.vertex(id)?;
        let parent = vertex.parent;
        let first = vertex.outgoing.first().copied();

        if let Some(next) = first.filter(|next| self.leads_somewhere(*next)) {
            return self.run(ctx, agent, next).await;
        }

        match parent {
            Some(parent) if parent == self.root() => {
                // Finished but loopable
                if let Ok(activity) = self.activity_mut(id) {
                    activity.active = true;
                }
                debug!(vertex = %id, "workflow end reached");
                Ok(())
            }
            Some(parent) => self.run_next(ctx, agent, parent).await,
            None => Ok(()),
        }
    }

    /// Whether `next` reaches a non-join vertex, skipping over joins
    fn leads_somewhere(&self, next: VertexId) -> bool {
        let mut visited = HashSet::new();
        let mut current = Some(next);
        while let Some(id) = current {
            if !visited.insert(id) {
                return false;
            }
            let Ok(vertex) = self.vertex(id) else {
                return false;
            };
            if !vertex.is_join() {
                return true;
            }
            current = vertex.outgoing.first().copied();
        }
        false
    }

    /// Perform a transition on an activity
    ///
    /// Authorization, outcome and state checks all happen before any
    /// mutation. The new state, audit event and optional outcome are staged
    /// under a fresh locker and committed; on failure the transaction is
    /// aborted and the error returned, with the in-memory state already
    /// advanced. Returns the outcome payload.
    ///
    /// Requesting `Start` on an unfinished composite first enters its start
    /// child.
    pub fn request<'a>(
        &'a mut self,
        ctx: &'a ExecutionContext,
        agent: &'a AgentRef,
        id: VertexId,
        transition_id: TransitionId,
        request_data: &'a str,
    ) -> BoxFuture<'a, Result<String>> {
        async move {
            let Shape::Activity { composite } = self.shape(id)? else {
                return Err(LifecycleError::InvalidData(format!("{} is not an activity", self.path(id))));
            };
            if composite && transition_id == START && !self.is_finished(ctx, id)? {
                if let Some(start) = self.start_vertex(id) {
                    self.run_first(ctx, agent, start).await?;
                }
            }
            self.perform(ctx, agent, id, transition_id, request_data).await
        }
        .boxed()
    }

    async fn perform(
        &mut self,
        ctx: &ExecutionContext,
        agent: &AgentRef,
        id: VertexId,
        transition_id: TransitionId,
        request_data: &str,
    ) -> Result<String> {
        let item = self.item_id();
        let path = self.path(id);
        let machine = self.state_machine(ctx, id)?;
        let transition = machine.transition(transition_id).ok_or_else(|| {
            LifecycleError::ObjectNotFound(format!(
                "Transition {} not found in state machine {} v{}",
                transition_id, machine.name, machine.version
            ))
        })?;
        let directory = ctx.directory.as_ref();

        let activity = self.activity(id)?;
        let role = transition.performing_role(activity, agent, directory)?;
        let schema = transition.schema(&activity.properties)?;
        let has_data = !request_data.trim().is_empty();
        if schema.is_some() && !has_data && transition.outcome_required() {
            return Err(LifecycleError::InvalidData(format!(
                "Transition {} of {} requires an outcome",
                transition.name, activity.name
            )));
        }
        let view_name = activity.properties.non_empty(properties::VIEWPOINT);
        let breakpoint = activity.is_breakpoint();
        let old_state = machine.current_state(activity)?.clone();
        let new_state = machine.traverse(activity, transition, agent, directory)?.clone();

        let outcome = ctx
            .run_step_logic(agent, item, activity, transition, request_data)
            .await?;
        let reservation = transition.reservation_for(activity, agent);

        let activity = self.activity_mut(id)?;
        activity.set_state(new_state.id);
        activity.properties.put(AGENT_NAME, reservation.clone());

        let schema = schema.filter(|_| has_data);
        let records = TransitionRecords {
            event: Event {
                id: -1,
                agent: agent.name.clone(),
                role,
                activity_name: activity.name.clone(),
                activity_path: path.clone(),
                activity_type: activity.type_name.clone(),
                schema: schema.clone(),
                state_machine_name: machine.name.clone(),
                state_machine_version: machine.version,
                transition_id: transition.id,
                transition_name: transition.name.clone(),
                origin_state: old_state.id,
                target_state: new_state.id,
                view_name: view_name.clone().filter(|_| schema.is_some()),
                timestamp: activity.state_date,
            },
            state: ActivityStateRecord {
                activity_path: path.clone(),
                state: new_state.id,
                state_name: new_state.name.clone(),
                active: activity.active,
                agent_name: reservation,
                state_date: activity.state_date,
            },
            outcome: schema.map(|schema| (schema, outcome.clone())),
            view_name,
        };

        let locker = Locker::new();
        let event_id = match stage_and_commit(ctx, item, &locker, records).await {
            Ok(event_id) => event_id,
            Err(e) => {
                ctx.storage.abort(&locker);
                warn!(item = %item, activity = %path, transition = %transition.name, "transition not persisted: {}", e);
                return Err(e);
            }
        };
        info!(
            item = %item,
            activity = %path,
            agent = %agent,
            event = event_id,
            "{}: {} -> {}",
            transition.name,
            old_state.name,
            new_state.name
        );

        if new_state.is_finished() && !(breakpoint && !old_state.is_finished()) {
            self.run_next(ctx, agent, id).await?;
        }

        self.touch(id)?;
        self.push_jobs_to_agents(ctx, id);
        Ok(outcome)
    }
}

/// Stage one transition's records under `locker` and commit them
async fn stage_and_commit(ctx: &ExecutionContext, item: ItemId, locker: &Locker, records: TransitionRecords) -> Result<i32> {
    let TransitionRecords {
        event,
        state,
        outcome,
        view_name,
    } = records;

    let event = History::new(ctx.storage.clone(), item).add_event(event, locker).await?;
    ctx.storage.put(item, Record::ActivityState(state), Some(locker)).await?;

    if let Some((schema, data)) = outcome {
        ctx.storage
            .put(
                item,
                Record::Outcome(OutcomeRecord {
                    schema: schema.clone(),
                    event_id: event.id,
                    data,
                }),
                Some(locker),
            )
            .await?;

        let mut views = vec![LAST_VIEW.to_string()];
        if let Some(name) = view_name.filter(|name| name != LAST_VIEW) {
            views.insert(0, name);
        }
        for name in views {
            ctx.storage
                .put(
                    item,
                    Record::Viewpoint(Viewpoint {
                        schema_name: schema.name.clone(),
                        name,
                        event_id: event.id,
                    }),
                    Some(locker),
                )
                .await?;
        }
    }

    ctx.storage.commit(locker).await?;
    Ok(event.id)
}
