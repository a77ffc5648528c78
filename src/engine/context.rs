// Execution context passed into every engine entry point

//! # Execution Context
//!
//! The engine has no process-wide registry. Every operation receives an
//! [`ExecutionContext`] carrying the handles it may use:
//!
//! - the [`TransactionManager`] all writes go through
//! - the [`Directory`] for role and agent lookups
//! - the [`DefinitionLoader`] that binds activities to state machines
//! - an optional [`JobDispatcher`]; without one, job pushes are skipped
//! - the [`StepLogic`] registry, keyed by activity type
//!
//! The context is cheap to clone: every field is an `Arc`.

use dashmap::DashMap;
use std::sync::Arc;

use super::definitions::DefinitionLoader;
use super::directory::Directory;
use super::dispatch::JobDispatcher;
use super::transaction::TransactionManager;
use crate::models::{Activity, AgentRef, ItemId, Transition};
use crate::Result;

/// Extension hook turning request data into the outcome payload
///
/// Runs after authorization and state validation, before any mutation.
/// Registered per activity type; activities without one use the request data
/// unchanged.
#[async_trait::async_trait]
pub trait StepLogic: Send + Sync {
    async fn run(
        &self,
        agent: &AgentRef,
        item: ItemId,
        activity: &Activity,
        transition: &Transition,
        request_data: &str,
    ) -> Result<String>;
}

#[derive(Clone)]
pub struct ExecutionContext {
    pub storage: Arc<TransactionManager>,
    pub directory: Arc<dyn Directory>,
    pub definitions: Arc<dyn DefinitionLoader>,
    pub dispatcher: Option<Arc<JobDispatcher>>,
    step_logic: Arc<DashMap<String, Arc<dyn StepLogic>>>,
}

impl ExecutionContext {
    pub fn new(storage: Arc<TransactionManager>, directory: Arc<dyn Directory>, definitions: Arc<dyn DefinitionLoader>) -> Self {
        ExecutionContext {
            storage,
            directory,
            definitions,
            dispatcher: None,
            step_logic: Arc::new(DashMap::new()),
        }
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<JobDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Register the step logic for one activity type
    pub fn register_step_logic<S: Into<String>>(&self, activity_type: S, logic: Arc<dyn StepLogic>) {
        self.step_logic.insert(activity_type.into(), logic);
    }

    /// Run the registered step logic, or pass the request data through
    pub async fn run_step_logic(
        &self,
        agent: &AgentRef,
        item: ItemId,
        activity: &Activity,
        transition: &Transition,
        request_data: &str,
    ) -> Result<String> {
        let logic = self
            .step_logic
            .get(&activity.type_name)
            .map(|entry| entry.value().clone());
        match logic {
            Some(logic) => logic.run(agent, item, activity, transition, request_data).await,
            None => Ok(request_data.to_string()),
        }
    }
}
