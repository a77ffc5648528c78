// Lifecycle Kernel
// Workflow execution engine and transactional persistence for long-lived items

//! # Lifecycle Kernel Library
//!
//! Every item in the system carries a workflow instance: a graph of activities,
//! each bound to a declarative state machine. Agents advance the workflow by
//! requesting transitions on activities. A request is authorized against the
//! agent's roles, validated against the state machine, applied to the
//! in-memory graph and then durably recorded through the transaction manager
//! (new state record, audit event, optional outcome and view pointers) before
//! completion cascades to the next vertex or bubbles up to the parent
//! composite.
//!
//! ## Core Components
//!
//! ### Domain Models (`models`)
//! - [`StateMachine`], [`State`], [`Transition`]: the validated state graph
//! - [`Activity`] / [`CompositeActivity`]: workflow vertices bound to a machine
//! - [`Properties`]: the per-activity property bag with `${name}` templates
//! - [`Job`]: one performable transition offered to one agent
//! - [`Record`]: the persisted records (events, outcomes, viewpoints, states)
//!
//! ### Engine (`engine`)
//! - [`Workflow`]: the vertex arena and the graph walker (`run`, `run_next`,
//!   `request`, `reinit`, `verify`, job calculation)
//! - [`TransactionManager`]: per-item lock table plus per-locker staged writes
//! - [`ExecutionContext`]: storage, directory, definitions and dispatch handles
//!   passed explicitly into every entry point
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use lifecycle_kernel::{
//!     AgentRef, ExecutionContext, InMemoryClusterStorage, InMemoryDefinitions,
//!     InMemoryDirectory, ItemId, TransactionManager, Workflow,
//! };
//!
//! # async fn demo() -> lifecycle_kernel::Result<()> {
//! let storage = Arc::new(TransactionManager::new(Arc::new(InMemoryClusterStorage::new())));
//! let ctx = ExecutionContext::new(
//!     storage,
//!     Arc::new(InMemoryDirectory::new()),
//!     Arc::new(InMemoryDefinitions::with_bootstrap()),
//! );
//!
//! let mut workflow = Workflow::new(ItemId::new());
//! let root = workflow.root();
//! let step = workflow.add_atomic(root, "Review", true)?;
//!
//! let agent = AgentRef::new("alice");
//! workflow.start(&ctx, &agent).await?;
//! let jobs = workflow.calculate_jobs(&ctx, &agent, root, true)?;
//! # let _ = (step, jobs);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod logging;
pub mod models;

pub use models::{
    Activity, ActivityStateRecord, AgentRef, CompositeActivity, Event, ItemId, Job, JoinKind,
    OutcomeRecord, OutcomeRequirement, Properties, Record, ReservationPolicy, RoleRef, SchemaRef,
    ScriptRef, ScriptRequirement, SplitKind, State, StateId, StateMachine, Transition,
    TransitionId, Vertex, VertexId, VertexKind, Viewpoint,
};

pub use engine::{
    AgentNotifier, ClusterStorage, DefinitionLoader, Directory, ExecutionContext, History,
    InMemoryClusterStorage, InMemoryDefinitions, InMemoryDirectory, JobDispatcher, Locker,
    StepLogic, TransactionManager, Workflow,
};

pub use config::EngineConfig;

use thiserror::Error;

/// Error taxonomy of the execution engine and its persistence layer
///
/// Everything except [`LifecycleError::CommitFailed`] is an ordinary
/// recoverable error handed back to the immediate caller. The engine never
/// retries internally.
#[derive(Error, Debug)]
pub enum LifecycleError {
    /// Malformed or missing definitions, bad version numbers, missing
    /// mandatory outcome data
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Disabled transition, wrong owner or missing role
    #[error("Access denied: {0}")]
    AccessRights(String),

    /// The requested transition does not start from the activity's current state
    #[error("Transition '{transition}' not valid from state '{state}'")]
    InvalidTransition { transition: String, state: String },

    /// Staging failure: lock held by another locker, read of a staged delete
    #[error("Persistency error: {0}")]
    Persistency(String),

    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    #[error("Object already exists: {0}")]
    ObjectAlreadyExists(String),

    /// Commit-time flush failed; the backing store may be inconsistent
    #[error("Commit failed, store may be inconsistent: {0}")]
    CommitFailed(String),

    /// Backing store or collaborator failure
    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ::config::ConfigError),
}

impl LifecycleError {
    /// Data/definition errors, the only kind that re-activates an activity
    /// during a completion cascade
    pub fn is_data_error(&self) -> bool {
        matches!(self, LifecycleError::InvalidData(_))
    }

    /// Authorization failures, reported to users as "not permitted"
    pub fn is_access_error(&self) -> bool {
        matches!(self, LifecycleError::AccessRights(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, LifecycleError::ObjectNotFound(_))
    }
}

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, LifecycleError>;
