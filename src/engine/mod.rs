// Lifecycle Engine
// Workflow execution, transactional persistence and job dispatch

//! # Engine Module
//!
//! The engine is the layer between the domain models and the outside world:
//! it walks workflow graphs, authorizes and applies transitions, and records
//! their effects durably.
//!
//! ## Engine Components
//!
//! ### Workflow (`workflow`, `execution` modules)
//! - Vertex arena with composites, splits and joins
//! - Structural checks (`verify`), re-initialization for loops
//! - The asynchronous walk: `run`, `run_next` and the transactional `request`
//! - Job calculation and best-effort push to subscribed agents
//!
//! ### Persistence (`storage`, `transaction`, `history` modules)
//! - [`ClusterStorage`]: the backing store contract plus an in-memory store
//! - [`TransactionManager`]: per-item locks and per-locker staged writes,
//!   flushed on commit
//! - [`History`]: the audit trail with monotonically numbered events
//!
//! ### Collaborators (`directory`, `definitions`, `dispatch`, `context`)
//! - [`Directory`]: role and agent lookups
//! - [`DefinitionLoader`]: state machine definitions by name and version
//! - [`JobDispatcher`]: bounded queue in front of an [`AgentNotifier`]
//! - [`ExecutionContext`]: the handles above, passed into every entry point
//!
//! ## Rust Learning Notes:
//!
//! ### Traits at the Seams
//! Storage, directory, definitions and notification are traits so the engine
//! can run against in-memory implementations in tests and real backends in
//! production. The traits are `Send + Sync` so they can sit behind `Arc`.

pub mod context;
pub mod definitions;
pub mod directory;
pub mod dispatch;
pub mod execution;
pub mod history;
pub mod storage;
pub mod transaction;
pub mod workflow;


pub use context::{ExecutionContext, StepLogic};
pub use definitions::{DefinitionLoader, InMemoryDefinitions};
pub use directory::{Directory, InMemoryDirectory};
pub use dispatch::{AgentNotifier, DispatchStats, JobDispatcher, JobNotification, RecordingNotifier};
pub use history::History;
pub use storage::{ClusterStorage, InMemoryClusterStorage};
pub use transaction::{CommitFailurePolicy, Locker, TransactionManager};
pub use workflow::Workflow;
