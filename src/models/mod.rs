// Core domain models for the lifecycle kernel
// Definitions and per-item state, free of storage and dispatch concerns

//! # Domain Models Module
//!
//! This module contains the data structures the engine walks:
//!
//! - **Definitions**: [`State`], [`Transition`] and [`StateMachine`], loaded
//!   once and shared behind `Arc`
//! - **Workflow state**: [`Activity`], [`CompositeActivity`] and the
//!   [`Vertex`] arena nodes that hold them
//! - **Records**: what a transition persists ([`Event`], [`OutcomeRecord`],
//!   [`Viewpoint`], [`ActivityStateRecord`])
//! - **Jobs**: what agents are offered ([`Job`])
//!
//! ## Rust Learning Notes:
//!
//! ### Re-exports for Clean APIs
//! The `pub use` statements at the bottom create a flat API, so users can
//! import `lifecycle_kernel::models::Transition` instead of
//! `lifecycle_kernel::models::transition::Transition`.

pub mod activity;
pub mod identity;
pub mod job;
pub mod properties;
pub mod records;
pub mod state;
pub mod state_machine;
pub mod transition;
pub mod vertex;

pub use activity::{Activity, CompositeActivity};
pub use identity::{AgentRef, ItemId, RoleRef, ADMIN_ROLE};
pub use job::Job;
pub use properties::{resolve_placeholders, Properties};
pub use records::{ActivityStateRecord, Event, OutcomeRecord, Record, Viewpoint, LAST_VIEW};
pub use state::{State, StateId};
pub use state_machine::{StateMachine, COMPLETE, COMPOSITE_MACHINE, DEFAULT_MACHINE, START};
pub use transition::{
    OutcomeRequirement, ReservationPolicy, SchemaRef, ScriptRef, ScriptRequirement, Transition,
    TransitionId,
};
pub use vertex::{JoinKind, SplitKind, Vertex, VertexId, VertexKind};
