// Persisted records written by transitions

//! # Persisted Records
//!
//! Every successful transition leaves a trail in the item's storage:
//!
//! - an [`Event`] in the audit trail, always
//! - an [`ActivityStateRecord`] with the activity's new lifecycle state
//! - an [`OutcomeRecord`] plus one or two [`Viewpoint`]s when the transition
//!   produced an outcome document
//!
//! Records are addressed by a slash-delimited cluster path that is unique
//! within the owning item; [`Record::cluster_path`] derives it from the
//! record's content, so storing a record twice replaces it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::StateId;
use super::transition::{SchemaRef, TransitionId};

pub const AUDIT_TRAIL: &str = "AuditTrail";
pub const OUTCOME: &str = "Outcome";
pub const VIEWPOINT: &str = "ViewPoint";
pub const LIFECYCLE: &str = "LifeCycle";

/// View name updated with every outcome of a schema
pub const LAST_VIEW: &str = "last";

/// Audit trail entry for one performed transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: i32,
    pub agent: String,
    pub role: Option<String>,
    pub activity_name: String,
    pub activity_path: String,
    pub activity_type: String,
    pub schema: Option<SchemaRef>,
    pub state_machine_name: String,
    pub state_machine_version: i32,
    pub transition_id: TransitionId,
    pub transition_name: String,
    pub origin_state: StateId,
    pub target_state: StateId,
    pub view_name: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Outcome document attached to an event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub schema: SchemaRef,
    pub event_id: i32,
    pub data: String,
}

/// Named pointer to the latest outcome of a schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Viewpoint {
    pub schema_name: String,
    pub name: String,
    pub event_id: i32,
}

/// Lifecycle state of one activity as of its last transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityStateRecord {
    pub activity_path: String,
    pub state: StateId,
    pub state_name: String,
    pub active: bool,
    pub agent_name: String,
    pub state_date: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Record {
    Event(Event),
    Outcome(OutcomeRecord),
    Viewpoint(Viewpoint),
    ActivityState(ActivityStateRecord),
}

impl Record {
    pub fn cluster_path(&self) -> String {
        match self {
            Record::Event(event) => format!("{}/{}", AUDIT_TRAIL, event.id),
            Record::Outcome(outcome) => format!(
                "{}/{}/{}/{}",
                OUTCOME, outcome.schema.name, outcome.schema.version, outcome.event_id
            ),
            Record::Viewpoint(view) => format!("{}/{}/{}", VIEWPOINT, view.schema_name, view.name),
            Record::ActivityState(state) => format!("{}/{}", LIFECYCLE, state.activity_path),
        }
    }
}

impl From<Event> for Record {
    fn from(event: Event) -> Self {
        Record::Event(event)
    }
}

impl From<OutcomeRecord> for Record {
    fn from(outcome: OutcomeRecord) -> Self {
        Record::Outcome(outcome)
    }
}

impl From<Viewpoint> for Record {
    fn from(view: Viewpoint) -> Self {
        Record::Viewpoint(view)
    }
}

impl From<ActivityStateRecord> for Record {
    fn from(state: ActivityStateRecord) -> Self {
        Record::ActivityState(state)
    }
}
