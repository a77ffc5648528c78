// Jobs - performable transitions offered to agents

use serde::{Deserialize, Serialize};

use super::identity::ItemId;
use super::transition::{SchemaRef, ScriptRef, TransitionId};

/// One transition an agent may currently perform on one activity
///
/// Jobs are what agents receive when the engine pushes work to them. They
/// carry the resolved outcome schema and script so the agent knows what to
/// supply with the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub item_id: ItemId,
    pub activity_path: String,
    pub activity_name: String,
    pub transition_id: TransitionId,
    pub transition_name: String,
    pub agent: String,
    /// Role the agent would act under; `None` for open transitions
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<SchemaRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<ScriptRef>,
}

impl Job {
    /// Serialized job list as delivered to agents
    pub fn serialize_list(jobs: &[Job]) -> crate::Result<String> {
        Ok(serde_json::to_string(jobs)?)
    }
}
