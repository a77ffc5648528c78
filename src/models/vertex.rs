// Workflow graph vertices - arena nodes addressed by id

use serde::{Deserialize, Serialize};
use std::fmt;

use super::activity::{Activity, CompositeActivity};
use super::properties::Properties;

/// Position of a vertex in its workflow's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VertexId(pub usize);

impl fmt::Display for VertexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SplitKind {
    /// Runs every outgoing branch
    And,
    /// Runs the branches selected by `RoutingExpr`
    Or,
    /// Runs exactly one branch selected by `RoutingExpr`
    XOr,
    /// Edge 1 loops back while `RoutingExpr` resolves to `true`, edge 0 exits
    Loop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinKind {
    /// Waits until no upstream activity is active
    Join,
    /// Passes straight through
    Route,
}

/// Vertex variants, each obeying the run / run_next / reinit / verify contract
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum VertexKind {
    Atomic(Activity),
    Composite(CompositeActivity),
    Split { kind: SplitKind, properties: Properties },
    Join { kind: JoinKind, properties: Properties },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vertex {
    pub id: VertexId,
    pub name: String,
    /// Owning composite; `None` only for the workflow root
    pub parent: Option<VertexId>,
    pub kind: VertexKind,
    pub incoming: Vec<VertexId>,
    pub outgoing: Vec<VertexId>,
}

impl Vertex {
    pub fn new<S: Into<String>>(id: VertexId, name: S, parent: Option<VertexId>, kind: VertexKind) -> Self {
        Vertex {
            id,
            name: name.into(),
            parent,
            kind,
            incoming: Vec::new(),
            outgoing: Vec::new(),
        }
    }

    /// The activity part of atomic and composite vertices
    pub fn activity(&self) -> Option<&Activity> {
        match &self.kind {
            VertexKind::Atomic(activity) => Some(activity),
            VertexKind::Composite(composite) => Some(&composite.activity),
            _ => None,
        }
    }

    pub fn activity_mut(&mut self) -> Option<&mut Activity> {
        match &mut self.kind {
            VertexKind::Atomic(activity) => Some(activity),
            VertexKind::Composite(composite) => Some(&mut composite.activity),
            _ => None,
        }
    }

    pub fn composite(&self) -> Option<&CompositeActivity> {
        match &self.kind {
            VertexKind::Composite(composite) => Some(composite),
            _ => None,
        }
    }

    pub fn properties(&self) -> &Properties {
        match &self.kind {
            VertexKind::Atomic(activity) => &activity.properties,
            VertexKind::Composite(composite) => &composite.activity.properties,
            VertexKind::Split { properties, .. } | VertexKind::Join { properties, .. } => properties,
        }
    }

    pub fn properties_mut(&mut self) -> &mut Properties {
        match &mut self.kind {
            VertexKind::Atomic(activity) => &mut activity.properties,
            VertexKind::Composite(composite) => &mut composite.activity.properties,
            VertexKind::Split { properties, .. } | VertexKind::Join { properties, .. } => properties,
        }
    }

    pub fn is_activity(&self) -> bool {
        matches!(self.kind, VertexKind::Atomic(_) | VertexKind::Composite(_))
    }

    pub fn is_composite(&self) -> bool {
        matches!(self.kind, VertexKind::Composite(_))
    }

    pub fn is_join(&self) -> bool {
        matches!(self.kind, VertexKind::Join { .. })
    }

    pub fn is_split(&self) -> bool {
        matches!(self.kind, VertexKind::Split { .. })
    }
}
