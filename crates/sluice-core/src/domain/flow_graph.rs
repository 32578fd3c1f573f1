//! The flow graph model: an immutable, parsed description of a flow.
//!
//! A definition is an ordered set of nodes. Each node declares its outgoing
//! events, at most one jober (automatic task) or manual task, and an ordered
//! list of filters applied to a context batch before the node's work runs.

use crate::error::FlowError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Unique identifier for a flow definition
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowId(pub String);

/// Unique identifier for a node within a flow graph
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub String);

/// Unique identifier for an event (edge) within a flow graph
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub String);

/// The kind of a node, dispatched on by the executor and the rule set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    /// Entry node, receives offered data
    Start,
    /// Ordinary worked node
    State,
    /// Routes to the first outgoing event whose condition matches
    Condition,
    /// Fans the batch out to every outgoing event
    Parallel,
    /// Terminal node, archives arriving contexts
    End,
}

impl NodeKind {
    /// The external shape-type tag for this kind
    pub fn type_tag(&self) -> &'static str {
        match self {
            NodeKind::Start => "startNodeState",
            NodeKind::State => "state",
            NodeKind::Condition => "conditionState",
            NodeKind::Parallel => "parallelState",
            NodeKind::End => "endNodeState",
        }
    }

    /// Resolve an external shape-type tag into a node kind
    pub fn from_type_tag(tag: &str) -> Option<Self> {
        match tag {
            "startNodeState" => Some(NodeKind::Start),
            "state" => Some(NodeKind::State),
            "conditionState" => Some(NodeKind::Condition),
            "parallelState" => Some(NodeKind::Parallel),
            "endNodeState" => Some(NodeKind::End),
            _ => None,
        }
    }

    /// Terminal nodes archive contexts instead of routing them onward
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeKind::End)
    }
}

/// An edge between two nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowEvent {
    /// Unique id of the event
    pub meta_id: EventId,

    /// Human-readable name
    pub name: String,

    /// The node this event leaves
    pub from: NodeId,

    /// The node this event enters
    pub to: NodeId,

    /// Condition expression gating this event (condition nodes only).
    /// An event without a rule on a condition node is the default branch.
    pub condition_rule: Option<String>,

    /// Which connector of the source shape the event was drawn from
    pub defined_from_connector: Option<String>,
}

/// The kind of an automatic task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoberKind {
    /// Invokes its fitables in declared order, chaining outputs
    General,
    /// Passes the batch through unchanged; declares no fitables
    Echo,
}

impl JoberKind {
    /// The external type tag for this jober kind
    pub fn type_tag(&self) -> &'static str {
        match self {
            JoberKind::General => "generalJober",
            JoberKind::Echo => "echoJober",
        }
    }

    /// Resolve an external type tag into a jober kind
    pub fn from_type_tag(tag: &str) -> Option<Self> {
        match tag {
            "generalJober" => Some(JoberKind::General),
            "echoJober" => Some(JoberKind::Echo),
            _ => None,
        }
    }
}

/// An automatic task bound to a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowJober {
    /// The jober kind
    pub kind: JoberKind,

    /// Target callables, invoked in order with the filtered batch
    pub fitables: Vec<String>,

    /// Callables notified when a fitable invocation fails
    pub exception_fitables: Vec<String>,

    /// Arbitrary configuration carried through from the graph
    #[serde(default)]
    pub properties: HashMap<String, serde_json::Value>,
}

/// The kind of a manual task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskKind {
    /// Operator reviews the batch; fitables (if any) run on resolution
    Approval,
    /// Operator releases the batch unchanged; declares no fitables
    Echo,
}

impl TaskKind {
    /// The external type tag for this task kind
    pub fn type_tag(&self) -> &'static str {
        match self {
            TaskKind::Approval => "approvalTask",
            TaskKind::Echo => "echoTask",
        }
    }

    /// Resolve an external type tag into a task kind
    pub fn from_type_tag(tag: &str) -> Option<Self> {
        match tag {
            "approvalTask" => Some(TaskKind::Approval),
            "echoTask" => Some(TaskKind::Echo),
            _ => None,
        }
    }
}

/// A manual task bound to a node; the flow suspends at this node until an
/// operator resolves each arriving batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowTask {
    /// External id the operator uses to find pending batches
    pub task_id: String,

    /// The task kind
    pub kind: TaskKind,

    /// Callables run over the operated batch after resolution
    pub fitables: Vec<String>,

    /// Callables notified when a post-resolution fitable fails
    pub exception_fitables: Vec<String>,

    /// Arbitrary configuration carried through from the graph
    #[serde(default)]
    pub properties: HashMap<String, serde_json::Value>,
}

/// The kind of a filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterKind {
    /// Holds the batch until it reaches a threshold, then caps it there
    MinimumSize,
}

impl FilterKind {
    /// The external type tag for this filter kind
    pub fn type_tag(&self) -> &'static str {
        match self {
            FilterKind::MinimumSize => "minimumSize",
        }
    }

    /// Resolve an external type tag into a filter kind
    pub fn from_type_tag(tag: &str) -> Option<Self> {
        match tag {
            "minimumSize" => Some(FilterKind::MinimumSize),
            _ => None,
        }
    }
}

/// Property key holding a minimum-size filter's threshold
pub const FILTER_THRESHOLD_PROPERTY: &str = "threshold";

/// A typed batch filter. Properties stay in raw string form so that a bad
/// value is a validation error, never a parse error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowFilter {
    /// The filter kind
    pub kind: FilterKind,

    /// Raw filter properties as carried by the graph shape
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl FlowFilter {
    /// Build a minimum-size filter with the given threshold
    pub fn minimum_size(threshold: usize) -> Self {
        let mut properties = HashMap::new();
        properties.insert(FILTER_THRESHOLD_PROPERTY.to_string(), threshold.to_string());
        Self {
            kind: FilterKind::MinimumSize,
            properties,
        }
    }

    /// The coerced threshold of a minimum-size filter.
    /// The rule set calls this during validation, so execution can rely on
    /// it succeeding for any activated definition.
    pub fn threshold(&self) -> Result<usize, FlowError> {
        let raw = self
            .properties
            .get(FILTER_THRESHOLD_PROPERTY)
            .ok_or_else(|| {
                FlowError::InvalidFlowParam(format!(
                    "{} filter is missing its '{}' property",
                    self.kind.type_tag(),
                    FILTER_THRESHOLD_PROPERTY
                ))
            })?;

        let threshold = raw.trim().parse::<usize>().map_err(|_| {
            FlowError::InvalidFlowParam(format!(
                "{} filter threshold '{}' is not an integer",
                self.kind.type_tag(),
                raw
            ))
        })?;

        if threshold == 0 {
            return Err(FlowError::InvalidFlowParam(format!(
                "{} filter threshold must be at least 1",
                self.kind.type_tag()
            )));
        }

        Ok(threshold)
    }

    /// How many elements of a batch of the given size pass this filter.
    ///
    /// The minimum-size filter gates and caps in one step: a batch below the
    /// threshold passes nothing, a batch at or above it passes exactly
    /// `threshold` elements. It never chunks the batch into threshold-sized
    /// windows.
    pub fn allowed(&self, batch_len: usize) -> Result<usize, FlowError> {
        match self.kind {
            FilterKind::MinimumSize => {
                let threshold = self.threshold()?;
                if batch_len < threshold {
                    Ok(0)
                } else {
                    Ok(threshold)
                }
            }
        }
    }

    /// Apply this filter to a batch, preserving element order
    pub fn apply<T>(&self, batch: Vec<T>) -> Result<Vec<T>, FlowError> {
        let allowed = self.allowed(batch.len())?;
        let mut batch = batch;
        batch.truncate(allowed);
        Ok(batch)
    }
}

/// One node of a flow graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowNode {
    /// Unique id of the node
    pub meta_id: NodeId,

    /// Human-readable name
    pub name: String,

    /// The node kind
    pub kind: NodeKind,

    /// Outgoing events, in declared order
    pub events: Vec<FlowEvent>,

    /// Automatic task, mutually exclusive with `task`
    pub jober: Option<FlowJober>,

    /// Manual task, mutually exclusive with `jober`
    pub task: Option<FlowTask>,

    /// Batch filters, applied in declared order before the node's work
    pub filters: Vec<FlowFilter>,

    /// Arbitrary node configuration carried through from the graph
    #[serde(default)]
    pub properties: HashMap<String, serde_json::Value>,
}

impl FlowNode {
    /// How many elements of a batch of the given size pass every filter,
    /// applying filters in declared order
    pub fn allowed_by_filters(&self, batch_len: usize) -> Result<usize, FlowError> {
        let mut allowed = batch_len;
        for filter in &self.filters {
            allowed = filter.allowed(allowed)?;
        }
        Ok(allowed)
    }

    /// Run every filter over the batch in declared order
    pub fn apply_filters<T>(&self, batch: Vec<T>) -> Result<Vec<T>, FlowError> {
        let allowed = self.allowed_by_filters(batch.len())?;
        let mut batch = batch;
        batch.truncate(allowed);
        Ok(batch)
    }

    /// Whether arriving contexts are archived here
    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }
}

/// A parsed flow graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    /// Unique id of the flow
    pub id: FlowId,

    /// Human-readable name
    pub name: String,

    /// Definition version string
    pub version: String,

    /// The nodes of the graph, in declared order
    pub nodes: Vec<FlowNode>,
}

impl FlowDefinition {
    /// Look up a node by id
    pub fn node(&self, id: &NodeId) -> Option<&FlowNode> {
        self.nodes.iter().find(|node| &node.meta_id == id)
    }

    /// The start node of the graph
    pub fn start_node(&self) -> Result<&FlowNode, FlowError> {
        self.nodes
            .iter()
            .find(|node| node.kind == NodeKind::Start)
            .ok_or_else(|| {
                FlowError::NodeNotFound(format!("flow '{}' has no start node", self.id.0))
            })
    }

    /// Whether the graph declares a node with this id
    pub fn contains_node(&self, id: &NodeId) -> bool {
        self.node(id).is_some()
    }
}
