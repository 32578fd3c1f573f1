use crate::error::GraphError;
use sluice_core::domain::flow_graph::{FlowDefinition, FlowFilter, FlowJober, FlowNode, FlowTask};
use std::error::Error;
use std::fmt;

mod attachment_rules;
mod flow_rules;
mod node_rules;

/// Represents a validation rule violation found in a flow graph
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// Error code (should be a constant identifier)
    pub code: &'static str,

    /// Human-readable error message
    pub message: String,

    /// Optional path to the location of the error (e.g., "node[router]")
    pub path: Option<String>,
}

impl ValidationError {
    /// Build a violation scoped to one node
    pub fn at_node(code: &'static str, node: &FlowNode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            path: Some(format!("node[{}]", node.meta_id.0)),
        }
    }

    /// Build a violation scoped to the whole flow
    pub fn at_flow(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            path: None,
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(path) = &self.path {
            write!(f, "{}: {} (at {})", self.code, self.message, path)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

impl Error for ValidationError {}

/// Validation error codes
pub mod error_codes {
    /// The flow declares no nodes
    pub const EMPTY_FLOW: &str = "ERR_GRAPH_VALIDATION_EMPTY_FLOW";

    /// Duplicate node or event id found
    pub const DUPLICATE_ID: &str = "ERR_GRAPH_VALIDATION_DUPLICATE_ID";

    /// Start node count is not exactly one
    pub const START_NODE_COUNT: &str = "ERR_GRAPH_VALIDATION_START_NODE_COUNT";

    /// No end node declared
    pub const END_NODE_MISSING: &str = "ERR_GRAPH_VALIDATION_END_NODE_MISSING";

    /// An event endpoint names an undeclared node
    pub const INVALID_REFERENCE: &str = "ERR_GRAPH_VALIDATION_INVALID_REFERENCE";

    /// A node declares the wrong number of outgoing events for its kind
    pub const EVENT_COUNT: &str = "ERR_GRAPH_VALIDATION_EVENT_COUNT";

    /// A condition node's outgoing events are missing condition rules
    pub const CONDITION_RULE_MISSING: &str = "ERR_GRAPH_VALIDATION_CONDITION_RULE_MISSING";

    /// A node carries an attachment its kind forbids
    pub const FORBIDDEN_ATTACHMENT: &str = "ERR_GRAPH_VALIDATION_FORBIDDEN_ATTACHMENT";

    /// A node declares both a jober and a manual task
    pub const TASK_CONFLICT: &str = "ERR_GRAPH_VALIDATION_TASK_CONFLICT";

    /// A jober's fitable declaration is wrong for its kind
    pub const JOBER_FITABLES: &str = "ERR_GRAPH_VALIDATION_JOBER_FITABLES";

    /// A manual task's fitable declaration is wrong for its kind
    pub const TASK_FITABLES: &str = "ERR_GRAPH_VALIDATION_TASK_FITABLES";

    /// A manual task is missing its task id
    pub const TASK_ID_MISSING: &str = "ERR_GRAPH_VALIDATION_TASK_ID_MISSING";

    /// A fitable id does not match the accepted identifier format
    pub const INVALID_FITABLE_ID: &str = "ERR_GRAPH_VALIDATION_INVALID_FITABLE_ID";

    /// A filter property does not coerce to a legal value
    pub const INVALID_THRESHOLD: &str = "ERR_GRAPH_VALIDATION_INVALID_THRESHOLD";
}

/// A rule checked once against the whole flow
pub trait FlowRule: Send + Sync {
    /// Check the rule, reporting the first violation
    fn apply(&self, definition: &FlowDefinition) -> Result<(), ValidationError>;
}

/// A rule checked against every node
pub trait NodeRule: Send + Sync {
    /// Check the rule, reporting the first violation
    fn apply(&self, node: &FlowNode) -> Result<(), ValidationError>;
}

/// A rule checked against every jober
pub trait JoberRule: Send + Sync {
    /// Check the rule, reporting the first violation
    fn apply(&self, node: &FlowNode, jober: &FlowJober) -> Result<(), ValidationError>;
}

/// A rule checked against every manual task
pub trait TaskRule: Send + Sync {
    /// Check the rule, reporting the first violation
    fn apply(&self, node: &FlowNode, task: &FlowTask) -> Result<(), ValidationError>;
}

/// A rule checked against every filter
pub trait FilterRule: Send + Sync {
    /// Check the rule, reporting the first violation
    fn apply(&self, node: &FlowNode, filter: &FlowFilter) -> Result<(), ValidationError>;
}

/// The registered rules, run in deterministic order.
///
/// Validation is fail-fast: the first violated rule raises, so callers get
/// one precise error rather than a digest. New invariants are added by
/// registering another rule, not by editing existing rule bodies.
pub struct RuleSet {
    flow_rules: Vec<Box<dyn FlowRule>>,
    node_rules: Vec<Box<dyn NodeRule>>,
    jober_rules: Vec<Box<dyn JoberRule>>,
    task_rules: Vec<Box<dyn TaskRule>>,
    filter_rules: Vec<Box<dyn FilterRule>>,
}

impl RuleSet {
    /// The standard rule inventory
    pub fn standard() -> Self {
        Self {
            flow_rules: vec![
                Box::new(flow_rules::NonEmptyFlowRule),
                Box::new(flow_rules::UniqueNodeIdRule),
                Box::new(flow_rules::UniqueEventIdRule),
                Box::new(flow_rules::SingleStartNodeRule),
                Box::new(flow_rules::EndNodePresenceRule),
                Box::new(flow_rules::EventEndpointsRule),
            ],
            node_rules: vec![
                Box::new(node_rules::NodeEventCountRule),
                Box::new(node_rules::ConditionBranchRule),
                Box::new(node_rules::TerminalNodeAttachmentRule),
                Box::new(node_rules::JoberTaskExclusiveRule),
            ],
            jober_rules: vec![
                Box::new(attachment_rules::JoberFitablesRule),
                Box::new(attachment_rules::JoberFitableIdFormatRule),
            ],
            task_rules: vec![
                Box::new(attachment_rules::TaskIdRule),
                Box::new(attachment_rules::TaskFitablesRule),
                Box::new(attachment_rules::TaskFitableIdFormatRule),
            ],
            filter_rules: vec![Box::new(attachment_rules::MinimumSizeThresholdRule)],
        }
    }

    /// Register an extra flow rule
    pub fn register_flow_rule(&mut self, rule: Box<dyn FlowRule>) {
        self.flow_rules.push(rule);
    }

    /// Register an extra node rule
    pub fn register_node_rule(&mut self, rule: Box<dyn NodeRule>) {
        self.node_rules.push(rule);
    }

    /// Run every rule, stopping at the first violation
    pub fn validate(&self, definition: &FlowDefinition) -> Result<(), GraphError> {
        for rule in &self.flow_rules {
            rule.apply(definition)?;
        }

        for node in &definition.nodes {
            for rule in &self.node_rules {
                rule.apply(node)?;
            }
            if let Some(jober) = &node.jober {
                for rule in &self.jober_rules {
                    rule.apply(node, jober)?;
                }
            }
            if let Some(task) = &node.task {
                for rule in &self.task_rules {
                    rule.apply(node, task)?;
                }
            }
            for filter in &node.filters {
                for rule in &self.filter_rules {
                    rule.apply(node, filter)?;
                }
            }
        }

        Ok(())
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::standard()
    }
}

/// Validate a parsed flow definition with the standard rule set
pub fn validate_flow_graph(definition: &FlowDefinition) -> Result<(), GraphError> {
    RuleSet::standard().validate(definition)
}
