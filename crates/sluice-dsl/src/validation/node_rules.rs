use super::{error_codes, NodeRule, ValidationError};
use sluice_core::domain::flow_graph::{FlowNode, NodeKind};

/// Each node kind declares a fixed shape of outgoing events
pub struct NodeEventCountRule;

impl NodeRule for NodeEventCountRule {
    fn apply(&self, node: &FlowNode) -> Result<(), ValidationError> {
        let count = node.events.len();
        match node.kind {
            NodeKind::Start if count != 1 => Err(ValidationError::at_node(
                error_codes::EVENT_COUNT,
                node,
                format!("start node declares {} outgoing events, expected exactly one", count),
            )),
            NodeKind::State if count != 1 => Err(ValidationError::at_node(
                error_codes::EVENT_COUNT,
                node,
                format!("state node declares {} outgoing events, expected exactly one", count),
            )),
            NodeKind::Condition if count == 0 => Err(ValidationError::at_node(
                error_codes::EVENT_COUNT,
                node,
                "condition node declares no outgoing events",
            )),
            NodeKind::Parallel if count < 2 => Err(ValidationError::at_node(
                error_codes::EVENT_COUNT,
                node,
                format!("parallel node event size is {}, expected at least two", count),
            )),
            NodeKind::End if count != 0 => Err(ValidationError::at_node(
                error_codes::EVENT_COUNT,
                node,
                format!("end node event size is {}, expected zero", count),
            )),
            _ => Ok(()),
        }
    }
}

/// A condition node routes on its events' rules, so every branch needs one,
/// except a single default branch taken when no rule matches
pub struct ConditionBranchRule;

impl NodeRule for ConditionBranchRule {
    fn apply(&self, node: &FlowNode) -> Result<(), ValidationError> {
        if node.kind != NodeKind::Condition {
            return Ok(());
        }
        let defaults = node
            .events
            .iter()
            .filter(|event| event.condition_rule.is_none())
            .count();
        if defaults > 1 {
            return Err(ValidationError::at_node(
                error_codes::CONDITION_RULE_MISSING,
                node,
                format!(
                    "condition node declares {} events without a condition rule, at most one default branch is allowed",
                    defaults
                ),
            ));
        }
        Ok(())
    }
}

/// Start and end nodes carry no work of their own
pub struct TerminalNodeAttachmentRule;

impl NodeRule for TerminalNodeAttachmentRule {
    fn apply(&self, node: &FlowNode) -> Result<(), ValidationError> {
        match node.kind {
            NodeKind::End => {
                if node.jober.is_some() {
                    return Err(ValidationError::at_node(
                        error_codes::FORBIDDEN_ATTACHMENT,
                        node,
                        "end node jober must be null",
                    ));
                }
                if node.task.is_some() {
                    return Err(ValidationError::at_node(
                        error_codes::FORBIDDEN_ATTACHMENT,
                        node,
                        "end node must not declare a manual task",
                    ));
                }
            }
            NodeKind::Start => {
                if node.jober.is_some() {
                    return Err(ValidationError::at_node(
                        error_codes::FORBIDDEN_ATTACHMENT,
                        node,
                        "start node must not declare a jober",
                    ));
                }
                if node.task.is_some() {
                    return Err(ValidationError::at_node(
                        error_codes::FORBIDDEN_ATTACHMENT,
                        node,
                        "start node must not declare a manual task",
                    ));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// A node runs automatically or waits for an operator, never both
pub struct JoberTaskExclusiveRule;

impl NodeRule for JoberTaskExclusiveRule {
    fn apply(&self, node: &FlowNode) -> Result<(), ValidationError> {
        if node.jober.is_some() && node.task.is_some() {
            return Err(ValidationError::at_node(
                error_codes::TASK_CONFLICT,
                node,
                "node declares both a jober and a manual task",
            ));
        }
        Ok(())
    }
}
