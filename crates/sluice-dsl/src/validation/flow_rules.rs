use super::{error_codes, FlowRule, ValidationError};
use sluice_core::domain::flow_graph::{FlowDefinition, NodeKind};
use std::collections::HashSet;

/// A flow must declare at least one node
pub struct NonEmptyFlowRule;

impl FlowRule for NonEmptyFlowRule {
    fn apply(&self, definition: &FlowDefinition) -> Result<(), ValidationError> {
        if definition.nodes.is_empty() {
            return Err(ValidationError::at_flow(
                error_codes::EMPTY_FLOW,
                format!("flow '{}' declares no nodes", definition.id.0),
            ));
        }
        Ok(())
    }
}

/// Node meta ids must be unique within a flow
pub struct UniqueNodeIdRule;

impl FlowRule for UniqueNodeIdRule {
    fn apply(&self, definition: &FlowDefinition) -> Result<(), ValidationError> {
        let mut seen = HashSet::new();
        for node in &definition.nodes {
            if !seen.insert(&node.meta_id) {
                return Err(ValidationError::at_node(
                    error_codes::DUPLICATE_ID,
                    node,
                    format!("duplicate node id '{}'", node.meta_id.0),
                ));
            }
        }
        Ok(())
    }
}

/// Event meta ids must be unique within a flow
pub struct UniqueEventIdRule;

impl FlowRule for UniqueEventIdRule {
    fn apply(&self, definition: &FlowDefinition) -> Result<(), ValidationError> {
        let mut seen = HashSet::new();
        for node in &definition.nodes {
            for event in &node.events {
                if !seen.insert(&event.meta_id) {
                    return Err(ValidationError::at_node(
                        error_codes::DUPLICATE_ID,
                        node,
                        format!("duplicate event id '{}'", event.meta_id.0),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// A flow has exactly one start node
pub struct SingleStartNodeRule;

impl FlowRule for SingleStartNodeRule {
    fn apply(&self, definition: &FlowDefinition) -> Result<(), ValidationError> {
        let starts = definition
            .nodes
            .iter()
            .filter(|node| node.kind == NodeKind::Start)
            .count();
        if starts != 1 {
            return Err(ValidationError::at_flow(
                error_codes::START_NODE_COUNT,
                format!("flow '{}' declares {} start nodes", definition.id.0, starts),
            ));
        }
        Ok(())
    }
}

/// A flow has at least one end node
pub struct EndNodePresenceRule;

impl FlowRule for EndNodePresenceRule {
    fn apply(&self, definition: &FlowDefinition) -> Result<(), ValidationError> {
        let has_end = definition
            .nodes
            .iter()
            .any(|node| node.kind == NodeKind::End);
        if !has_end {
            return Err(ValidationError::at_flow(
                error_codes::END_NODE_MISSING,
                format!("flow '{}' declares no end node", definition.id.0),
            ));
        }
        Ok(())
    }
}

/// Every event's endpoints name declared nodes
pub struct EventEndpointsRule;

impl FlowRule for EventEndpointsRule {
    fn apply(&self, definition: &FlowDefinition) -> Result<(), ValidationError> {
        let declared: HashSet<_> = definition.nodes.iter().map(|node| &node.meta_id).collect();
        for node in &definition.nodes {
            for event in &node.events {
                if !declared.contains(&event.from) {
                    return Err(ValidationError::at_node(
                        error_codes::INVALID_REFERENCE,
                        node,
                        format!(
                            "event '{}' leaves undeclared node '{}'",
                            event.meta_id.0, event.from.0
                        ),
                    ));
                }
                if !declared.contains(&event.to) {
                    return Err(ValidationError::at_node(
                        error_codes::INVALID_REFERENCE,
                        node,
                        format!(
                            "event '{}' enters undeclared node '{}'",
                            event.meta_id.0, event.to.0
                        ),
                    ));
                }
            }
        }
        Ok(())
    }
}
