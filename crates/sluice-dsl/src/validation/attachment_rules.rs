use super::{error_codes, FilterRule, JoberRule, TaskRule, ValidationError};
use lazy_static::lazy_static;
use regex::Regex;
use sluice_core::domain::flow_graph::{FlowFilter, FlowJober, FlowNode, FlowTask, JoberKind, TaskKind};

lazy_static! {
    // Accepted fitable identifier format: leading alphanumeric, then
    // alphanumerics, underscores, dots, colons and hyphens.
    static ref FITABLE_ID_REGEX: Regex =
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.:\-]*$").unwrap();
}

fn check_fitable_ids<'a>(
    node: &FlowNode,
    ids: impl Iterator<Item = &'a String>,
) -> Result<(), ValidationError> {
    for id in ids {
        if !FITABLE_ID_REGEX.is_match(id) {
            return Err(ValidationError::at_node(
                error_codes::INVALID_FITABLE_ID,
                node,
                format!("fitable id '{}' does not match the accepted identifier format", id),
            ));
        }
    }
    Ok(())
}

/// Each jober kind declares a fixed shape of fitables: a general jober
/// invokes at least one, an echo jober none
pub struct JoberFitablesRule;

impl JoberRule for JoberFitablesRule {
    fn apply(&self, node: &FlowNode, jober: &FlowJober) -> Result<(), ValidationError> {
        match jober.kind {
            JoberKind::General if jober.fitables.is_empty() => Err(ValidationError::at_node(
                error_codes::JOBER_FITABLES,
                node,
                "general jober declares no fitables",
            )),
            JoberKind::Echo if !jober.fitables.is_empty() => Err(ValidationError::at_node(
                error_codes::JOBER_FITABLES,
                node,
                format!("echo jober declares {} fitables, expected zero", jober.fitables.len()),
            )),
            _ => Ok(()),
        }
    }
}

/// Jober fitable ids must match the accepted identifier format
pub struct JoberFitableIdFormatRule;

impl JoberRule for JoberFitableIdFormatRule {
    fn apply(&self, node: &FlowNode, jober: &FlowJober) -> Result<(), ValidationError> {
        check_fitable_ids(node, jober.fitables.iter().chain(&jober.exception_fitables))
    }
}

/// A manual task is found by its task id, so the id must be present
pub struct TaskIdRule;

impl TaskRule for TaskIdRule {
    fn apply(&self, node: &FlowNode, task: &FlowTask) -> Result<(), ValidationError> {
        if task.task_id.trim().is_empty() {
            return Err(ValidationError::at_node(
                error_codes::TASK_ID_MISSING,
                node,
                "manual task declares an empty task id",
            ));
        }
        Ok(())
    }
}

/// An echo task releases the batch unchanged, so it declares no fitables
pub struct TaskFitablesRule;

impl TaskRule for TaskFitablesRule {
    fn apply(&self, node: &FlowNode, task: &FlowTask) -> Result<(), ValidationError> {
        if task.kind == TaskKind::Echo && !task.fitables.is_empty() {
            return Err(ValidationError::at_node(
                error_codes::TASK_FITABLES,
                node,
                format!("echo task fitables must be empty, found {}", task.fitables.len()),
            ));
        }
        Ok(())
    }
}

/// Task fitable ids must match the accepted identifier format
pub struct TaskFitableIdFormatRule;

impl TaskRule for TaskFitableIdFormatRule {
    fn apply(&self, node: &FlowNode, task: &FlowTask) -> Result<(), ValidationError> {
        check_fitable_ids(node, task.fitables.iter().chain(&task.exception_fitables))
    }
}

/// A minimum-size filter's threshold must coerce to an integer of at
/// least one before the definition can be executed
pub struct MinimumSizeThresholdRule;

impl FilterRule for MinimumSizeThresholdRule {
    fn apply(&self, node: &FlowNode, filter: &FlowFilter) -> Result<(), ValidationError> {
        filter.threshold().map_err(|err| {
            ValidationError::at_node(error_codes::INVALID_THRESHOLD, node, err.to_string())
        })?;
        Ok(())
    }
}
