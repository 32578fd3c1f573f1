//! Generators for creating raw graph documents.

use serde_json::json;

/// Creates a minimal valid flow graph document.
///
/// # Returns
///
/// A string containing a minimal valid graph: a start node wired straight
/// into an end node.
pub fn create_minimal_flow_graph() -> String {
    r#"
{
    "metaId": "minimal-flow",
    "name": "Minimal flow",
    "version": "1.0.0",
    "shapes": [
        {"metaId": "start", "type": "startNodeState"},
        {"metaId": "end", "type": "endNodeState"},
        {"metaId": "to-end", "type": "event", "fromShape": "start", "toShape": "end"}
    ]
}
"#
    .to_string()
}

/// Creates a minimal flow graph document with the specified ID.
///
/// # Arguments
///
/// * `flow_id` - The ID to use for the flow
///
/// # Returns
///
/// A string containing a minimal valid graph with the specified ID.
pub fn create_flow_graph_with_id(flow_id: &str) -> String {
    json!({
        "metaId": flow_id,
        "name": flow_id,
        "version": "1.0.0",
        "shapes": [
            {"metaId": "start", "type": "startNodeState"},
            {"metaId": "end", "type": "endNodeState"},
            {"metaId": "to-end", "type": "event", "fromShape": "start", "toShape": "end"}
        ]
    })
    .to_string()
}

/// Creates a linear flow graph: start, one worker state invoking the given
/// fitables, end.
///
/// # Arguments
///
/// * `flow_id` - The ID to use for the flow
/// * `fitables` - Fitable IDs the worker's jober invokes, in order
///
/// # Returns
///
/// A string containing a valid linear graph.
pub fn create_linear_flow_graph(flow_id: &str, fitables: &[&str]) -> String {
    json!({
        "metaId": flow_id,
        "name": flow_id,
        "version": "1.0.0",
        "shapes": [
            {"metaId": "start", "type": "startNodeState"},
            {
                "metaId": "work",
                "type": "state",
                "jober": {"type": "generalJober", "fitables": fitables}
            },
            {"metaId": "end", "type": "endNodeState"},
            {"metaId": "to-work", "type": "event", "fromShape": "start", "toShape": "work"},
            {"metaId": "to-end", "type": "event", "fromShape": "work", "toShape": "end"}
        ]
    })
    .to_string()
}

/// Creates a linear flow graph whose worker jober also declares an
/// exception fitable, invoked when the batch terminally fails.
///
/// # Arguments
///
/// * `flow_id` - The ID to use for the flow
/// * `fitable` - The fitable ID the worker invokes
/// * `exception_fitable` - The fitable ID invoked on terminal failure
///
/// # Returns
///
/// A string containing a valid guarded linear graph.
pub fn create_guarded_flow_graph(flow_id: &str, fitable: &str, exception_fitable: &str) -> String {
    json!({
        "metaId": flow_id,
        "name": flow_id,
        "version": "1.0.0",
        "shapes": [
            {"metaId": "start", "type": "startNodeState"},
            {
                "metaId": "work",
                "type": "state",
                "jober": {
                    "type": "generalJober",
                    "fitables": [fitable],
                    "exceptionFitables": [exception_fitable]
                }
            },
            {"metaId": "end", "type": "endNodeState"},
            {"metaId": "to-work", "type": "event", "fromShape": "start", "toShape": "work"},
            {"metaId": "to-end", "type": "event", "fromShape": "work", "toShape": "end"}
        ]
    })
    .to_string()
}

/// Creates a flow graph with a condition node and two branches.
///
/// Contexts satisfying `condition_rule` take the `fast` branch; everything
/// else takes the `slow` default branch. Both branches rejoin at the end
/// node.
///
/// # Arguments
///
/// * `flow_id` - The ID to use for the flow
/// * `condition_rule` - The rule on the non-default branch
///
/// # Returns
///
/// A string containing a valid conditional graph.
pub fn create_condition_flow_graph(flow_id: &str, condition_rule: &str) -> String {
    json!({
        "metaId": flow_id,
        "name": flow_id,
        "version": "1.0.0",
        "shapes": [
            {"metaId": "start", "type": "startNodeState"},
            {"metaId": "decide", "type": "conditionState"},
            {
                "metaId": "fast",
                "type": "state",
                "jober": {"type": "generalJober", "fitables": ["branch.fast"]}
            },
            {
                "metaId": "slow",
                "type": "state",
                "jober": {"type": "generalJober", "fitables": ["branch.slow"]}
            },
            {"metaId": "end", "type": "endNodeState"},
            {"metaId": "to-decide", "type": "event", "fromShape": "start", "toShape": "decide"},
            {
                "metaId": "take-fast",
                "type": "event",
                "fromShape": "decide",
                "toShape": "fast",
                "conditionRule": condition_rule
            },
            {"metaId": "take-slow", "type": "event", "fromShape": "decide", "toShape": "slow"},
            {"metaId": "fast-to-end", "type": "event", "fromShape": "fast", "toShape": "end"},
            {"metaId": "slow-to-end", "type": "event", "fromShape": "slow", "toShape": "end"}
        ]
    })
    .to_string()
}

/// Creates a flow graph with a parallel node fanning out into two branches.
///
/// Each branch runs its own jober (`branch.a` and `branch.b`) before
/// rejoining at the end node, so a single offered record archives twice.
///
/// # Arguments
///
/// * `flow_id` - The ID to use for the flow
///
/// # Returns
///
/// A string containing a valid parallel graph.
pub fn create_parallel_flow_graph(flow_id: &str) -> String {
    json!({
        "metaId": flow_id,
        "name": flow_id,
        "version": "1.0.0",
        "shapes": [
            {"metaId": "start", "type": "startNodeState"},
            {"metaId": "split", "type": "parallelState"},
            {
                "metaId": "branch-a",
                "type": "state",
                "jober": {"type": "generalJober", "fitables": ["branch.a"]}
            },
            {
                "metaId": "branch-b",
                "type": "state",
                "jober": {"type": "generalJober", "fitables": ["branch.b"]}
            },
            {"metaId": "end", "type": "endNodeState"},
            {"metaId": "to-split", "type": "event", "fromShape": "start", "toShape": "split"},
            {"metaId": "split-a", "type": "event", "fromShape": "split", "toShape": "branch-a"},
            {"metaId": "split-b", "type": "event", "fromShape": "split", "toShape": "branch-b"},
            {"metaId": "a-to-end", "type": "event", "fromShape": "branch-a", "toShape": "end"},
            {"metaId": "b-to-end", "type": "event", "fromShape": "branch-b", "toShape": "end"}
        ]
    })
    .to_string()
}

/// Creates a flow graph whose worker state gates execution behind a
/// minimum-size filter.
///
/// # Arguments
///
/// * `flow_id` - The ID to use for the flow
/// * `threshold` - The minimum batch size before the worker runs
///
/// # Returns
///
/// A string containing a valid filtered graph.
pub fn create_filtered_flow_graph(flow_id: &str, threshold: usize) -> String {
    json!({
        "metaId": flow_id,
        "name": flow_id,
        "version": "1.0.0",
        "shapes": [
            {"metaId": "start", "type": "startNodeState"},
            {
                "metaId": "batch",
                "type": "state",
                "filters": [{"type": "minimumSize", "threshold": threshold}],
                "jober": {"type": "generalJober", "fitables": ["batch.process"]}
            },
            {"metaId": "end", "type": "endNodeState"},
            {"metaId": "to-batch", "type": "event", "fromShape": "start", "toShape": "batch"},
            {"metaId": "to-end", "type": "event", "fromShape": "batch", "toShape": "end"}
        ]
    })
    .to_string()
}

/// Creates a flow graph whose worker state parks contexts on a manual task
/// until an operator resolves them.
///
/// # Arguments
///
/// * `flow_id` - The ID to use for the flow
/// * `task_id` - The external ID of the manual task
///
/// # Returns
///
/// A string containing a valid manual-task graph.
pub fn create_manual_task_flow_graph(flow_id: &str, task_id: &str) -> String {
    json!({
        "metaId": flow_id,
        "name": flow_id,
        "version": "1.0.0",
        "shapes": [
            {"metaId": "start", "type": "startNodeState"},
            {
                "metaId": "review",
                "type": "state",
                "task": {"taskId": task_id, "type": "approvalTask"}
            },
            {"metaId": "end", "type": "endNodeState"},
            {"metaId": "to-review", "type": "event", "fromShape": "start", "toShape": "review"},
            {"metaId": "to-end", "type": "event", "fromShape": "review", "toShape": "end"}
        ]
    })
    .to_string()
}
