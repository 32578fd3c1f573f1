//! Executes one node of a flow graph over a batch of ready contexts.
//!
//! A round at a node runs in stages: filters gate and cap the batch, the
//! jober transforms it, a manual task parks it for an operator, and event
//! resolution moves the survivors to their follow-on nodes.

use crate::domain::condition::ConditionEvaluator;
use crate::domain::flow_context::{ContextErrorInfo, FlowContext};
use crate::domain::flow_graph::{FlowNode, FlowTask, JoberKind, NodeId, NodeKind, TaskKind};
use crate::error::FlowError;
use crate::types::FlowData;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Invokes a single fitable over a batch of records
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Run the fitable, returning the transformed batch
    async fn handle_task(
        &self,
        fitable_id: &str,
        records: Vec<FlowData>,
    ) -> Result<Vec<FlowData>, FlowError>;
}

/// Handler that returns every batch unchanged
pub struct EchoTaskHandler;

#[async_trait]
impl TaskHandler for EchoTaskHandler {
    async fn handle_task(
        &self,
        _fitable_id: &str,
        records: Vec<FlowData>,
    ) -> Result<Vec<FlowData>, FlowError> {
        Ok(records)
    }
}

/// Dispatches fitable ids to registered handlers.
///
/// Lookup is by exact fitable id; a fallback handler catches everything
/// without a dedicated registration.
pub struct TaskHandlerRegistry {
    handlers: DashMap<String, Arc<dyn TaskHandler>>,
    fallback: Option<Arc<dyn TaskHandler>>,
}

impl TaskHandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
            fallback: None,
        }
    }

    /// Registry whose unmatched fitables go to the given handler
    pub fn with_fallback(fallback: Arc<dyn TaskHandler>) -> Self {
        Self {
            handlers: DashMap::new(),
            fallback: Some(fallback),
        }
    }

    /// Register a handler for one fitable id, replacing any previous one
    pub fn register(&self, fitable_id: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(fitable_id.into(), handler);
    }
}

impl Default for TaskHandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskHandler for TaskHandlerRegistry {
    async fn handle_task(
        &self,
        fitable_id: &str,
        records: Vec<FlowData>,
    ) -> Result<Vec<FlowData>, FlowError> {
        let handler = match self.handlers.get(fitable_id) {
            Some(entry) => entry.value().clone(),
            None => match &self.fallback {
                Some(fallback) => fallback.clone(),
                None => {
                    return Err(FlowError::FitableError(format!(
                        "no handler registered for fitable: {}",
                        fitable_id
                    )))
                }
            },
        };
        handler.handle_task(fitable_id, records).await
    }
}

/// A batch suspended on a manual task, waiting for an operator
#[derive(Debug, Clone)]
pub struct ParkedBatch {
    /// Id minted for this suspension
    pub batch_id: String,

    /// Node the batch is parked at
    pub node_id: NodeId,

    /// The manual task holding the batch
    pub task: FlowTask,

    /// Suspended contexts, in batch order
    pub contexts: Vec<FlowContext<FlowData>>,
}

/// A jober failure that may be driven again later
#[derive(Debug, Clone)]
pub struct RetryableFailure {
    /// The error the jober raised
    pub error: FlowError,

    /// The batch as it was before the jober ran
    pub contexts: Vec<FlowContext<FlowData>>,
}

/// What one execution round did with a batch at a node
#[derive(Debug, Default)]
pub struct NodeOutcome {
    /// Contexts moved to follow-on nodes, ready for the next round
    pub advanced: Vec<FlowContext<FlowData>>,

    /// Contexts still gated behind a filter threshold
    pub held: Vec<FlowContext<FlowData>>,

    /// Contexts that reached a terminal state at this node
    pub archived: Vec<FlowContext<FlowData>>,

    /// Contexts failed at this node
    pub failed: Vec<FlowContext<FlowData>>,

    /// Batch suspended on a manual task
    pub parked: Option<ParkedBatch>,

    /// Failure eligible for redriving
    pub retry: Option<RetryableFailure>,
}

/// Runs batches of contexts through single nodes
pub struct NodeExecutor {
    task_handler: Arc<dyn TaskHandler>,
    condition_evaluator: Arc<dyn ConditionEvaluator>,
}

impl NodeExecutor {
    pub fn new(
        task_handler: Arc<dyn TaskHandler>,
        condition_evaluator: Arc<dyn ConditionEvaluator>,
    ) -> Self {
        Self {
            task_handler,
            condition_evaluator,
        }
    }

    /// Execute one node over its ready contexts.
    ///
    /// Filters run first and may hold part or all of the batch at the node.
    /// A retryable jober failure leaves the batch untouched so a scheduler
    /// can drive it again; any other jober failure marks the batch failed
    /// and routes it to the jober's exception fitables.
    pub async fn execute(
        &self,
        node: &FlowNode,
        contexts: Vec<FlowContext<FlowData>>,
    ) -> Result<NodeOutcome, FlowError> {
        let mut outcome = NodeOutcome::default();
        if contexts.is_empty() {
            return Ok(outcome);
        }

        if node.is_terminal() {
            for mut ctx in contexts {
                ctx.archive()?;
                outcome.archived.push(ctx);
            }
            return Ok(outcome);
        }

        // Filters gate and cap the batch; the remainder stays at the node.
        let allowed = node.allowed_by_filters(contexts.len())?;
        let mut batch = contexts;
        outcome.held = batch.split_off(allowed);
        if batch.is_empty() {
            return Ok(outcome);
        }

        if let Some(jober) = &node.jober {
            batch = match self.run_jober(jober, batch).await {
                Ok((mapped, consumed)) => {
                    outcome.archived.extend(consumed);
                    mapped
                }
                Err((error, batch)) => {
                    if error.is_retryable() {
                        tracing::debug!(
                            node_id = %node.meta_id.0,
                            error = %error,
                            "jober failed with retryable error"
                        );
                        outcome.retry = Some(RetryableFailure {
                            error,
                            contexts: batch,
                        });
                    } else {
                        outcome.failed = self
                            .fail_batch(node, &jober.exception_fitables, batch, &error)
                            .await?;
                    }
                    return Ok(outcome);
                }
            };
        }
        if batch.is_empty() {
            return Ok(outcome);
        }

        // A manual task suspends the batch until an operator resolves it.
        if let Some(task) = &node.task {
            if task.kind == TaskKind::Approval {
                let mut suspended = Vec::with_capacity(batch.len());
                for mut ctx in batch {
                    ctx.suspend()?;
                    suspended.push(ctx);
                }
                outcome.parked = Some(ParkedBatch {
                    batch_id: Uuid::new_v4().to_string(),
                    node_id: node.meta_id.clone(),
                    task: task.clone(),
                    contexts: suspended,
                });
                return Ok(outcome);
            }
        }

        let (advanced, failed) = self.resolve_events(node, batch)?;
        outcome.advanced = advanced;
        outcome.failed.extend(failed);
        Ok(outcome)
    }

    /// Drive an operator-resolved batch onward from its manual task.
    ///
    /// The batch is resumed, transformed by the task's fitables, and handed
    /// to event resolution. Fitable failures here are terminal.
    pub async fn resume_task_batch(
        &self,
        node: &FlowNode,
        contexts: Vec<FlowContext<FlowData>>,
    ) -> Result<NodeOutcome, FlowError> {
        let task = node.task.as_ref().ok_or_else(|| {
            FlowError::TaskError(format!("node has no manual task: {}", node.meta_id.0))
        })?;

        let mut outcome = NodeOutcome::default();
        let mut batch = Vec::with_capacity(contexts.len());
        for mut ctx in contexts {
            ctx.resume()?;
            batch.push(ctx);
        }
        if batch.is_empty() {
            return Ok(outcome);
        }

        if !task.fitables.is_empty() {
            let mut records: Vec<FlowData> = batch.iter().map(|c| c.data.clone()).collect();
            for fitable_id in &task.fitables {
                records = match self.task_handler.handle_task(fitable_id, records).await {
                    Ok(records) => records,
                    Err(error) => {
                        outcome.failed = self
                            .fail_batch(node, &task.exception_fitables, batch, &error)
                            .await?;
                        return Ok(outcome);
                    }
                };
            }
            let (mapped, consumed) = Self::map_outputs(batch, records)?;
            outcome.archived.extend(consumed);
            batch = mapped;
        }
        if batch.is_empty() {
            return Ok(outcome);
        }

        let (advanced, failed) = self.resolve_events(node, batch)?;
        outcome.advanced = advanced;
        outcome.failed.extend(failed);
        Ok(outcome)
    }

    /// Mark a batch failed at a node and route the failure to the given
    /// exception fitables. Routing errors are logged, never raised.
    pub async fn fail_batch(
        &self,
        node: &FlowNode,
        exception_fitables: &[String],
        contexts: Vec<FlowContext<FlowData>>,
        error: &FlowError,
    ) -> Result<Vec<FlowContext<FlowData>>, FlowError> {
        let records: Vec<FlowData> = contexts.iter().map(|c| c.data.clone()).collect();
        let mut failed = Vec::with_capacity(contexts.len());
        for mut ctx in contexts {
            ctx.fail(ContextErrorInfo::new(node.meta_id.clone(), error.to_string()))?;
            failed.push(ctx);
        }

        for fitable_id in exception_fitables {
            if let Err(routing_err) = self
                .task_handler
                .handle_task(fitable_id, records.clone())
                .await
            {
                tracing::warn!(
                    node_id = %node.meta_id.0,
                    fitable_id = %fitable_id,
                    error = %routing_err,
                    "exception fitable failed"
                );
            }
        }
        Ok(failed)
    }

    /// Run the jober's fitables in declared order over the batch's records.
    /// On failure the untouched batch rides back with the error.
    async fn run_jober(
        &self,
        jober: &crate::domain::flow_graph::FlowJober,
        batch: Vec<FlowContext<FlowData>>,
    ) -> Result<
        (Vec<FlowContext<FlowData>>, Vec<FlowContext<FlowData>>),
        (FlowError, Vec<FlowContext<FlowData>>),
    > {
        if jober.kind == JoberKind::Echo || jober.fitables.is_empty() {
            return Ok((batch, Vec::new()));
        }

        let mut records: Vec<FlowData> = batch.iter().map(|c| c.data.clone()).collect();
        for fitable_id in &jober.fitables {
            records = match self.task_handler.handle_task(fitable_id, records).await {
                Ok(records) => records,
                Err(error) => return Err((error, batch)),
            };
        }
        Self::map_outputs(batch, records).map_err(|e| (e, Vec::new()))
    }

    /// Map jober outputs onto contexts positionally.
    ///
    /// Equal counts update in place. Surplus outputs mint sibling contexts
    /// at the same node. Contexts beyond the output count were consumed by
    /// aggregation and are archived.
    fn map_outputs(
        contexts: Vec<FlowContext<FlowData>>,
        outputs: Vec<FlowData>,
    ) -> Result<(Vec<FlowContext<FlowData>>, Vec<FlowContext<FlowData>>), FlowError> {
        let mut outputs = outputs.into_iter();
        let mut mapped: Vec<FlowContext<FlowData>> = Vec::new();
        let mut consumed = Vec::new();

        for mut ctx in contexts {
            match outputs.next() {
                Some(data) => {
                    ctx.data = data;
                    mapped.push(ctx);
                }
                None => {
                    ctx.archive()?;
                    consumed.push(ctx);
                }
            }
        }
        if let Some(template) = mapped.last() {
            let surplus: Vec<FlowContext<FlowData>> =
                outputs.map(|data| template.sibling(data)).collect();
            mapped.extend(surplus);
        }
        Ok((mapped, consumed))
    }

    /// Move a transformed batch across the node's outgoing events
    fn resolve_events(
        &self,
        node: &FlowNode,
        batch: Vec<FlowContext<FlowData>>,
    ) -> Result<(Vec<FlowContext<FlowData>>, Vec<FlowContext<FlowData>>), FlowError> {
        match node.kind {
            NodeKind::Condition => self.resolve_conditional(node, batch),
            NodeKind::Parallel => self.resolve_parallel(node, batch),
            _ => self.resolve_direct(node, batch),
        }
    }

    fn resolve_direct(
        &self,
        node: &FlowNode,
        batch: Vec<FlowContext<FlowData>>,
    ) -> Result<(Vec<FlowContext<FlowData>>, Vec<FlowContext<FlowData>>), FlowError> {
        let event = node.events.first().ok_or_else(|| {
            FlowError::FlowExecutionError(format!("node has no outgoing event: {}", node.meta_id.0))
        })?;

        let mut advanced = Vec::with_capacity(batch.len());
        for mut ctx in batch {
            ctx.advance(event.meta_id.clone(), event.to.clone())?;
            advanced.push(ctx);
        }
        Ok((advanced, Vec::new()))
    }

    /// First matching branch wins, in declared order; the branch without a
    /// condition rule is the default and is tried last.
    fn resolve_conditional(
        &self,
        node: &FlowNode,
        batch: Vec<FlowContext<FlowData>>,
    ) -> Result<(Vec<FlowContext<FlowData>>, Vec<FlowContext<FlowData>>), FlowError> {
        let default_event = node.events.iter().find(|e| e.condition_rule.is_none());

        let mut advanced = Vec::new();
        let mut failed = Vec::new();
        'contexts: for mut ctx in batch {
            for event in &node.events {
                if let Some(rule) = event.condition_rule.as_deref() {
                    match self.condition_evaluator.evaluate(rule, ctx.data.as_value()) {
                        Ok(true) => {
                            ctx.advance(event.meta_id.clone(), event.to.clone())?;
                            advanced.push(ctx);
                            continue 'contexts;
                        }
                        Ok(false) => {}
                        Err(error) => {
                            ctx.fail(ContextErrorInfo::new(
                                node.meta_id.clone(),
                                error.to_string(),
                            ))?;
                            failed.push(ctx);
                            continue 'contexts;
                        }
                    }
                }
            }
            match default_event {
                Some(event) => {
                    ctx.advance(event.meta_id.clone(), event.to.clone())?;
                    advanced.push(ctx);
                }
                None => {
                    let error = FlowError::ConditionEvaluationError(format!(
                        "no condition matched and no default branch: {}",
                        node.meta_id.0
                    ));
                    ctx.fail(ContextErrorInfo::new(node.meta_id.clone(), error.to_string()))?;
                    failed.push(ctx);
                }
            }
        }
        Ok((advanced, failed))
    }

    /// Every branch receives the whole batch in the same round
    fn resolve_parallel(
        &self,
        node: &FlowNode,
        batch: Vec<FlowContext<FlowData>>,
    ) -> Result<(Vec<FlowContext<FlowData>>, Vec<FlowContext<FlowData>>), FlowError> {
        let (first, rest) = node.events.split_first().ok_or_else(|| {
            FlowError::FlowExecutionError(format!("node has no outgoing event: {}", node.meta_id.0))
        })?;

        let mut advanced = Vec::with_capacity(batch.len() * node.events.len());
        for mut ctx in batch {
            let mut forks: Vec<FlowContext<FlowData>> = rest
                .iter()
                .map(|event| ctx.fan_out(event.meta_id.clone(), event.to.clone()))
                .collect();
            ctx.advance(first.meta_id.clone(), first.to.clone())?;
            advanced.push(ctx);
            advanced.append(&mut forks);
        }
        Ok((advanced, Vec::new()))
    }
}
