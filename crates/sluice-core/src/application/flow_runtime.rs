//! The engine facade: deploys flow definitions, mints transactions, and
//! drives their contexts to completion.
//!
//! Every offered transaction gets its own drive task fed through a bounded
//! command channel. The task owns the transaction's state outright; outside
//! surfaces reach it only by message, so two surfaces can never mutate one
//! transaction at the same time.

use crate::application::completion::{
    CompletionDispatcher, FlowCompletionCallback, FlowTransCompletionInfo,
};
use crate::application::lock_service::{FlowLockService, LockConfig};
use crate::application::node_executor::{NodeExecutor, NodeOutcome, TaskHandler};
use crate::application::retry_scheduler::{RetryConfig, RetryExecutor, RetryScheduler};
use crate::domain::condition::ConditionEvaluator;
use crate::domain::flow_context::{ContextErrorInfo, FlowContext};
use crate::domain::flow_graph::{FlowDefinition, FlowId, FlowTask, NodeId};
use crate::domain::flow_trans::{FlowTrans, FlowTransId};
use crate::domain::lock::FlowLockRepository;
use crate::domain::retry::{FlowRetryRepository, RETRY_ENTITY_JOBER_BATCH};
use crate::error::FlowError;
use crate::stream::inter_stream::{InterStream, InterStreamHandler};
use crate::types::FlowData;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock, Weak};
use tokio::sync::{broadcast, mpsc, oneshot};
use uuid::Uuid;

/// Engine tuning
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Bound of each transaction's command channel
    pub command_capacity: usize,

    /// Lock service tuning
    pub lock: LockConfig,

    /// Retry scheduler tuning
    pub retry: RetryConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            command_capacity: 64,
            lock: LockConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

/// Handle returned for every offered transaction
#[derive(Debug)]
pub struct FlowOffer {
    /// The minted transaction
    pub trans: FlowTrans,

    /// Resolves once, when the transaction completes
    pub completion: oneshot::Receiver<FlowTransCompletionInfo>,
}

/// A batch suspended on a manual task, visible to operators
#[derive(Debug, Clone)]
pub struct PendingTask {
    /// Claim handle for resolving this batch
    pub batch_id: String,

    /// The transaction the batch belongs to
    pub trans_id: FlowTransId,

    /// The flow the transaction runs
    pub flow_id: FlowId,

    /// The node the batch is suspended at
    pub node_id: NodeId,

    /// The manual task awaiting resolution
    pub task: FlowTask,

    /// The suspended contexts, in arrival order
    pub contexts: Vec<FlowContext<FlowData>>,
}

/// Settles suspended manual-task batches
#[async_trait]
pub trait Operator: Send + Sync {
    /// Inspect a suspended batch and return the contexts to resume with
    async fn operate(
        &self,
        contexts: Vec<FlowContext<FlowData>>,
        task: &FlowTask,
    ) -> Result<Vec<FlowContext<FlowData>>, FlowError>;
}

enum TransCommand {
    Inject(Vec<FlowContext<FlowData>>),
    ResumeBatch {
        batch_id: String,
        contexts: Vec<FlowContext<FlowData>>,
    },
    RedriveBatch {
        batch_id: String,
        reply: oneshot::Sender<Result<(), FlowError>>,
    },
    AbandonBatch {
        batch_id: String,
    },
    Shutdown,
}

struct TransHandle {
    trans: FlowTrans,
    cmd_tx: mpsc::Sender<TransCommand>,
}

/// Deploys definitions and executes flow transactions over them
pub struct FlowRuntime {
    definitions: DashMap<FlowId, Arc<FlowDefinition>>,
    transes: DashMap<FlowTransId, TransHandle>,
    pending_tasks: DashMap<String, PendingTask>,
    retry_index: DashMap<String, FlowTransId>,
    executor: Arc<NodeExecutor>,
    lock_service: Arc<FlowLockService>,
    retry_scheduler: Arc<RetryScheduler>,
    inter_stream: Arc<InterStream<FlowData>>,
    dispatcher: RwLock<CompletionDispatcher>,
    config: RuntimeConfig,
}

impl FlowRuntime {
    /// Assemble the engine from its pluggable parts
    pub fn new(
        task_handler: Arc<dyn TaskHandler>,
        condition_evaluator: Arc<dyn ConditionEvaluator>,
        lock_repo: Arc<dyn FlowLockRepository>,
        retry_repo: Arc<dyn FlowRetryRepository>,
        config: RuntimeConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<FlowRuntime>| {
            let retry_scheduler = Arc::new(RetryScheduler::new(
                retry_repo,
                Arc::new(RuntimeRetryExecutor {
                    runtime: weak.clone(),
                }),
                config.retry.clone(),
            ));
            let inter_stream = Arc::new(InterStream::new());
            inter_stream.register(Arc::new(RuntimeInjectionHandler {
                runtime: weak.clone(),
            }));
            Self {
                definitions: DashMap::new(),
                transes: DashMap::new(),
                pending_tasks: DashMap::new(),
                retry_index: DashMap::new(),
                executor: Arc::new(NodeExecutor::new(task_handler, condition_evaluator)),
                lock_service: Arc::new(FlowLockService::new(lock_repo, config.lock.clone())),
                retry_scheduler,
                inter_stream,
                dispatcher: RwLock::new(CompletionDispatcher::new()),
                config,
            }
        })
    }

    /// Make a flow definition executable, replacing any previous version
    pub fn deploy(&self, definition: FlowDefinition) -> Result<(), FlowError> {
        definition.start_node()?;
        tracing::info!(
            flow_id = %definition.id.0,
            version = %definition.version,
            nodes = definition.nodes.len(),
            "flow deployed"
        );
        self.definitions
            .insert(definition.id.clone(), Arc::new(definition));
        Ok(())
    }

    /// Withdraw a deployed definition. Running transactions keep the
    /// definition they started with.
    pub fn undeploy(&self, flow_id: &FlowId) -> Option<Arc<FlowDefinition>> {
        self.definitions.remove(flow_id).map(|(_, d)| d)
    }

    pub fn definition(&self, flow_id: &FlowId) -> Option<Arc<FlowDefinition>> {
        self.definitions.get(flow_id).map(|entry| entry.value().clone())
    }

    pub fn deployed_flows(&self) -> Vec<FlowId> {
        self.definitions.iter().map(|e| e.key().clone()).collect()
    }

    /// Mint a transaction for the flow and start driving the offered
    /// records through it
    pub fn offer(
        self: &Arc<Self>,
        flow_id: &FlowId,
        records: Vec<FlowData>,
    ) -> Result<FlowOffer, FlowError> {
        let definition = self.definition(flow_id).ok_or_else(|| {
            FlowError::DefinitionNotFound(format!("flow not deployed: {}", flow_id.0))
        })?;
        let start = definition.start_node()?;

        let trans = FlowTrans::new(flow_id.clone());
        let seed: Vec<FlowContext<FlowData>> = records
            .into_iter()
            .map(|data| FlowContext::new(&trans, start.meta_id.clone(), data))
            .collect();
        tracing::info!(
            trans_id = %trans.id.0,
            flow_id = %flow_id.0,
            records = seed.len(),
            "flow trans offered"
        );

        let (cmd_tx, cmd_rx) = mpsc::channel(self.config.command_capacity);
        let (done_tx, done_rx) = oneshot::channel();
        self.transes.insert(
            trans.id.clone(),
            TransHandle {
                trans: trans.clone(),
                cmd_tx,
            },
        );

        let driver = TransDriver {
            runtime: self.clone(),
            definition,
            trans: trans.clone(),
            lock_key: self.lock_service.trans_lock_key(&trans.id),
            lock_held: false,
            state: TransState::new(seed),
        };
        tokio::spawn(driver.run(cmd_rx, done_tx));

        Ok(FlowOffer {
            trans,
            completion: done_rx,
        })
    }

    /// Port for pushing data into running transactions
    pub fn inter_stream(&self) -> Arc<InterStream<FlowData>> {
        self.inter_stream.clone()
    }

    /// Scheduler owning retry records; exposed so hosts can run or time
    /// sweeps themselves
    pub fn retry_scheduler(&self) -> Arc<RetryScheduler> {
        self.retry_scheduler.clone()
    }

    pub fn lock_service(&self) -> Arc<FlowLockService> {
        self.lock_service.clone()
    }

    /// Notify the callback on every completed transaction
    pub fn register_completion_callback(&self, callback: Arc<dyn FlowCompletionCallback>) {
        if let Ok(mut dispatcher) = self.dispatcher.write() {
            dispatcher.register(callback);
        }
    }

    /// Whether a transaction is still being driven
    pub fn is_running(&self, trans_id: &FlowTransId) -> bool {
        self.transes.contains_key(trans_id)
    }

    /// Every batch currently suspended on a manual task
    pub fn pending_tasks(&self) -> Vec<PendingTask> {
        self.pending_tasks
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Suspended batches belonging to one transaction
    pub fn pending_tasks_for_trans(&self, trans_id: &FlowTransId) -> Vec<PendingTask> {
        self.pending_tasks
            .iter()
            .filter(|entry| &entry.value().trans_id == trans_id)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Hand a suspended batch to the operator and resume the transaction
    /// with whatever it returns.
    ///
    /// The batch is claimed before the operator runs; a second resolver of
    /// the same batch finds nothing. An operator error puts the batch back.
    pub async fn resolve_task(
        &self,
        batch_id: &str,
        operator: &dyn Operator,
    ) -> Result<(), FlowError> {
        let (_, pending) = self.pending_tasks.remove(batch_id).ok_or_else(|| {
            FlowError::TaskError(format!("no pending task: {}", batch_id))
        })?;

        let resolved = match operator
            .operate(pending.contexts.clone(), &pending.task)
            .await
        {
            Ok(resolved) => resolved,
            Err(error) => {
                self.pending_tasks
                    .insert(batch_id.to_string(), pending);
                return Err(error);
            }
        };

        let cmd_tx = {
            let handle = self.transes.get(&pending.trans_id).ok_or_else(|| {
                FlowError::TransNotFound(format!("trans gone: {}", pending.trans_id.0))
            })?;
            handle.cmd_tx.clone()
        };
        cmd_tx
            .send(TransCommand::ResumeBatch {
                batch_id: batch_id.to_string(),
                contexts: resolved,
            })
            .await
            .map_err(|_| FlowError::TransNotFound(format!("trans gone: {}", pending.trans_id.0)))
    }

    /// Ask every running transaction to stop, failing its remaining
    /// contexts. Completions still fire.
    pub async fn shutdown(&self) {
        let senders: Vec<mpsc::Sender<TransCommand>> = self
            .transes
            .iter()
            .map(|entry| entry.value().cmd_tx.clone())
            .collect();
        for cmd_tx in senders {
            let _ = cmd_tx.send(TransCommand::Shutdown).await;
        }
    }

    fn dispatch_completion(&self, info: FlowTransCompletionInfo) {
        if let Ok(dispatcher) = self.dispatcher.read() {
            dispatcher.dispatch(info);
        }
    }
}

/// Redrive adapter the retry scheduler calls back into
struct RuntimeRetryExecutor {
    runtime: Weak<FlowRuntime>,
}

#[async_trait]
impl RetryExecutor for RuntimeRetryExecutor {
    async fn redrive(&self, entity_id: &str, entity_type: &str) -> Result<(), FlowError> {
        let runtime = self
            .runtime
            .upgrade()
            .ok_or_else(|| FlowError::Other("engine stopped".to_string()))?;
        if entity_type != RETRY_ENTITY_JOBER_BATCH {
            return Err(FlowError::Other(format!(
                "unknown retry entity type: {}",
                entity_type
            )));
        }
        let trans_id = runtime
            .retry_index
            .get(entity_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                FlowError::Other(format!("no parked batch for retry entity: {}", entity_id))
            })?;
        let cmd_tx = {
            let handle = runtime.transes.get(&trans_id).ok_or_else(|| {
                FlowError::TransNotFound(format!("trans gone: {}", trans_id.0))
            })?;
            handle.cmd_tx.clone()
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        cmd_tx
            .send(TransCommand::RedriveBatch {
                batch_id: entity_id.to_string(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| FlowError::TransNotFound(format!("trans gone: {}", trans_id.0)))?;
        reply_rx
            .await
            .map_err(|_| FlowError::Other("redrive reply dropped".to_string()))?
    }

    async fn abandon(&self, entity_id: &str, _entity_type: &str) {
        let Some(runtime) = self.runtime.upgrade() else {
            return;
        };
        let Some(trans_id) = runtime
            .retry_index
            .get(entity_id)
            .map(|entry| entry.value().clone())
        else {
            return;
        };
        let cmd_tx = match runtime.transes.get(&trans_id) {
            Some(handle) => handle.cmd_tx.clone(),
            None => return,
        };
        let _ = cmd_tx
            .send(TransCommand::AbandonBatch {
                batch_id: entity_id.to_string(),
            })
            .await;
    }
}

/// Inter-stream adapter turning published records into seeded contexts
struct RuntimeInjectionHandler {
    runtime: Weak<FlowRuntime>,
}

#[async_trait]
impl InterStreamHandler<FlowData> for RuntimeInjectionHandler {
    async fn on_publish(
        &self,
        records: Vec<FlowData>,
        trans_id: FlowTransId,
    ) -> Result<(), FlowError> {
        let runtime = self
            .runtime
            .upgrade()
            .ok_or_else(|| FlowError::Other("engine stopped".to_string()))?;
        let (trans, cmd_tx) = {
            let handle = runtime.transes.get(&trans_id).ok_or_else(|| {
                FlowError::TransNotFound(format!("trans not running: {}", trans_id.0))
            })?;
            (handle.trans.clone(), handle.cmd_tx.clone())
        };
        let definition = runtime.definition(&trans.flow_id).ok_or_else(|| {
            FlowError::DefinitionNotFound(format!("flow not deployed: {}", trans.flow_id.0))
        })?;
        let start = definition.start_node()?;

        let contexts: Vec<FlowContext<FlowData>> = records
            .into_iter()
            .map(|data| FlowContext::new(&trans, start.meta_id.clone(), data))
            .collect();
        cmd_tx
            .send(TransCommand::Inject(contexts))
            .await
            .map_err(|_| FlowError::TransNotFound(format!("trans gone: {}", trans_id.0)))
    }
}

/// A jober batch waiting for its next attempt
struct RetryParked {
    node_id: NodeId,
    contexts: Vec<FlowContext<FlowData>>,
    error: FlowError,
}

/// Mutable state of one driven transaction
struct TransState {
    pools: HashMap<NodeId, Vec<FlowContext<FlowData>>>,
    dirty: VecDeque<NodeId>,
    parked: HashMap<String, NodeId>,
    retrying: HashMap<String, RetryParked>,
    terminal: Vec<FlowContext<FlowData>>,
}

impl TransState {
    fn new(seed: Vec<FlowContext<FlowData>>) -> Self {
        let mut state = Self {
            pools: HashMap::new(),
            dirty: VecDeque::new(),
            parked: HashMap::new(),
            retrying: HashMap::new(),
            terminal: Vec::new(),
        };
        state.enqueue(seed);
        state
    }

    fn enqueue(&mut self, contexts: Vec<FlowContext<FlowData>>) {
        for ctx in contexts {
            let node_id = ctx.position.clone();
            self.pools.entry(node_id.clone()).or_default().push(ctx);
            self.mark_dirty(node_id);
        }
    }

    fn mark_dirty(&mut self, node_id: NodeId) {
        if !self.dirty.contains(&node_id) {
            self.dirty.push_back(node_id);
        }
    }

    /// True once every context reached a terminal state
    fn is_complete(&self) -> bool {
        self.pools.values().all(|pool| pool.is_empty())
            && self.parked.is_empty()
            && self.retrying.is_empty()
    }
}

struct TransDriver {
    runtime: Arc<FlowRuntime>,
    definition: Arc<FlowDefinition>,
    trans: FlowTrans,
    lock_key: String,
    lock_held: bool,
    state: TransState,
}

impl TransDriver {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<TransCommand>,
        done_tx: oneshot::Sender<FlowTransCompletionInfo>,
    ) {
        let mut invalidations = self.runtime.lock_service.subscribe_invalidations();

        loop {
            // Commands first so external resolutions land before the next
            // round.
            let mut keep_running = true;
            while let Ok(cmd) = cmd_rx.try_recv() {
                keep_running = self.apply_or_fail(cmd).await;
                if !keep_running {
                    break;
                }
            }
            if !keep_running {
                break;
            }

            if self.lock_lost(&mut invalidations) {
                self.lock_held = false;
                self.fail_all_live(&FlowError::LockInvalidated(self.lock_key.clone()))
                    .await;
                break;
            }

            if let Some(node_id) = self.state.dirty.pop_front() {
                if let Err(error) = self.ensure_lock().await {
                    self.fail_all_live(&error).await;
                    break;
                }
                if let Err(error) = self.run_node(&node_id).await {
                    self.fail_all_live(&error).await;
                    break;
                }
                continue;
            }

            if self.state.is_complete() {
                break;
            }

            // Quiescent with live contexts: give the lock back and wait
            // for outside input.
            self.release_lock().await;
            match cmd_rx.recv().await {
                Some(cmd) => {
                    if !self.apply_or_fail(cmd).await {
                        break;
                    }
                }
                None => break,
            }
        }

        self.finish(done_tx).await;
    }

    async fn apply_or_fail(&mut self, cmd: TransCommand) -> bool {
        match self.apply(cmd).await {
            Ok(keep_running) => keep_running,
            Err(error) => {
                self.fail_all_live(&error).await;
                false
            }
        }
    }

    /// Apply one command. Returns false when the transaction should stop.
    async fn apply(&mut self, cmd: TransCommand) -> Result<bool, FlowError> {
        match cmd {
            TransCommand::Inject(contexts) => {
                self.state.enqueue(contexts);
            }
            TransCommand::ResumeBatch { batch_id, contexts } => {
                let Some(node_id) = self.state.parked.remove(&batch_id) else {
                    return Ok(true);
                };
                self.ensure_lock().await?;
                let definition = self.definition.clone();
                let node = definition.node(&node_id).ok_or_else(|| {
                    FlowError::NodeNotFound(format!("node gone: {}", node_id.0))
                })?;
                let outcome = self.runtime.executor.resume_task_batch(node, contexts).await?;
                self.route_outcome(&node_id, outcome).await?;
            }
            TransCommand::RedriveBatch { batch_id, reply } => {
                let Some(parked) = self.state.retrying.remove(&batch_id) else {
                    let _ = reply.send(Ok(()));
                    return Ok(true);
                };
                self.ensure_lock().await?;
                let definition = self.definition.clone();
                let node = definition.node(&parked.node_id).ok_or_else(|| {
                    FlowError::NodeNotFound(format!("node gone: {}", parked.node_id.0))
                })?;

                let mut outcome = self.runtime.executor.execute(node, parked.contexts).await?;
                match outcome.retry.take() {
                    Some(still_failing) => {
                        // Same batch id so the scheduler record stays
                        // aligned with the parked batch.
                        let error = still_failing.error.clone();
                        self.state.retrying.insert(
                            batch_id,
                            RetryParked {
                                node_id: parked.node_id,
                                contexts: still_failing.contexts,
                                error: still_failing.error,
                            },
                        );
                        let _ = reply.send(Err(error));
                    }
                    None => {
                        self.runtime.retry_index.remove(&batch_id);
                        self.route_outcome(&parked.node_id.clone(), outcome).await?;
                        let _ = reply.send(Ok(()));
                    }
                }
            }
            TransCommand::AbandonBatch { batch_id } => {
                let Some(parked) = self.state.retrying.remove(&batch_id) else {
                    return Ok(true);
                };
                self.runtime.retry_index.remove(&batch_id);
                let definition = self.definition.clone();
                let node = definition.node(&parked.node_id).ok_or_else(|| {
                    FlowError::NodeNotFound(format!("node gone: {}", parked.node_id.0))
                })?;
                let exhausted = FlowError::RetryExhausted(format!(
                    "retries exhausted at node {}: {}",
                    parked.node_id.0, parked.error
                ));
                let exception_fitables = node
                    .jober
                    .as_ref()
                    .map(|j| j.exception_fitables.as_slice())
                    .unwrap_or(&[]);
                let failed = self
                    .runtime
                    .executor
                    .fail_batch(node, exception_fitables, parked.contexts, &exhausted)
                    .await?;
                self.state.terminal.extend(failed);
            }
            TransCommand::Shutdown => {
                self.fail_all_live(&FlowError::FlowExecutionError(
                    "engine shutting down".to_string(),
                ))
                .await;
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn run_node(&mut self, node_id: &NodeId) -> Result<(), FlowError> {
        let batch = match self.state.pools.get_mut(node_id) {
            Some(pool) if !pool.is_empty() => std::mem::take(pool),
            _ => return Ok(()),
        };
        let definition = self.definition.clone();
        let node = definition
            .node(node_id)
            .ok_or_else(|| FlowError::NodeNotFound(format!("node gone: {}", node_id.0)))?;

        tracing::debug!(
            trans_id = %self.trans.id.0,
            node_id = %node_id.0,
            batch = batch.len(),
            "executing node"
        );
        let outcome = self.runtime.executor.execute(node, batch).await?;
        self.route_outcome(node_id, outcome).await
    }

    async fn route_outcome(
        &mut self,
        node_id: &NodeId,
        outcome: NodeOutcome,
    ) -> Result<(), FlowError> {
        let progressed = !outcome.advanced.is_empty()
            || !outcome.archived.is_empty()
            || !outcome.failed.is_empty()
            || outcome.parked.is_some()
            || outcome.retry.is_some();

        self.state.terminal.extend(outcome.archived);
        self.state.terminal.extend(outcome.failed);

        if !outcome.held.is_empty() {
            let pool = self.state.pools.entry(node_id.clone()).or_default();
            let mut held = outcome.held;
            held.append(pool);
            *pool = held;
            // Without progress the same batch would gate identically next
            // round; wait for new arrivals instead.
            if progressed {
                self.state.mark_dirty(node_id.clone());
            }
        }

        self.state.enqueue(outcome.advanced);

        if let Some(parked) = outcome.parked {
            tracing::info!(
                trans_id = %self.trans.id.0,
                node_id = %parked.node_id.0,
                batch_id = %parked.batch_id,
                contexts = parked.contexts.len(),
                "batch suspended on manual task"
            );
            self.state
                .parked
                .insert(parked.batch_id.clone(), parked.node_id.clone());
            self.runtime.pending_tasks.insert(
                parked.batch_id.clone(),
                PendingTask {
                    batch_id: parked.batch_id,
                    trans_id: self.trans.id.clone(),
                    flow_id: self.trans.flow_id.clone(),
                    node_id: parked.node_id,
                    task: parked.task,
                    contexts: parked.contexts,
                },
            );
        }

        if let Some(retryable) = outcome.retry {
            let batch_id = Uuid::new_v4().to_string();
            tracing::info!(
                trans_id = %self.trans.id.0,
                node_id = %node_id.0,
                batch_id = %batch_id,
                error = %retryable.error,
                "batch parked for retry"
            );
            self.state.retrying.insert(
                batch_id.clone(),
                RetryParked {
                    node_id: node_id.clone(),
                    contexts: retryable.contexts,
                    error: retryable.error,
                },
            );
            self.runtime
                .retry_index
                .insert(batch_id.clone(), self.trans.id.clone());
            self.runtime
                .retry_scheduler
                .schedule_retry(&batch_id, RETRY_ENTITY_JOBER_BATCH)
                .await?;
        }
        Ok(())
    }

    async fn ensure_lock(&mut self) -> Result<(), FlowError> {
        if !self.lock_held {
            self.runtime.lock_service.acquire(&self.lock_key).await?;
            self.lock_held = true;
        }
        Ok(())
    }

    async fn release_lock(&mut self) {
        if self.lock_held {
            if let Err(error) = self.runtime.lock_service.release(&self.lock_key).await {
                tracing::warn!(lock_key = %self.lock_key, error = %error, "lock release failed");
            }
            self.lock_held = false;
        }
    }

    /// Whether the lock this driver holds was reclaimed out from under it
    fn lock_lost(&self, invalidations: &mut broadcast::Receiver<String>) -> bool {
        use broadcast::error::TryRecvError;
        loop {
            match invalidations.try_recv() {
                Ok(key) => {
                    if self.lock_held && key == self.lock_key {
                        return true;
                    }
                }
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return false,
            }
        }
    }

    /// Fail every context the transaction still owns
    async fn fail_all_live(&mut self, error: &FlowError) {
        tracing::error!(
            trans_id = %self.trans.id.0,
            error = %error,
            "failing remaining contexts"
        );
        self.state.dirty.clear();

        let mut stranded: Vec<FlowContext<FlowData>> = Vec::new();
        for (_, mut pool) in self.state.pools.drain() {
            stranded.append(&mut pool);
        }
        let retrying: Vec<(String, RetryParked)> = self.state.retrying.drain().collect();
        for (batch_id, parked) in retrying {
            self.runtime.retry_index.remove(&batch_id);
            if let Err(cancel_err) = self.runtime.retry_scheduler.cancel(&batch_id).await {
                tracing::warn!(batch_id = %batch_id, error = %cancel_err, "retry cancel failed");
            }
            stranded.extend(parked.contexts);
        }
        let parked: Vec<String> = self.state.parked.drain().map(|(id, _)| id).collect();
        for batch_id in parked {
            if let Some((_, pending)) = self.runtime.pending_tasks.remove(&batch_id) {
                stranded.extend(pending.contexts);
            }
        }

        for mut ctx in stranded {
            let position = ctx.position.clone();
            if ctx
                .fail(ContextErrorInfo::new(position, error.to_string()))
                .is_ok()
            {
                self.state.terminal.push(ctx);
            }
        }
    }

    async fn finish(mut self, done_tx: oneshot::Sender<FlowTransCompletionInfo>) {
        self.release_lock().await;
        let trans_id = self.trans.id.clone();
        self.runtime.transes.remove(&trans_id);
        self.runtime.inter_stream.forget(&trans_id);

        let info = FlowTransCompletionInfo::new(
            self.trans.clone(),
            std::mem::take(&mut self.state.terminal),
        );
        tracing::info!(
            trans_id = %trans_id.0,
            flow_id = %self.trans.flow_id.0,
            contexts = info.get_all().len(),
            success = info.is_success(),
            "flow trans completed"
        );
        let _ = done_tx.send(info.clone());
        self.runtime.dispatch_completion(info);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::node_executor::EchoTaskHandler;
    use crate::domain::condition::JmespathConditionEvaluator;
    use crate::domain::flow_context::ContextStatus;
    use crate::domain::flow_graph::{EventId, FlowEvent, FlowNode, NodeKind};
    use crate::domain::lock::FlowLockRecord;
    use crate::domain::retry::FlowRetryRecord;
    use chrono::{DateTime, Utc};
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::time::timeout;

    struct MemoryLockRepo {
        records: StdMutex<HashMap<String, FlowLockRecord>>,
    }

    #[async_trait]
    impl FlowLockRepository for MemoryLockRepo {
        async fn try_lock(&self, record: &FlowLockRecord) -> Result<bool, FlowError> {
            let mut records = self.records.lock().unwrap();
            let now = Utc::now();
            match records.get(&record.lock_key) {
                Some(existing)
                    if !existing.is_expired_at(now)
                        && existing.locked_client != record.locked_client =>
                {
                    Ok(false)
                }
                _ => {
                    records.insert(record.lock_key.clone(), record.clone());
                    Ok(true)
                }
            }
        }

        async fn refresh(
            &self,
            lock_key: &str,
            client: &str,
            expire_at: DateTime<Utc>,
        ) -> Result<bool, FlowError> {
            let mut records = self.records.lock().unwrap();
            match records.get_mut(lock_key) {
                Some(record) if record.locked_client == client => {
                    record.expire_at = expire_at;
                    Ok(true)
                }
                _ => Ok(false),
            }
        }

        async fn unlock(&self, lock_key: &str, client: &str) -> Result<bool, FlowError> {
            let mut records = self.records.lock().unwrap();
            match records.get(lock_key) {
                Some(record) if record.locked_client == client => {
                    records.remove(lock_key);
                    Ok(true)
                }
                _ => Ok(false),
            }
        }

        async fn find_by_key(&self, lock_key: &str) -> Result<Option<FlowLockRecord>, FlowError> {
            Ok(self.records.lock().unwrap().get(lock_key).cloned())
        }

        async fn delete_expired(
            &self,
            cutoff: DateTime<Utc>,
        ) -> Result<Vec<FlowLockRecord>, FlowError> {
            let mut records = self.records.lock().unwrap();
            let stale: Vec<String> = records
                .iter()
                .filter(|(_, r)| r.expire_at <= cutoff)
                .map(|(k, _)| k.clone())
                .collect();
            let mut reclaimed = Vec::new();
            for key in stale {
                if let Some(record) = records.remove(&key) {
                    reclaimed.push(record);
                }
            }
            Ok(reclaimed)
        }
    }

    struct MemoryRetryRepo {
        records: StdMutex<HashMap<String, FlowRetryRecord>>,
    }

    #[async_trait]
    impl FlowRetryRepository for MemoryRetryRepo {
        async fn save(&self, record: &FlowRetryRecord) -> Result<(), FlowError> {
            self.records
                .lock()
                .unwrap()
                .insert(record.entity_id.clone(), record.clone());
            Ok(())
        }

        async fn find_by_entity_id(
            &self,
            entity_id: &str,
        ) -> Result<Option<FlowRetryRecord>, FlowError> {
            Ok(self.records.lock().unwrap().get(entity_id).cloned())
        }

        async fn find_due(
            &self,
            now: DateTime<Utc>,
            limit: usize,
        ) -> Result<Vec<FlowRetryRecord>, FlowError> {
            let records = self.records.lock().unwrap();
            let mut due: Vec<FlowRetryRecord> = records
                .values()
                .filter(|r| r.is_due_at(now))
                .cloned()
                .collect();
            due.sort_by_key(|r| r.next_retry_time);
            due.truncate(limit);
            Ok(due)
        }

        async fn update_versioned(
            &self,
            record: &FlowRetryRecord,
            expected_version: i32,
        ) -> Result<bool, FlowError> {
            let mut records = self.records.lock().unwrap();
            match records.get(&record.entity_id) {
                Some(existing) if existing.version == expected_version => {
                    records.insert(record.entity_id.clone(), record.clone());
                    Ok(true)
                }
                _ => Ok(false),
            }
        }

        async fn delete(&self, entity_id: &str) -> Result<(), FlowError> {
            self.records.lock().unwrap().remove(entity_id);
            Ok(())
        }
    }

    fn runtime() -> Arc<FlowRuntime> {
        FlowRuntime::new(
            Arc::new(EchoTaskHandler),
            Arc::new(JmespathConditionEvaluator::new()),
            Arc::new(MemoryLockRepo {
                records: StdMutex::new(HashMap::new()),
            }),
            Arc::new(MemoryRetryRepo {
                records: StdMutex::new(HashMap::new()),
            }),
            RuntimeConfig::default(),
        )
    }

    fn event(id: &str, from: &str, to: &str) -> FlowEvent {
        FlowEvent {
            meta_id: EventId(id.to_string()),
            name: id.to_string(),
            from: NodeId(from.to_string()),
            to: NodeId(to.to_string()),
            condition_rule: None,
            defined_from_connector: None,
        }
    }

    fn node(id: &str, kind: NodeKind, events: Vec<FlowEvent>) -> FlowNode {
        FlowNode {
            meta_id: NodeId(id.to_string()),
            name: id.to_string(),
            kind,
            events,
            jober: None,
            task: None,
            filters: Vec::new(),
            properties: HashMap::new(),
        }
    }

    fn linear_flow(flow_id: &str) -> FlowDefinition {
        FlowDefinition {
            id: FlowId(flow_id.to_string()),
            name: flow_id.to_string(),
            version: "1.0.0".to_string(),
            nodes: vec![
                node("start", NodeKind::Start, vec![event("e1", "start", "work")]),
                node("work", NodeKind::State, vec![event("e2", "work", "end")]),
                node("end", NodeKind::End, vec![]),
            ],
        }
    }

    #[tokio::test]
    async fn test_deploy_and_undeploy() {
        let runtime = runtime();
        let flow_id = FlowId("flow-1".to_string());

        runtime.deploy(linear_flow("flow-1")).unwrap();
        assert!(runtime.definition(&flow_id).is_some());
        assert_eq!(runtime.deployed_flows(), vec![flow_id.clone()]);

        runtime.undeploy(&flow_id);
        assert!(runtime.definition(&flow_id).is_none());
    }

    #[tokio::test]
    async fn test_deploy_rejects_flow_without_start() {
        let runtime = runtime();
        let headless = FlowDefinition {
            id: FlowId("flow-1".to_string()),
            name: "flow-1".to_string(),
            version: "1.0.0".to_string(),
            nodes: vec![node("end", NodeKind::End, vec![])],
        };

        let err = runtime.deploy(headless).unwrap_err();
        assert!(matches!(err, FlowError::NodeNotFound(_)));
    }

    #[tokio::test]
    async fn test_offer_unknown_flow_fails() {
        let runtime = runtime();
        let err = runtime
            .offer(&FlowId("missing".to_string()), vec![FlowData::from_string("x")])
            .unwrap_err();
        assert!(matches!(err, FlowError::DefinitionNotFound(_)));
    }

    #[tokio::test]
    async fn test_linear_flow_runs_to_completion() {
        let runtime = runtime();
        runtime.deploy(linear_flow("flow-1")).unwrap();

        let offer = runtime
            .offer(
                &FlowId("flow-1".to_string()),
                vec![FlowData::from_string("a"), FlowData::from_string("b")],
            )
            .unwrap();

        let info = timeout(Duration::from_secs(2), offer.completion)
            .await
            .unwrap()
            .unwrap();

        assert!(info.is_success());
        assert_eq!(info.get_all().len(), 2);
        assert!(info
            .get_all()
            .iter()
            .all(|c| c.status == ContextStatus::Archived && c.position.0 == "end"));
        assert!(!runtime.is_running(&offer.trans.id));
    }

    #[tokio::test]
    async fn test_empty_offer_completes_immediately() {
        let runtime = runtime();
        runtime.deploy(linear_flow("flow-1")).unwrap();

        let offer = runtime
            .offer(&FlowId("flow-1".to_string()), vec![])
            .unwrap();
        let info = timeout(Duration::from_secs(2), offer.completion)
            .await
            .unwrap()
            .unwrap();

        assert!(info.get_all().is_empty());
        assert!(!info.is_success());
    }

    #[tokio::test]
    async fn test_completion_callback_fires_once_per_trans() {
        struct CountingCallback {
            seen: StdMutex<Vec<FlowTransId>>,
        }

        #[async_trait]
        impl FlowCompletionCallback for CountingCallback {
            async fn on_flow_trans_completed(&self, info: FlowTransCompletionInfo) {
                self.seen.lock().unwrap().push(info.trans().id.clone());
            }
        }

        let runtime = runtime();
        runtime.deploy(linear_flow("flow-1")).unwrap();
        let callback = Arc::new(CountingCallback {
            seen: StdMutex::new(Vec::new()),
        });
        runtime.register_completion_callback(callback.clone());

        let offer = runtime
            .offer(&FlowId("flow-1".to_string()), vec![FlowData::from_string("a")])
            .unwrap();
        let trans_id = offer.trans.id.clone();
        timeout(Duration::from_secs(2), offer.completion)
            .await
            .unwrap()
            .unwrap();

        // Callbacks run on spawned tasks; give them a beat.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let seen = callback.seen.lock().unwrap();
        assert_eq!(seen.iter().filter(|id| **id == trans_id).count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_fails_open_transactions() {
        let runtime = runtime();
        // A flow whose work node gates on a threshold the offer never
        // reaches keeps the trans open.
        let mut flow = linear_flow("flow-1");
        flow.nodes[1].filters = vec![crate::domain::flow_graph::FlowFilter::minimum_size(10)];
        runtime.deploy(flow).unwrap();

        let offer = runtime
            .offer(&FlowId("flow-1".to_string()), vec![FlowData::from_string("a")])
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(runtime.is_running(&offer.trans.id));

        runtime.shutdown().await;
        let info = timeout(Duration::from_secs(2), offer.completion)
            .await
            .unwrap()
            .unwrap();
        assert!(!info.is_success());
        assert_eq!(info.failed().len(), 1);
    }
}
