use chrono::Utc;
use serde_json::json;
use sluice_core::{
    FlowData, FlowError, FlowId, FlowOffer, FlowRuntime, FlowTransCompletionInfo,
    JmespathConditionEvaluator, PendingTask, RetryConfig, RetryPolicy, RuntimeConfig, TaskHandler,
};
use sluice_dsl::parse_and_validate_flow_graph;
use sluice_state_inmemory::InMemoryStateStoreProvider;
use sluice_test_utils::data_generators::{
    create_condition_flow_graph, create_filtered_flow_graph, create_guarded_flow_graph,
    create_linear_flow_graph, create_manual_task_flow_graph, create_parallel_flow_graph,
};
use sluice_test_utils::implementations::{
    ApproveAllOperator, FailingOperator, ScriptedTaskHandler, StampingOperator,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const COMPLETION_TIMEOUT: Duration = Duration::from_secs(5);

// Wire a runtime by hand against the in-memory state stores, the way a
// host process assembles the engine.
fn build_runtime(handler: Arc<dyn TaskHandler>, retry: RetryConfig) -> Arc<FlowRuntime> {
    let provider = InMemoryStateStoreProvider::new();
    let (lock_repo, retry_repo) = provider.create_repositories();
    FlowRuntime::new(
        handler,
        Arc::new(JmespathConditionEvaluator::new()),
        lock_repo,
        retry_repo,
        RuntimeConfig {
            retry,
            ..RuntimeConfig::default()
        },
    )
}

fn retry_config(policy: RetryPolicy) -> RetryConfig {
    RetryConfig {
        policy,
        ..RetryConfig::default()
    }
}

fn deploy_graph(runtime: &Arc<FlowRuntime>, document: &str) -> FlowId {
    let definition = parse_and_validate_flow_graph(document).expect("graph should parse");
    let flow_id = definition.id.clone();
    runtime.deploy(definition).expect("graph should deploy");
    flow_id
}

// Await a completion while pumping the retry scheduler, so parked batches
// get redriven without waiting out wall-clock delays.
async fn drive_with_sweeps(
    runtime: &Arc<FlowRuntime>,
    offer: FlowOffer,
) -> FlowTransCompletionInfo {
    let scheduler = runtime.retry_scheduler();
    let mut completion = offer.completion;
    let deadline = tokio::time::Instant::now() + COMPLETION_TIMEOUT;
    loop {
        match timeout(Duration::from_millis(20), &mut completion).await {
            Ok(result) => return result.expect("completion channel dropped"),
            Err(_) => {
                assert!(
                    tokio::time::Instant::now() < deadline,
                    "trans did not complete while sweeping retries"
                );
                scheduler
                    .run_sweep_once(Utc::now())
                    .await
                    .expect("retry sweep should run");
            }
        }
    }
}

// Poll until the runtime reports at least `count` suspended batches.
async fn wait_for_pending_tasks(runtime: &Arc<FlowRuntime>, count: usize) -> Vec<PendingTask> {
    let deadline = tokio::time::Instant::now() + COMPLETION_TIMEOUT;
    loop {
        let pending = runtime.pending_tasks();
        if pending.len() >= count {
            return pending;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "no batch was suspended in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_linear_flow_carries_records_to_the_end() {
    let handler = Arc::new(ScriptedTaskHandler::new());
    let runtime = build_runtime(handler.clone(), RetryConfig::default());
    let flow_id = deploy_graph(
        &runtime,
        &create_linear_flow_graph("linear-journey", &["step.validate", "step.enrich"]),
    );

    let offer = runtime
        .offer(
            &flow_id,
            vec![
                FlowData::new(json!({"order": 1})),
                FlowData::new(json!({"order": 2})),
            ],
        )
        .expect("offer should start a trans");
    let trans_id = offer.trans.id.clone();

    let info = timeout(COMPLETION_TIMEOUT, offer.completion)
        .await
        .expect("trans should complete")
        .expect("completion channel");

    assert!(
        info.is_success(),
        "linear trans should succeed, failures: {:?}",
        info.failed()
    );
    assert_eq!(info.get_all().len(), 2, "both records should archive");
    assert!(!runtime.is_running(&trans_id));

    // The jober chains its fitables in declared order, each over the whole
    // batch.
    let order: Vec<String> = handler
        .get_invocations()
        .iter()
        .map(|invocation| invocation.fitable_id.clone())
        .collect();
    assert_eq!(order, vec!["step.validate", "step.enrich"]);
    assert_eq!(handler.get_invocations()[0].records.len(), 2);
}

#[tokio::test]
async fn test_condition_routes_each_record_by_rule() {
    let handler = Arc::new(ScriptedTaskHandler::new());
    let runtime = build_runtime(handler.clone(), RetryConfig::default());
    let flow_id = deploy_graph(
        &runtime,
        &create_condition_flow_graph("amount-split", "amount > `100`"),
    );

    let offer = runtime
        .offer(
            &flow_id,
            vec![
                FlowData::new(json!({"amount": 250})),
                FlowData::new(json!({"amount": 40})),
            ],
        )
        .expect("offer should start a trans");
    let info = timeout(COMPLETION_TIMEOUT, offer.completion)
        .await
        .expect("trans should complete")
        .expect("completion channel");

    assert!(info.is_success(), "failures: {:?}", info.failed());
    assert_eq!(info.get_all().len(), 2);

    // The large record satisfies the rule, the small one falls through to
    // the default branch.
    assert_eq!(handler.invocation_count("branch.fast"), 1);
    assert_eq!(handler.invocation_count("branch.slow"), 1);
    let invocations = handler.get_invocations();
    let fast = invocations
        .iter()
        .find(|invocation| invocation.fitable_id == "branch.fast")
        .expect("fast branch should run");
    assert_eq!(fast.records.len(), 1);
    assert_eq!(fast.records[0].as_value()["amount"], 250);
    let slow = invocations
        .iter()
        .find(|invocation| invocation.fitable_id == "branch.slow")
        .expect("slow branch should run");
    assert_eq!(slow.records[0].as_value()["amount"], 40);
}

#[tokio::test]
async fn test_parallel_duplicates_records_across_branches() {
    let handler = Arc::new(ScriptedTaskHandler::new());
    let runtime = build_runtime(handler.clone(), RetryConfig::default());
    let flow_id = deploy_graph(&runtime, &create_parallel_flow_graph("fan-out"));

    let offer = runtime
        .offer(&flow_id, vec![FlowData::new(json!({"job": "copy-me"}))])
        .expect("offer should start a trans");
    let info = timeout(COMPLETION_TIMEOUT, offer.completion)
        .await
        .expect("trans should complete")
        .expect("completion channel");

    assert!(info.is_success(), "failures: {:?}", info.failed());
    // One offered record archives once per branch.
    assert_eq!(info.get_all().len(), 2);
    assert_eq!(handler.invocation_count("branch.a"), 1);
    assert_eq!(handler.invocation_count("branch.b"), 1);
    for invocation in handler.get_invocations() {
        assert_eq!(invocation.records[0].as_value()["job"], "copy-me");
    }
}

#[tokio::test]
async fn test_filter_holds_small_batches_until_more_records_arrive() {
    let handler = Arc::new(ScriptedTaskHandler::new());
    let runtime = build_runtime(handler.clone(), RetryConfig::default());
    let flow_id = deploy_graph(&runtime, &create_filtered_flow_graph("batcher", 3));

    let offer = runtime
        .offer(
            &flow_id,
            vec![
                FlowData::new(json!({"seq": 1})),
                FlowData::new(json!({"seq": 2})),
            ],
        )
        .expect("offer should start a trans");
    let trans_id = offer.trans.id.clone();
    let mut completion = offer.completion;

    // Two records sit below the threshold; the trans stays open and the
    // jober never fires.
    assert!(
        timeout(Duration::from_millis(200), &mut completion)
            .await
            .is_err(),
        "trans must stay open below the filter threshold"
    );
    assert!(runtime.is_running(&trans_id));
    assert_eq!(handler.invocation_count("batch.process"), 0);

    // A third record published into the running trans fills the batch.
    runtime
        .inter_stream()
        .publish(FlowData::new(json!({"seq": 3})), &trans_id)
        .await
        .expect("publish into a running trans");

    let info = timeout(COMPLETION_TIMEOUT, &mut completion)
        .await
        .expect("trans should complete once the batch fills")
        .expect("completion channel");
    assert!(info.is_success(), "failures: {:?}", info.failed());
    assert_eq!(info.get_all().len(), 3);
    assert_eq!(handler.invocation_count("batch.process"), 1);
    assert_eq!(handler.get_invocations()[0].records.len(), 3);
}

#[tokio::test]
async fn test_manual_task_parks_until_an_operator_resolves_it() {
    let handler = Arc::new(ScriptedTaskHandler::new());
    let runtime = build_runtime(handler.clone(), RetryConfig::default());
    let flow_id = deploy_graph(
        &runtime,
        &create_manual_task_flow_graph("approval-gate", "gate-1"),
    );

    let offer = runtime
        .offer(
            &flow_id,
            vec![
                FlowData::new(json!({"doc": "a"})),
                FlowData::new(json!({"doc": "b"})),
            ],
        )
        .expect("offer should start a trans");
    let trans_id = offer.trans.id.clone();

    let pending = wait_for_pending_tasks(&runtime, 1).await;
    assert_eq!(pending.len(), 1);
    let batch = &pending[0];
    assert_eq!(batch.trans_id, trans_id);
    assert_eq!(batch.flow_id, flow_id);
    assert_eq!(batch.node_id.0, "review");
    assert_eq!(batch.task.task_id, "gate-1");
    assert_eq!(batch.contexts.len(), 2);
    assert_eq!(runtime.pending_tasks_for_trans(&trans_id).len(), 1);
    assert!(runtime.is_running(&trans_id));

    let operator = StampingOperator::new("approved", json!(true));
    runtime
        .resolve_task(&batch.batch_id, &operator)
        .await
        .expect("operator should resolve the batch");

    let info = timeout(COMPLETION_TIMEOUT, offer.completion)
        .await
        .expect("trans should complete after resolution")
        .expect("completion channel");
    assert!(info.is_success(), "failures: {:?}", info.failed());
    assert_eq!(info.get_all().len(), 2);
    for context in info.succeeded() {
        assert_eq!(context.data.as_value()["approved"], true);
    }
    assert!(runtime.pending_tasks().is_empty());
}

#[tokio::test]
async fn test_operator_failure_keeps_the_batch_claimable() {
    let handler = Arc::new(ScriptedTaskHandler::new());
    let runtime = build_runtime(handler.clone(), RetryConfig::default());
    let flow_id = deploy_graph(
        &runtime,
        &create_manual_task_flow_graph("strict-gate", "gate-2"),
    );

    let offer = runtime
        .offer(&flow_id, vec![FlowData::new(json!({"doc": "a"}))])
        .expect("offer should start a trans");

    let pending = wait_for_pending_tasks(&runtime, 1).await;
    let batch_id = pending[0].batch_id.clone();

    let rejecting = FailingOperator::new(FlowError::TaskError(
        "operator rejected the batch".to_string(),
    ));
    let err = runtime
        .resolve_task(&batch_id, &rejecting)
        .await
        .expect_err("a failing operator must not consume the batch");
    assert!(matches!(err, FlowError::TaskError(_)));
    assert_eq!(rejecting.operate_calls(), 1);

    // The batch went back under the same claim handle.
    let pending = runtime.pending_tasks();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].batch_id, batch_id);

    runtime
        .resolve_task(&batch_id, &ApproveAllOperator::new())
        .await
        .expect("a second operator can claim the batch");
    let info = timeout(COMPLETION_TIMEOUT, offer.completion)
        .await
        .expect("trans should complete after resolution")
        .expect("completion channel");
    assert!(info.is_success(), "failures: {:?}", info.failed());
}

#[tokio::test]
async fn test_resolving_an_unknown_batch_is_an_error() {
    let runtime = build_runtime(Arc::new(ScriptedTaskHandler::new()), RetryConfig::default());

    let err = runtime
        .resolve_task("no-such-batch", &ApproveAllOperator::new())
        .await
        .expect_err("unknown batch ids must be rejected");
    assert!(matches!(err, FlowError::TaskError(_)));
}

#[tokio::test]
async fn test_flaky_jober_retries_until_it_recovers() {
    let handler = Arc::new(ScriptedTaskHandler::new());
    handler.fail_times(
        "step.flaky",
        2,
        FlowError::ExternalDependencyError("warehouse offline".to_string()),
    );
    let runtime = build_runtime(
        handler.clone(),
        retry_config(RetryPolicy::fixed(5, Duration::ZERO)),
    );
    let flow_id = deploy_graph(
        &runtime,
        &create_linear_flow_graph("flaky-journey", &["step.flaky"]),
    );

    let offer = runtime
        .offer(&flow_id, vec![FlowData::new(json!({"parcel": 9}))])
        .expect("offer should start a trans");
    let info = drive_with_sweeps(&runtime, offer).await;

    assert!(
        info.is_success(),
        "trans should succeed after retries, failures: {:?}",
        info.failed()
    );
    assert_eq!(info.get_all().len(), 1);
    // Initial attempt plus two redrives.
    assert_eq!(handler.invocation_count("step.flaky"), 3);
}

#[tokio::test]
async fn test_exhausted_retries_fail_the_batch_and_alert() {
    let handler = Arc::new(ScriptedTaskHandler::new());
    handler.fail_always(
        "step.doomed",
        FlowError::ExternalDependencyError("endpoint gone".to_string()),
    );
    let runtime = build_runtime(
        handler.clone(),
        retry_config(RetryPolicy::fixed(2, Duration::ZERO)),
    );
    let flow_id = deploy_graph(
        &runtime,
        &create_guarded_flow_graph("doomed-journey", "step.doomed", "alert.ops"),
    );

    let offer = runtime
        .offer(&flow_id, vec![FlowData::new(json!({"parcel": 1}))])
        .expect("offer should start a trans");
    let info = drive_with_sweeps(&runtime, offer).await;

    assert!(!info.is_success());
    assert_eq!(info.failed().len(), 1);
    let error = info.failed()[0]
        .error
        .as_ref()
        .expect("failed context carries its error");
    assert_eq!(error.node_id.0, "work");
    assert!(
        error.cause.contains("Retry exhausted"),
        "cause was: {}",
        error.cause
    );
    // Initial attempt plus the two budgeted redrives.
    assert_eq!(handler.invocation_count("step.doomed"), 3);
    assert_eq!(handler.invocation_count("alert.ops"), 1);
}

#[tokio::test]
async fn test_undeploy_cuts_off_offers_and_publishes() {
    let handler = Arc::new(ScriptedTaskHandler::new());
    let runtime = build_runtime(handler.clone(), RetryConfig::default());
    let flow_id = deploy_graph(&runtime, &create_filtered_flow_graph("undeploy-journey", 2));

    let offer = runtime
        .offer(&flow_id, vec![FlowData::new(json!({"seq": 1}))])
        .expect("offer should start a trans");
    let trans_id = offer.trans.id.clone();
    let mut completion = offer.completion;

    // One record below the threshold keeps the trans open.
    assert!(
        timeout(Duration::from_millis(200), &mut completion)
            .await
            .is_err(),
        "trans must stay open below the filter threshold"
    );

    let removed = runtime.undeploy(&flow_id).expect("flow was deployed");
    assert_eq!(removed.id, flow_id);
    assert!(runtime.deployed_flows().is_empty());

    assert!(
        matches!(
            runtime.offer(&flow_id, vec![FlowData::null()]),
            Err(FlowError::DefinitionNotFound(_))
        ),
        "offers after undeploy must be rejected"
    );

    // Publishing into the still-open trans needs the definition too.
    let publish_err = runtime
        .inter_stream()
        .publish(FlowData::null(), &trans_id)
        .await
        .expect_err("publishes after undeploy must be rejected");
    assert!(matches!(publish_err, FlowError::DefinitionNotFound(_)));

    // Shutdown settles the stranded contexts.
    runtime.shutdown().await;
    let info = timeout(COMPLETION_TIMEOUT, &mut completion)
        .await
        .expect("shutdown should complete the trans")
        .expect("completion channel");
    assert!(!info.is_success());
    assert_eq!(info.failed().len(), 1);
    assert!(!runtime.is_running(&trans_id));
}
