//! Assertion utilities for validating completed flow transactions.

use serde_json::Value;
use sluice_core::{FlowOffer, FlowTransCompletionInfo};
use std::time::Duration;
use thiserror::Error;

/// Error type for completion validation failures
#[derive(Debug, Error)]
pub enum CompletionValidationError {
    #[error("Trans did not succeed: {0}")]
    NotSuccessful(String),

    #[error("Trans succeeded but a failure was expected")]
    UnexpectedSuccess,

    #[error("Context count mismatch: expected {expected}, got {actual}")]
    ContextCountMismatch { expected: usize, actual: usize },

    #[error("Missing payload key: {0}")]
    MissingPayloadKey(String),

    #[error("Invalid payload value: expected {expected}, got {actual}")]
    InvalidPayloadValue { expected: String, actual: String },

    #[error("No context failed at node '{0}'")]
    MissingFailure(String),

    #[error("Invalid failure cause: expected substring {expected}, got {actual}")]
    InvalidFailureCause { expected: String, actual: String },

    #[error("Trans did not complete within {0:?}")]
    Timeout(Duration),

    #[error("Completion channel closed before the trans finished")]
    ChannelClosed,
}

/// Awaits the completion of an offered transaction, bounding the wait.
///
/// # Arguments
///
/// * `offer` - The offer handle returned by the runtime
/// * `timeout` - How long to wait before giving up
///
/// # Returns
///
/// * `Ok(FlowTransCompletionInfo)` - The completion of the transaction
/// * `Err(CompletionValidationError)` - If the wait timed out or the runtime dropped the channel
pub async fn await_completion(
    offer: FlowOffer,
    timeout: Duration,
) -> Result<FlowTransCompletionInfo, CompletionValidationError> {
    match tokio::time::timeout(timeout, offer.completion).await {
        Ok(Ok(info)) => Ok(info),
        Ok(Err(_)) => Err(CompletionValidationError::ChannelClosed),
        Err(_) => Err(CompletionValidationError::Timeout(timeout)),
    }
}

/// Asserts that a completed transaction succeeded.
///
/// # Arguments
///
/// * `info` - The completion to validate
///
/// # Returns
///
/// * `Ok(())` - If every context succeeded and at least one exists
/// * `Err(CompletionValidationError)` - Otherwise, carrying the failure causes
pub fn assert_trans_succeeded(
    info: &FlowTransCompletionInfo,
) -> Result<(), CompletionValidationError> {
    if info.is_success() {
        return Ok(());
    }
    let causes: Vec<String> = info
        .failed()
        .iter()
        .map(|context| match &context.error {
            Some(error) => format!("{} at {}", error.cause, error.node_id.0),
            None => "unknown failure".to_string(),
        })
        .collect();
    let summary = if causes.is_empty() {
        "no contexts reached a terminal state".to_string()
    } else {
        causes.join("; ")
    };
    Err(CompletionValidationError::NotSuccessful(summary))
}

/// Asserts that a completed transaction carries at least one failed context.
///
/// # Arguments
///
/// * `info` - The completion to validate
///
/// # Returns
///
/// * `Ok(())` - If some context terminally failed
/// * `Err(CompletionValidationError)` - If the transaction succeeded
pub fn assert_trans_failed(
    info: &FlowTransCompletionInfo,
) -> Result<(), CompletionValidationError> {
    if info.failed().is_empty() {
        return Err(CompletionValidationError::UnexpectedSuccess);
    }
    Ok(())
}

/// Asserts that a completed transaction produced the expected number of
/// terminal contexts, successes and failures alike.
///
/// # Arguments
///
/// * `info` - The completion to validate
/// * `expected` - The expected context count
///
/// # Returns
///
/// * `Ok(())` - If the counts match
/// * `Err(CompletionValidationError)` - Otherwise
pub fn assert_completed_count(
    info: &FlowTransCompletionInfo,
    expected: usize,
) -> Result<(), CompletionValidationError> {
    let actual = info.get_all().len();
    if actual != expected {
        return Err(CompletionValidationError::ContextCountMismatch { expected, actual });
    }
    Ok(())
}

/// Asserts that every succeeded context carries the expected payload key
/// with the expected value.
///
/// # Arguments
///
/// * `info` - The completion to validate
/// * `key` - The expected payload key
/// * `expected_value` - The expected value (as a JSON value)
///
/// # Returns
///
/// * `Ok(())` - If every succeeded payload matches
/// * `Err(CompletionValidationError)` - Otherwise
pub fn assert_payloads_contain(
    info: &FlowTransCompletionInfo,
    key: &str,
    expected_value: Value,
) -> Result<(), CompletionValidationError> {
    for context in info.succeeded() {
        let value = context
            .data
            .as_value()
            .get(key)
            .ok_or_else(|| CompletionValidationError::MissingPayloadKey(key.to_string()))?;
        if value != &expected_value {
            return Err(CompletionValidationError::InvalidPayloadValue {
                expected: expected_value.to_string(),
                actual: value.to_string(),
            });
        }
    }
    Ok(())
}

/// Asserts that some context terminally failed at the given node with the
/// expected cause.
///
/// # Arguments
///
/// * `info` - The completion to validate
/// * `node_id` - The node the failure is expected at
/// * `cause_contains` - A substring that should be present in the cause
///
/// # Returns
///
/// * `Ok(())` - If a matching failure exists
/// * `Err(CompletionValidationError)` - Otherwise
pub fn assert_failed_at(
    info: &FlowTransCompletionInfo,
    node_id: &str,
    cause_contains: &str,
) -> Result<(), CompletionValidationError> {
    let mut causes_at_node = Vec::new();
    for context in info.failed() {
        if let Some(error) = &context.error {
            if error.node_id.0 == node_id {
                if error.cause.contains(cause_contains) {
                    return Ok(());
                }
                causes_at_node.push(error.cause.clone());
            }
        }
    }
    if causes_at_node.is_empty() {
        return Err(CompletionValidationError::MissingFailure(
            node_id.to_string(),
        ));
    }
    Err(CompletionValidationError::InvalidFailureCause {
        expected: cause_contains.to_string(),
        actual: causes_at_node.join("; "),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sluice_core::{
        ContextErrorInfo, FlowContext, FlowData, FlowId, FlowTrans, NodeId,
    };

    fn completion(
        archived: Vec<Value>,
        failed: Vec<(&str, &str)>,
    ) -> FlowTransCompletionInfo {
        let trans = FlowTrans::new(FlowId("flow-1".to_string()));
        let mut contexts = Vec::new();
        for payload in archived {
            let mut context =
                FlowContext::new(&trans, NodeId("end".to_string()), FlowData::new(payload));
            context.archive().unwrap();
            contexts.push(context);
        }
        for (node, cause) in failed {
            let mut context =
                FlowContext::new(&trans, NodeId(node.to_string()), FlowData::null());
            context
                .fail(ContextErrorInfo::new(NodeId(node.to_string()), cause))
                .unwrap();
            contexts.push(context);
        }
        FlowTransCompletionInfo::new(trans, contexts)
    }

    #[test]
    fn test_assert_trans_succeeded() {
        let success = completion(vec![json!({"n": 1})], vec![]);
        assert!(assert_trans_succeeded(&success).is_ok());

        let failure = completion(vec![], vec![("work", "jober exploded")]);
        let err = assert_trans_succeeded(&failure).unwrap_err();
        assert!(err.to_string().contains("jober exploded"));

        // A trans with no terminal contexts is not a success either.
        let empty = completion(vec![], vec![]);
        assert!(assert_trans_succeeded(&empty).is_err());
    }

    #[test]
    fn test_assert_trans_failed() {
        let failure = completion(vec![], vec![("work", "boom")]);
        assert!(assert_trans_failed(&failure).is_ok());

        let success = completion(vec![json!(1)], vec![]);
        assert!(assert_trans_failed(&success).is_err());
    }

    #[test]
    fn test_assert_completed_count() {
        let info = completion(vec![json!(1), json!(2)], vec![("work", "boom")]);
        assert!(assert_completed_count(&info, 3).is_ok());
        assert!(assert_completed_count(&info, 2).is_err());
    }

    #[test]
    fn test_assert_payloads_contain() {
        let info = completion(
            vec![json!({"state": "done"}), json!({"state": "done"})],
            vec![],
        );
        assert!(assert_payloads_contain(&info, "state", json!("done")).is_ok());
        assert!(assert_payloads_contain(&info, "state", json!("pending")).is_err());
        assert!(assert_payloads_contain(&info, "missing", json!(1)).is_err());
    }

    #[test]
    fn test_assert_failed_at() {
        let info = completion(vec![], vec![("work", "dependency timed out")]);

        assert!(assert_failed_at(&info, "work", "timed out").is_ok());
        assert!(matches!(
            assert_failed_at(&info, "other", "timed out"),
            Err(CompletionValidationError::MissingFailure(_))
        ));
        assert!(matches!(
            assert_failed_at(&info, "work", "unrelated"),
            Err(CompletionValidationError::InvalidFailureCause { .. })
        ));
    }

    #[tokio::test]
    async fn test_await_completion_resolves() {
        let trans = FlowTrans::new(FlowId("flow-1".to_string()));
        let (tx, rx) = tokio::sync::oneshot::channel();
        let offer = FlowOffer {
            trans: trans.clone(),
            completion: rx,
        };

        tx.send(FlowTransCompletionInfo::new(trans, Vec::new()))
            .ok();
        let info = await_completion(offer, Duration::from_secs(1)).await.unwrap();
        assert_eq!(info.get_all().len(), 0);
    }

    #[tokio::test]
    async fn test_await_completion_times_out() {
        let trans = FlowTrans::new(FlowId("flow-1".to_string()));
        let (_tx, rx) = tokio::sync::oneshot::channel::<FlowTransCompletionInfo>();
        let offer = FlowOffer {
            trans,
            completion: rx,
        };

        let err = await_completion(offer, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, CompletionValidationError::Timeout(_)));
    }
}
