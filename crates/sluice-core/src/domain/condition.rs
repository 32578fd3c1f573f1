//! Condition evaluation for condition-node events.
//!
//! A `conditionRule` is a JMESPath expression evaluated against a context's
//! payload; the branch is taken when the expression yields boolean `true`.

use crate::error::FlowError;

/// Evaluates event condition rules against a context payload
pub trait ConditionEvaluator: Send + Sync {
    /// Evaluate a rule against a payload, returning whether the branch
    /// should be taken
    fn evaluate(&self, rule: &str, payload: &serde_json::Value) -> Result<bool, FlowError>;
}

/// JMESPath-backed condition evaluator
#[derive(Debug, Default)]
pub struct JmespathConditionEvaluator;

impl JmespathConditionEvaluator {
    /// Create a new evaluator
    pub fn new() -> Self {
        JmespathConditionEvaluator
    }
}

impl ConditionEvaluator for JmespathConditionEvaluator {
    fn evaluate(&self, rule: &str, payload: &serde_json::Value) -> Result<bool, FlowError> {
        let compiled = jmespath::compile(rule).map_err(|e| {
            FlowError::ConditionEvaluationError(format!(
                "Failed to compile condition rule '{}': {}",
                rule, e
            ))
        })?;

        let result = compiled.search(payload).map_err(|e| {
            FlowError::ConditionEvaluationError(format!(
                "Failed to evaluate condition rule '{}': {}",
                rule, e
            ))
        })?;

        // Convert the jmespath result back to a JSON value; only a literal
        // boolean true satisfies the rule.
        let json_value = serde_json::to_value(result)
            .map_err(|e| FlowError::ConditionEvaluationError(e.to_string()))?;

        Ok(json_value == serde_json::Value::Bool(true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_comparison_rule() {
        let evaluator = JmespathConditionEvaluator::new();
        let payload = json!({"amount": 15});

        assert!(evaluator.evaluate("amount > `10`", &payload).unwrap());
        assert!(!evaluator.evaluate("amount > `20`", &payload).unwrap());
    }

    #[test]
    fn test_boolean_field_rule() {
        let evaluator = JmespathConditionEvaluator::new();

        assert!(evaluator
            .evaluate("approved", &json!({"approved": true}))
            .unwrap());
        assert!(!evaluator
            .evaluate("approved", &json!({"approved": false}))
            .unwrap());
    }

    #[test]
    fn test_non_boolean_result_is_not_satisfied() {
        let evaluator = JmespathConditionEvaluator::new();
        let payload = json!({"name": "sluice"});

        // A string result is not a satisfied branch.
        assert!(!evaluator.evaluate("name", &payload).unwrap());
    }

    #[test]
    fn test_missing_field_is_not_satisfied() {
        let evaluator = JmespathConditionEvaluator::new();
        assert!(!evaluator.evaluate("missing", &json!({})).unwrap());
    }

    #[test]
    fn test_invalid_expression_is_an_error() {
        let evaluator = JmespathConditionEvaluator::new();
        let err = evaluator.evaluate("][", &json!({})).unwrap_err();
        assert!(matches!(err, FlowError::ConditionEvaluationError(_)));
    }
}
