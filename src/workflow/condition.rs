//! Guard and Mapping Evaluation
//!
//! Step guards (`conditionExpression`), input/output mappings and
//! notification templates are all evaluated against one JSON scope:
//!
//! ```json
//! {
//!   "context":  { ...instance contextData... },
//!   "input":    { ...instance inputData... },
//!   "steps":    { "<stepName>": { "output": { ... }, "status": "COMPLETED" } },
//!   "instance": { "entityType": "...", "entityId": "...", "businessKey": "...", "priority": 5 }
//! }
//! ```
//!
//! Expressions use JEXL syntax. Payloads are passed as context objects and
//! are never spliced into expression text.

use std::collections::BTreeMap;

use serde_json::{json, Value};
use thiserror::Error;

use super::model::DataMap;

/// Errors that can occur during expression evaluation.
#[derive(Debug, Error)]
pub enum ExpressionError {
    #[error("expression '{expression}' failed: {reason}")]
    EvalFailed { expression: String, reason: String },

    #[error("scope must be a JSON object")]
    InvalidScope,
}

/// JEXL evaluator with a small set of string transforms registered.
pub struct ConditionEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl ConditionEvaluator {
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_uppercase()))
            })
            .with_transform("not", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(!is_truthy(&val)))
            })
            .with_transform("contains", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let search = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.contains(search)))
            })
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.len(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            });

        Self { evaluator }
    }

    /// Evaluates an expression to its raw JSON value.
    pub fn evaluate(&self, expression: &str, scope: &Value) -> Result<Value, ExpressionError> {
        if !scope.is_object() {
            return Err(ExpressionError::InvalidScope);
        }
        self.evaluator
            .eval_in_context(expression, scope)
            .map_err(|e| ExpressionError::EvalFailed {
                expression: expression.to_string(),
                reason: e.to_string(),
            })
    }

    /// Evaluates a guard with JavaScript-style truthiness.
    pub fn evaluate_bool(&self, expression: &str, scope: &Value) -> Result<bool, ExpressionError> {
        self.evaluate(expression, scope).map(|v| is_truthy(&v))
    }

    /// Builds a step input from an input mapping.
    ///
    /// An empty mapping passes the instance context through unchanged.
    pub fn map_input(
        &self,
        mapping: &BTreeMap<String, String>,
        context: &DataMap,
        scope: &Value,
    ) -> Result<DataMap, ExpressionError> {
        if mapping.is_empty() {
            return Ok(context.clone());
        }

        let mut input = DataMap::new();
        for (key, expression) in mapping {
            input.insert(key.clone(), self.evaluate(expression, scope)?);
        }
        Ok(input)
    }

    /// Projects a step output into context updates.
    ///
    /// An empty mapping merges every key of the output.
    pub fn map_output(
        &self,
        mapping: &BTreeMap<String, String>,
        output: &DataMap,
    ) -> Result<DataMap, ExpressionError> {
        if mapping.is_empty() {
            return Ok(output.clone());
        }

        let scope = json!({ "output": output });
        let mut updates = DataMap::new();
        for (key, expression) in mapping {
            updates.insert(key.clone(), self.evaluate(expression, &scope)?);
        }
        Ok(updates)
    }
}

impl Default for ConditionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

/// JavaScript-like truthiness for JSON values.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Replaces `{{ path.to.value }}` placeholders with values from the scope.
///
/// Unresolvable placeholders are left in place.
pub fn render_template(template: &str, scope: &Value) -> String {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start..].find("}}") else {
            break;
        };
        let end = start + len + 2;
        let path = rest[start + 2..end - 2].trim();

        output.push_str(&rest[..start]);
        match lookup_path(scope, path) {
            Some(value) => output.push_str(&value_to_string(value)),
            None => output.push_str(&rest[start..end]),
        }
        rest = &rest[end..];
    }

    output.push_str(rest);
    output
}

/// Resolves a dotted path such as `context.staff.name`.
pub fn lookup_path<'a>(scope: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return None;
    }
    path.split('.')
        .try_fold(scope, |current, segment| current.get(segment))
}

/// Convert a JSON value to a display string for template rendering.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}
