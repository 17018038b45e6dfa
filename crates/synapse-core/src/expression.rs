//! JEXL expression evaluator for task conditions, loop collections, switch
//! cases and event filters.
//!
//! The engines only see the `ExpressionEvaluator` trait; `JexlEvaluator`
//! wraps `jexl_eval::Evaluator` with pre-registered standard transforms.
//!
//! Documents are always passed as context objects, NEVER interpolated into
//! expression strings.

use serde_json::{Map, Value, json};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during expression evaluation.
#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("Expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("Expression did not evaluate to a boolean: got {result}")]
    NotBoolean { result: Value },

    #[error("Invalid context: {0}")]
    InvalidContext(String),
}

// ---------------------------------------------------------------------------
// Runtime expression helpers
// ---------------------------------------------------------------------------

/// Whether a string is a `${ ... }` runtime expression.
pub fn is_runtime_expression(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.starts_with("${") && trimmed.ends_with('}')
}

/// Strip the `${ ... }` wrapper, if any.
pub fn strip_expression(value: &str) -> &str {
    let trimmed = value.trim();
    if is_runtime_expression(trimmed) {
        trimmed[2..trimmed.len() - 1].trim()
    } else {
        trimmed
    }
}

/// Coerce a JSON value to boolean using JavaScript-like truthiness.
pub fn value_to_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Build the evaluation context object.
///
/// Fields of an object `data` are exposed at top level; any other document
/// is exposed as `input`. `args` are layered on top and win on collisions.
pub fn build_context(data: &Value, args: &Map<String, Value>) -> Value {
    let mut context = match data {
        Value::Object(fields) => fields.clone(),
        Value::Null => Map::new(),
        other => Map::from_iter([("input".to_string(), other.clone())]),
    };
    for (name, value) in args {
        context.insert(name.clone(), value.clone());
    }
    Value::Object(context)
}

// ---------------------------------------------------------------------------
// ExpressionEvaluator
// ---------------------------------------------------------------------------

/// Pure expression evaluation injected into both engines.
///
/// Must be deterministic for identical inputs.
pub trait ExpressionEvaluator: Send + Sync {
    /// Evaluate `expression` (with or without the `${ }` wrapper) against
    /// `data`, with `args` as additional named variables.
    fn evaluate(
        &self,
        expression: &str,
        data: &Value,
        args: &Map<String, Value>,
    ) -> Result<Value, ExpressionError>;

    /// Evaluate and coerce the result with truthiness rules.
    fn evaluate_bool(
        &self,
        expression: &str,
        data: &Value,
        args: &Map<String, Value>,
    ) -> Result<bool, ExpressionError> {
        self.evaluate(expression, data, args)
            .map(|value| value_to_bool(&value))
    }

    /// Evaluate every `${ }` string inside a document, leaving literals untouched.
    fn evaluate_document(
        &self,
        document: &Value,
        data: &Value,
        args: &Map<String, Value>,
    ) -> Result<Value, ExpressionError> {
        match document {
            Value::String(s) if is_runtime_expression(s) => self.evaluate(s, data, args),
            Value::Array(items) => items
                .iter()
                .map(|item| self.evaluate_document(item, data, args))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(fields) => {
                let mut out = Map::with_capacity(fields.len());
                for (name, value) in fields {
                    out.insert(name.clone(), self.evaluate_document(value, data, args)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// JexlEvaluator
// ---------------------------------------------------------------------------

/// JEXL expression evaluator with standard transforms pre-registered.
///
/// Used for:
/// - Task `if` conditions (e.g. `input.total > 0`)
/// - Loop collections and `while` guards
/// - Switch `when` cases
/// - Event filter attributes and correlation keys (e.g. `data.orderId`)
pub struct JexlEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl JexlEvaluator {
    /// Create a new evaluator with all standard transforms registered.
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            // String transforms
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_uppercase()))
            })
            .with_transform("trim", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.trim()))
            })
            .with_transform("split", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let delimiter = args.get(1).and_then(|v| v.as_str()).unwrap_or(",");
                let parts: Vec<&str> = s.split(delimiter).collect();
                Ok(json!(parts))
            })
            // Boolean transforms
            .with_transform("not", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(!value_to_bool(&val)))
            })
            // String search transforms
            .with_transform("contains", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let search = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.contains(search)))
            })
            .with_transform("startsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let prefix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.starts_with(prefix)))
            })
            .with_transform("endsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let suffix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.ends_with(suffix)))
            })
            // Length transform (works on strings, arrays, and objects)
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
}

impl Default for JexlEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpressionEvaluator for JexlEvaluator {
    fn evaluate(
        &self,
        expression: &str,
        data: &Value,
        args: &Map<String, Value>,
    ) -> Result<Value, ExpressionError> {
        let expression = strip_expression(expression);
        if expression.is_empty() {
            return Err(ExpressionError::EvalFailed("empty expression".to_string()));
        }
        let context = build_context(data, args);
        if !context.is_object() {
            return Err(ExpressionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }

        self.evaluator
            .eval_in_context(expression, &context)
            .map_err(|e| ExpressionError::EvalFailed(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
