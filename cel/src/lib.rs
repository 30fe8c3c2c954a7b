//! CEL expression compilation and evaluation.
//!
//! Compiles once at policy/config load time, evaluates many times per event.
//! Evaluation never propagates an error to its caller: a malformed expression
//! or a runtime evaluation failure coerces to `false` (for predicates) or the
//! empty string (for templating variables) rather than wedging the pipeline.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use cel_interpreter::objects::{Key, Map as CelMap};
use cel_interpreter::{Context, Program, Value as CelValue};

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("failed to parse CEL expression: {0}")]
    Parse(String),
}

/// Upper bound on how long a single evaluation may run. `cel-interpreter`
/// has no instruction-budget or step-count knob to pass at compile time, so
/// a pathological expression (an unbounded comprehension over a large list,
/// say) is bounded here instead: the evaluation runs on a dedicated thread
/// and anything still running past this deadline is abandoned rather than
/// waited on. The thread itself keeps running to completion in the
/// background; this only bounds how long the calling request blocks on it.
const EVAL_TIMEOUT: Duration = Duration::from_millis(50);

/// Runs `f` on its own thread and waits at most [`EVAL_TIMEOUT`] for a
/// result, returning `None` on timeout.
fn run_bounded<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> Option<T> {
    let (tx, rx) = mpsc::channel();
    if thread::Builder::new()
        .name("cel-eval".to_string())
        .spawn(move || {
            let _ = tx.send(f());
        })
        .is_err()
    {
        return None;
    }
    rx.recv_timeout(EVAL_TIMEOUT).ok()
}

/// A CEL expression compiled once at load time.
#[derive(Clone)]
pub struct CompiledExpression {
    source: Arc<str>,
    program: Arc<Program>,
}

impl std::fmt::Debug for CompiledExpression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledExpression")
            .field("source", &self.source)
            .finish()
    }
}

impl CompiledExpression {
    pub fn compile(source: &str) -> Result<Self, CompileError> {
        let program = Program::compile(source).map_err(|e| CompileError::Parse(e.to_string()))?;
        Ok(CompiledExpression {
            source: Arc::from(source),
            program: Arc::new(program),
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against `obj`, bound as the `obj` variable. Any evaluation
    /// error, non-boolean result, or evaluation that exceeds [`EVAL_TIMEOUT`]
    /// is treated as `false`.
    pub fn eval_bool(&self, obj: &serde_json::Value) -> bool {
        let program = self.program.clone();
        let source = self.source.clone();
        let obj = obj.clone();
        run_bounded(move || {
            let mut ctx = Context::default();
            if ctx.add_variable("obj", json_to_cel(&obj)).is_err() {
                return false;
            }
            match program.execute(&ctx) {
                Ok(CelValue::Bool(b)) => b,
                Ok(_) => {
                    tracing::debug!(expr = %source, "CEL expression did not return a boolean");
                    false
                }
                Err(e) => {
                    tracing::debug!(expr = %source, error = %e, "CEL evaluation failed");
                    false
                }
            }
        })
        .unwrap_or_else(|| {
            tracing::warn!(expr = %self.source, "CEL evaluation exceeded its time bound, treating as false");
            false
        })
    }

    /// Evaluate against `obj` and coerce the result to a list of strings.
    /// A scalar result becomes a single-element list; any evaluation error,
    /// `null` result, or evaluation that exceeds [`EVAL_TIMEOUT`] becomes an
    /// empty list.
    pub fn eval_string_list(&self, obj: &serde_json::Value) -> Vec<String> {
        let program = self.program.clone();
        let source = self.source.clone();
        let obj = obj.clone();
        run_bounded(move || {
            let mut ctx = Context::default();
            if ctx.add_variable("obj", json_to_cel(&obj)).is_err() {
                return Vec::new();
            }
            match program.execute(&ctx) {
                Ok(value) => cel_value_to_strings(&value),
                Err(e) => {
                    tracing::debug!(expr = %source, error = %e, "CEL evaluation failed");
                    Vec::new()
                }
            }
        })
        .unwrap_or_else(|| {
            tracing::warn!(expr = %self.source, "CEL evaluation exceeded its time bound, treating as an empty list");
            Vec::new()
        })
    }
}

fn cel_value_to_strings(value: &CelValue) -> Vec<String> {
    match value {
        CelValue::Null => Vec::new(),
        CelValue::List(items) => items.iter().map(cel_value_to_string).collect(),
        other => vec![cel_value_to_string(other)],
    }
}

fn cel_value_to_string(value: &CelValue) -> String {
    match value {
        CelValue::String(s) => s.as_str().to_string(),
        CelValue::Int(i) => i.to_string(),
        CelValue::UInt(u) => u.to_string(),
        CelValue::Float(f) => f.to_string(),
        CelValue::Bool(b) => b.to_string(),
        CelValue::Bytes(b) => String::from_utf8_lossy(b).to_string(),
        CelValue::Null => String::new(),
        other => format!("{other:?}"),
    }
}

/// Converts a `serde_json::Value` into the dynamically-typed map CEL
/// evaluates against (the resource object binds as `obj`, per the
/// specification's "dynamically-typed map" evaluation environment).
fn json_to_cel(value: &serde_json::Value) -> CelValue {
    match value {
        serde_json::Value::Null => CelValue::Null,
        serde_json::Value::Bool(b) => CelValue::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                CelValue::Int(i)
            } else if let Some(u) = n.as_u64() {
                CelValue::UInt(u)
            } else {
                CelValue::Float(n.as_f64().unwrap_or_default())
            }
        }
        serde_json::Value::String(s) => CelValue::String(Arc::new(s.clone())),
        serde_json::Value::Array(items) => {
            CelValue::List(Arc::new(items.iter().map(json_to_cel).collect()))
        }
        serde_json::Value::Object(obj) => {
            let mut map = HashMap::new();
            for (k, v) in obj {
                map.insert(Key::String(Arc::new(k.clone())), json_to_cel(v));
            }
            CelValue::Map(CelMap { map: Arc::new(map) })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod() -> serde_json::Value {
        serde_json::json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "a", "namespace": "default", "uid": "1"},
            "spec": {"containers": [{"name": "a"}, {"name": "b"}]},
        })
    }

    #[test]
    fn literal_true_evaluates_true() {
        let expr = CompiledExpression::compile("true").unwrap();
        assert!(expr.eval_bool(&pod()));
    }

    #[test]
    fn field_access_on_resource() {
        let expr = CompiledExpression::compile("obj.kind == \"Pod\"").unwrap();
        assert!(expr.eval_bool(&pod()));
    }

    #[test]
    fn non_boolean_result_is_false() {
        let expr = CompiledExpression::compile("obj.kind").unwrap();
        assert!(!expr.eval_bool(&pod()));
    }

    #[test]
    fn malformed_variable_access_is_false_not_panic() {
        let expr = CompiledExpression::compile("obj.spec.doesNotExist == \"x\"").unwrap();
        assert!(!expr.eval_bool(&pod()));
    }

    #[test]
    fn container_name_fan_out() {
        let expr = CompiledExpression::compile("obj.spec.containers.map(m, m.name)").unwrap();
        let names = expr.eval_string_list(&pod());
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn compile_error_is_reported() {
        assert!(CompiledExpression::compile("((( not valid").is_err());
    }

    #[test]
    fn run_bounded_returns_result_within_budget() {
        assert_eq!(run_bounded(|| 1 + 1), Some(2));
    }

    #[test]
    fn run_bounded_times_out_on_a_stuck_task() {
        let result = run_bounded(|| {
            thread::sleep(EVAL_TIMEOUT * 10);
            "too slow"
        });
        assert_eq!(result, None);
    }
}
