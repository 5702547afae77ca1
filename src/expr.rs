//! Sandboxed single-argument expression evaluator.
//!
//! This is the one sanctioned escape hatch for rule authors (spec.md §4.1):
//! `lambda` predicate leaves, historical-query operations/conditions, and
//! `resolve_lambdas` substitutions all funnel through here. It is backed by
//! `evalexpr`, which has no host-language `eval`, no assignment, no imports,
//! and no attribute access beyond what we explicitly register as functions —
//! the sandboxing is structural, not a runtime blacklist.

use crate::substitution::flatten;
use evalexpr::{
    ContextWithMutableFunctions, ContextWithMutableVariables, EvalexprError, Function,
    HashMapContext, Value as EValue,
};
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExprError {
    #[error("expression evaluation error: {0}")]
    Eval(#[from] EvalexprError),
}

pub type ExprResult<T> = Result<T, ExprError>;

fn json_to_eval(v: &Value) -> EValue {
    match v {
        Value::Null => EValue::Empty,
        Value::Bool(b) => EValue::Boolean(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                EValue::Int(i)
            } else {
                EValue::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::String(s) => EValue::String(s.clone()),
        Value::Array(items) => EValue::Tuple(items.iter().map(json_to_eval).collect()),
        // Objects have no evalexpr representation; callers access them via
        // `get(path)` instead (see `build_context`).
        Value::Object(_) => EValue::String(v.to_string()),
    }
}

fn eval_to_json(v: &EValue) -> Value {
    match v {
        EValue::String(s) => Value::String(s.clone()),
        EValue::Float(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        EValue::Int(i) => Value::Number((*i).into()),
        EValue::Boolean(b) => Value::Bool(*b),
        EValue::Tuple(items) => Value::Array(items.iter().map(eval_to_json).collect()),
        EValue::Empty => Value::Null,
    }
}

/// Look up a dotted path (e.g. `"comment.author"`) inside `argument`,
/// reusing the same flattening convention as `substitution::flatten`.
fn lookup_path(argument: &Value, path: &str) -> Value {
    if path.is_empty() {
        return argument.clone();
    }
    let flat = flatten(argument);
    flat.get(path).cloned().unwrap_or(Value::Null)
}

fn single_string_arg(value: &EValue) -> Result<String, EvalexprError> {
    Ok(value.as_string()?)
}

/// Build an evaluation context binding `name` (when scalar) and a `get(path)`
/// accessor over `argument`, plus a small allowlist of pure helper functions.
fn build_context(name: &str, argument: Value) -> HashMapContext {
    let mut ctx = HashMapContext::new();

    if !matches!(argument, Value::Object(_) | Value::Array(_)) {
        let _ = ctx.set_value(name.to_string(), json_to_eval(&argument));
    }

    let get_argument = argument.clone();
    let _ = ctx.set_function(
        "get".to_string(),
        Function::new(move |value| {
            let path = single_string_arg(value)?;
            Ok(json_to_eval(&lookup_path(&get_argument, &path)))
        }),
    );

    let _ = ctx.set_function(
        "len".to_string(),
        Function::new(|value| match value {
            EValue::String(s) => Ok(EValue::Int(s.chars().count() as i64)),
            EValue::Tuple(t) => Ok(EValue::Int(t.len() as i64)),
            EValue::Empty => Ok(EValue::Int(0)),
            other => Err(EvalexprError::expected_string(other.clone())),
        }),
    );

    let _ = ctx.set_function(
        "lower".to_string(),
        Function::new(|value| Ok(EValue::String(single_string_arg(value)?.to_lowercase()))),
    );
    let _ = ctx.set_function(
        "upper".to_string(),
        Function::new(|value| Ok(EValue::String(single_string_arg(value)?.to_uppercase()))),
    );

    let _ = ctx.set_function(
        "contains".to_string(),
        Function::new(|value| {
            let t = value.as_fixed_len_tuple(2)?;
            Ok(EValue::Boolean(
                single_string_arg(&t[0])?.contains(&single_string_arg(&t[1])?),
            ))
        }),
    );
    let _ = ctx.set_function(
        "startswith".to_string(),
        Function::new(|value| {
            let t = value.as_fixed_len_tuple(2)?;
            Ok(EValue::Boolean(
                single_string_arg(&t[0])?.starts_with(&single_string_arg(&t[1])?),
            ))
        }),
    );
    let _ = ctx.set_function(
        "endswith".to_string(),
        Function::new(|value| {
            let t = value.as_fixed_len_tuple(2)?;
            Ok(EValue::Boolean(
                single_string_arg(&t[0])?.ends_with(&single_string_arg(&t[1])?),
            ))
        }),
    );
    let _ = ctx.set_function(
        "matches".to_string(),
        Function::new(|value| {
            let t = value.as_fixed_len_tuple(2)?;
            let haystack = single_string_arg(&t[0])?;
            let pattern = single_string_arg(&t[1])?;
            let re = regex::Regex::new(&pattern)
                .map_err(|e| EvalexprError::CustomMessage(e.to_string()))?;
            Ok(EValue::Boolean(re.is_match(&haystack)))
        }),
    );
    let _ = ctx.set_function(
        "json".to_string(),
        Function::new(|value| Ok(EValue::String(eval_to_json(value).to_string()))),
    );

    ctx
}

/// Evaluate `expression` with `argument` bound to the single name `name`,
/// returning the raw result as a JSON value.
pub fn evaluate(expression: &str, name: &str, argument: &Value) -> ExprResult<Value> {
    let ctx = build_context(name, argument.clone());
    let result = evalexpr::eval_with_context(expression, &ctx)?;
    Ok(eval_to_json(&result))
}

/// Evaluate `expression` and coerce the result to a strict boolean.
///
/// Per spec.md §4.2, any evaluation error or non-boolean result is treated as
/// `false` rather than propagated — a malformed rule must never abort the
/// per-message loop.
pub fn evaluate_bool(expression: &str, name: &str, argument: &Value) -> bool {
    match evaluate(expression, name, argument) {
        Ok(Value::Bool(b)) => b,
        Ok(_) | Err(_) => false,
    }
}
