//! Substitution engine (spec.md §4.1).
//!
//! Two primitives, `flatten` and `format`, plus the `resolve_lambdas`
//! auxiliary that finds `{lambda: "expr"}` nodes and replaces them with their
//! evaluated result.

use crate::expr;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Flatten a nested JSON object into a dotted-key table.
///
/// For a nested mapping under key `k` with child `k'`, emits `"k.k'"` entries
/// as well as the intermediate `"k"` entry bound to the subtree. Strings are
/// lowercased on emission; numbers, booleans, arrays, and `null` pass through
/// unchanged.
pub fn flatten(value: &Value) -> BTreeMap<String, Value> {
    let mut out = BTreeMap::new();
    flatten_into(value, None, &mut out);
    out
}

fn flatten_into(value: &Value, prefix: Option<&str>, out: &mut BTreeMap<String, Value>) {
    if let Value::Object(map) = value {
        for (key, child) in map {
            let dotted = match prefix {
                Some(p) => format!("{p}.{key}"),
                None => key.clone(),
            };
            if let Value::Object(_) = child {
                out.insert(dotted.clone(), child.clone());
                flatten_into(child, Some(&dotted), out);
            } else {
                out.insert(dotted, lower_scalar(child));
            }
        }
    }
}

fn lower_scalar(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(s.to_lowercase()),
        other => other.clone(),
    }
}

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"%\(([a-zA-Z0-9_.]+)\)([sXd])").unwrap())
}

/// Recursively copy `obj`, substituting `%(key)s`-style placeholders from
/// `subs`. A string that is *exactly* one `%(key)X` placeholder (with no
/// surrounding text) is replaced with the substitution's raw value —
/// type-preserving substitution — rather than stringified.
pub fn format(obj: &Value, subs: &BTreeMap<String, Value>) -> Value {
    match obj {
        Value::String(s) => format_string(s, subs),
        Value::Array(items) => Value::Array(items.iter().map(|v| format(v, subs)).collect()),
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                out.insert(k.clone(), format(v, subs));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

fn format_string(s: &str, subs: &BTreeMap<String, Value>) -> Value {
    let re = placeholder_regex();
    if let Some(caps) = re.captures(s) {
        let whole = caps.get(0).unwrap();
        if whole.start() == 0 && whole.end() == s.len() {
            // The entire string is one placeholder: type-preserving.
            let key = &caps[1];
            return subs.get(key).cloned().unwrap_or(Value::Null);
        }
    }
    let replaced = re.replace_all(s, |caps: &regex::Captures| {
        let key = &caps[1];
        match subs.get(key) {
            Some(Value::String(v)) => v.clone(),
            Some(v) => v.to_string(),
            None => caps[0].to_string(),
        }
    });
    Value::String(replaced.into_owned())
}

/// Find any sub-mapping of the single shape `{"lambda": "<expr>"}` and
/// replace it with the result of evaluating `<expr>` with `argument` bound to
/// `name` (spec.md §4.1 `resolve_lambdas`).
pub fn resolve_lambdas(obj: &Value, name: &str, argument: &Value) -> Value {
    match obj {
        Value::Object(map) => {
            if map.len() == 1 {
                if let Some(Value::String(expr_src)) = map.get("lambda") {
                    return expr::evaluate(expr_src, name, argument).unwrap_or(Value::Null);
                }
            }
            let mut out = Map::new();
            for (k, v) in map {
                out.insert(k.clone(), resolve_lambdas(v, name, argument));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| resolve_lambdas(v, name, argument))
                .collect(),
        ),
        other => other.clone(),
    }
}
