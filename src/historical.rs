//! The `datanommer` criteria leaf (spec.md §4.3): a historical-count query
//! against the archival message store, used to gate awards on "how many
//! times has this person done X before".
//!
//! Rust has no equivalent of introspecting a Python client's keyword
//! arguments at startup, so the set of recognized filter keys is a static
//! allowlist rather than something discovered from the store client
//! (an Open Question resolution recorded in SPEC_FULL.md §4.3).

use crate::predicate::EvalContext;
use crate::substitution;
use crate::{expr, message::Message};
use serde_json::Value as Json;
use serde_yaml::Value as Yaml;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Definition-time errors: a malformed `datanommer` node.
#[derive(Error, Debug)]
pub enum DefinitionError {
    #[error("datanommer node is not a mapping")]
    NotAMapping,

    #[error("datanommer node is missing required field `{0}`")]
    MissingField(&'static str),

    #[error("`filter` is not a mapping")]
    FilterNotAMapping,

    #[error("unrecognized filter key `{0}`; allowed: {1:?}")]
    UnknownFilterKey(String, &'static [&'static str]),

    #[error("`operation` must be `count`, a method-name string, or `{{lambda: \"expr\"}}`")]
    InvalidOperation,

    #[error("`condition` is not a mapping")]
    ConditionNotAMapping,

    #[error("`condition` must have exactly one key, found {0}")]
    ConditionMultipleKeys(usize),

    #[error("unrecognized condition operator `{0}`")]
    UnknownConditionKey(String),

    #[error("condition `lambda` expects a string expression")]
    InvalidConditionLambda,
}

/// Evaluation-time errors: the query ran but failed, or its result couldn't
/// be reduced by the requested operation. Always converted to a `false`
/// match by the caller (spec.md §4.3, "network failure").
#[derive(Error, Debug)]
pub enum QueryError {
    #[error("archival store query failed: {0}")]
    Store(String),

    #[error("query timed out")]
    Timeout,

    #[error("unsupported operation `{0}`")]
    UnsupportedOperation(String),
}

const ALLOWED_FILTER_KEYS: &[&str] = &[
    "topic",
    "category",
    "username",
    "package",
    "grep",
    "rows_per_page",
    "defer",
];

/// `operation` per spec.md §4.3: the literal `"count"`, an arbitrary
/// method-name string invoked on the query handle, or a `{lambda: "expr"}`
/// node evaluated with `query` bound to the query handle.
#[derive(Debug, Clone)]
pub enum Operation {
    Count,
    Method(String),
    Lambda(String),
}

/// `condition` per spec.md §4.3: a singleton named-operator mapping, or a
/// `{lambda: "expr"}` evaluated with `value` bound to the operation result.
#[derive(Debug, Clone)]
pub enum Condition {
    GreaterThan(Json),
    GreaterOrEqual(Json),
    LessThan(Json),
    LessOrEqual(Json),
    EqualTo(Json),
    NotEqual(Json),
    Lambda(String),
}

impl Condition {
    fn evaluate(&self, result: &Json) -> bool {
        match self {
            Condition::GreaterThan(t) => numeric_cmp(result, t, |a, b| a > b),
            Condition::GreaterOrEqual(t) => numeric_cmp(result, t, |a, b| a >= b),
            Condition::LessThan(t) => numeric_cmp(result, t, |a, b| a < b),
            Condition::LessOrEqual(t) => numeric_cmp(result, t, |a, b| a <= b),
            Condition::EqualTo(t) => numeric_cmp(result, t, |a, b| a == b),
            Condition::NotEqual(t) => numeric_cmp(result, t, |a, b| a != b),
            Condition::Lambda(expr_src) => expr::evaluate_bool(expr_src, "value", result),
        }
    }
}

fn as_f64(v: &Json) -> Option<f64> {
    v.as_f64().or_else(|| v.as_i64().map(|i| i as f64))
}

fn numeric_cmp(result: &Json, threshold: &Json, op: impl Fn(f64, f64) -> bool) -> bool {
    match (as_f64(result), as_f64(threshold)) {
        (Some(a), Some(b)) => op(a, b),
        _ => false,
    }
}

/// A parsed `datanommer:` node: an unresolved filter template, an operation
/// that reduces the query's result set to a scalar, and a condition
/// evaluated against that scalar.
#[derive(Debug, Clone)]
pub struct HistoricalQuery {
    filter: BTreeMap<String, Json>,
    operation: Operation,
    condition: Condition,
}

/// Filter values after message-substitution, ready to hand to the store.
#[derive(Debug, Clone, Default)]
pub struct QueryParams {
    pub topic: Option<String>,
    pub category: Option<String>,
    pub username: Option<String>,
    pub package: Option<String>,
    pub grep: Option<String>,
    pub rows_per_page: Option<u32>,
    pub defer: Option<bool>,
}

/// The reduced result of a query, ready for operation dispatch.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryResult {
    pub total: u64,
}

impl QueryResult {
    /// Reduce the query result per `operation`. `Lambda` operations run
    /// against this adapter's only query-handle state, the total count; the
    /// common `query.count()` idiom is normalized to the bound `query`
    /// identifier first, since the expression evaluator has no method-call
    /// syntax for object handles (SPEC_FULL.md §4.3 Open Question).
    pub fn apply_operation(&self, operation: &Operation) -> Result<Json, QueryError> {
        match operation {
            Operation::Count => Ok(Json::Number(self.total.into())),
            Operation::Method(name) => match name.as_str() {
                "count" => Ok(Json::Number(self.total.into())),
                other => Err(QueryError::UnsupportedOperation(other.to_string())),
            },
            Operation::Lambda(expr_src) => {
                let normalized = expr_src.replace("query.count()", "query");
                let bound = Json::Number(self.total.into());
                Ok(expr::evaluate(&normalized, "query", &bound).unwrap_or(Json::Null))
            }
        }
    }
}

/// The archival store port. A real adapter speaks datanommer's query API;
/// tests and local development use `InMemoryArchivalStore`.
pub trait ArchivalStore: Send + Sync {
    fn query<'a>(
        &'a self,
        params: &'a QueryParams,
    ) -> Pin<Box<dyn Future<Output = Result<QueryResult, QueryError>> + Send + 'a>>;
}

fn parse_operation(node: &Yaml) -> Result<Operation, DefinitionError> {
    if let Some(s) = node.as_str() {
        return Ok(if s == "count" {
            Operation::Count
        } else {
            Operation::Method(s.to_string())
        });
    }
    if let Some(map) = node.as_mapping() {
        if map.len() == 1 {
            if let Some(v) = map.get(Yaml::String("lambda".to_string())) {
                let expr_src = v.as_str().ok_or(DefinitionError::InvalidOperation)?;
                return Ok(Operation::Lambda(expr_src.to_string()));
            }
        }
    }
    Err(DefinitionError::InvalidOperation)
}

fn parse_condition(node: &Yaml) -> Result<Condition, DefinitionError> {
    let map = node.as_mapping().ok_or(DefinitionError::ConditionNotAMapping)?;
    if map.len() != 1 {
        return Err(DefinitionError::ConditionMultipleKeys(map.len()));
    }
    let (key, value) = map.iter().next().expect("checked len == 1");
    let key = key.as_str().unwrap_or_default();

    if key == "lambda" {
        let expr_src = value
            .as_str()
            .ok_or(DefinitionError::InvalidConditionLambda)?;
        return Ok(Condition::Lambda(expr_src.to_string()));
    }

    let threshold = yaml_to_json(value);
    match key {
        "greater than" | "is greater than" => Ok(Condition::GreaterThan(threshold)),
        "greater than or equal to" => Ok(Condition::GreaterOrEqual(threshold)),
        "less than" => Ok(Condition::LessThan(threshold)),
        "less than or equal to" => Ok(Condition::LessOrEqual(threshold)),
        "equal to" | "is equal to" => Ok(Condition::EqualTo(threshold)),
        "is not" | "is not equal to" => Ok(Condition::NotEqual(threshold)),
        other => Err(DefinitionError::UnknownConditionKey(other.to_string())),
    }
}

impl HistoricalQuery {
    pub fn parse(node: &Yaml) -> Result<HistoricalQuery, DefinitionError> {
        let map = node.as_mapping().ok_or(DefinitionError::NotAMapping)?;

        let filter_node = map
            .get(Yaml::String("filter".to_string()))
            .ok_or(DefinitionError::MissingField("filter"))?;
        let filter_map = filter_node
            .as_mapping()
            .ok_or(DefinitionError::FilterNotAMapping)?;

        let mut filter = BTreeMap::new();
        for (k, v) in filter_map {
            let key = k.as_str().unwrap_or_default().to_string();
            if !ALLOWED_FILTER_KEYS.contains(&key.as_str()) {
                return Err(DefinitionError::UnknownFilterKey(key, ALLOWED_FILTER_KEYS));
            }
            filter.insert(key, yaml_to_json(v));
        }

        let operation_node = map
            .get(Yaml::String("operation".to_string()))
            .ok_or(DefinitionError::MissingField("operation"))?;
        let operation = parse_operation(operation_node)?;

        let condition_node = map
            .get(Yaml::String("condition".to_string()))
            .ok_or(DefinitionError::MissingField("condition"))?;
        let condition = parse_condition(condition_node)?;

        Ok(HistoricalQuery {
            filter,
            operation,
            condition,
        })
    }

    fn resolve_params(&self, message: &Message) -> QueryParams {
        let subs_source = serde_json::json!({ "msg": message.body_as_value() });
        let subs = substitution::flatten(&subs_source);

        let mut params = QueryParams::default();
        for (key, raw) in &self.filter {
            let resolved = substitution::format(raw, &subs);
            match key.as_str() {
                "topic" => params.topic = as_string(&resolved),
                "category" => params.category = as_string(&resolved),
                "username" => params.username = as_string(&resolved),
                "package" => params.package = as_string(&resolved),
                "grep" => params.grep = as_string(&resolved),
                "rows_per_page" => params.rows_per_page = resolved.as_u64().map(|n| n as u32),
                "defer" => params.defer = resolved.as_bool(),
                _ => {}
            }
        }
        params
    }

    /// Substitute `%(dotted.path)s` placeholders inside a `{lambda: "..."}`
    /// operation against the message, mirroring `filter`'s own substitution
    /// (spec.md §8 scenario 7: "query.count() == %(msg.some_value)s").
    fn resolve_operation(&self, message: &Message) -> Operation {
        match &self.operation {
            Operation::Lambda(expr_src) => {
                let subs_source = serde_json::json!({ "msg": message.body_as_value() });
                let subs = substitution::flatten(&subs_source);
                let resolved = substitution::format(&Json::String(expr_src.clone()), &subs);
                Operation::Lambda(resolved.as_str().unwrap_or(expr_src).to_string())
            }
            other => other.clone(),
        }
    }

    pub async fn matches(&self, ctx: &EvalContext<'_>) -> bool {
        let params = self.resolve_params(ctx.message);

        let outcome = tokio::time::timeout(ctx.call_timeout, ctx.archival.query(&params)).await;
        let result = match outcome {
            Ok(Ok(r)) => r,
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "datanommer query failed, treating as no match");
                return false;
            }
            Err(_) => {
                tracing::warn!(timeout = ?ctx.call_timeout, "datanommer query timed out, treating as no match");
                return false;
            }
        };

        let operation = self.resolve_operation(ctx.message);
        let value = match result.apply_operation(&operation) {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(error = %err, "unsupported datanommer operation");
                return false;
            }
        };

        self.condition.evaluate(&value)
    }
}

fn as_string(v: &Json) -> Option<String> {
    match v {
        Json::String(s) => Some(s.clone()),
        Json::Null => None,
        other => Some(other.to_string()),
    }
}

fn yaml_to_json(v: &Yaml) -> Json {
    serde_json::to_value(v).unwrap_or(Json::Null)
}

/// The real adapter: queries datagrepper's aggregate endpoint, which already
/// reports a `total` alongside the matching rows — exactly the reduction
/// `QueryResult` needs, with no client-side counting required.
pub struct DatagrepperArchivalStore {
    http: reqwest::Client,
    base_url: String,
}

impl DatagrepperArchivalStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[derive(serde::Deserialize)]
struct DatagrepperResponse {
    total: u64,
}

impl ArchivalStore for DatagrepperArchivalStore {
    fn query<'a>(
        &'a self,
        params: &'a QueryParams,
    ) -> Pin<Box<dyn Future<Output = Result<QueryResult, QueryError>> + Send + 'a>> {
        Box::pin(async move {
            let mut query: Vec<(&str, String)> = vec![("rows_per_page".into(), "1".into())];
            if let Some(topic) = &params.topic {
                query.push(("topic", topic.clone()));
            }
            if let Some(category) = &params.category {
                query.push(("category", category.clone()));
            }
            if let Some(username) = &params.username {
                query.push(("user", username.clone()));
            }
            if let Some(package) = &params.package {
                query.push(("package", package.clone()));
            }
            if let Some(grep) = &params.grep {
                query.push(("grep", grep.clone()));
            }

            let resp = self
                .http
                .get(format!("{}/v2/search", self.base_url.trim_end_matches('/')))
                .query(&query)
                .send()
                .await
                .map_err(|e| QueryError::Store(e.to_string()))?
                .error_for_status()
                .map_err(|e| QueryError::Store(e.to_string()))?
                .json::<DatagrepperResponse>()
                .await
                .map_err(|e| QueryError::Store(e.to_string()))?;

            Ok(QueryResult { total: resp.total })
        })
    }
}

/// An in-memory double for tests: returns a fixed count regardless of
/// filter, or per-topic counts when configured.
#[derive(Debug, Default)]
pub struct InMemoryArchivalStore {
    pub fixed_total: u64,
}

impl ArchivalStore for InMemoryArchivalStore {
    fn query<'a>(
        &'a self,
        _params: &'a QueryParams,
    ) -> Pin<Box<dyn Future<Output = Result<QueryResult, QueryError>> + Send + 'a>> {
        let total = self.fixed_total;
        Box::pin(async move { Ok(QueryResult { total }) })
    }
}
