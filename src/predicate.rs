//! The predicate tree (spec.md §4.2): parsed form of a rule's `trigger` and
//! `criteria`. Recursive nodes with leaf matchers and boolean operators
//! `all` / `any` / `not`, plus an embedded-expression leaf.

use crate::historical::HistoricalQuery;
use crate::message::Message;
use crate::{expr, historical};
use serde_yaml::Value as Yaml;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while constructing a rule's trigger/criteria tree.
/// These are always definition-time: a malformed YAML node excludes the
/// whole rule from the active set (spec.md §7, "Definition error").
#[derive(Error, Debug)]
pub enum DefinitionError {
    #[error("predicate node has no recognized key: {0:?}")]
    UnknownKey(Vec<String>),

    #[error("rule is missing required field `{0}`")]
    MissingField(&'static str),

    #[error("predicate node must have exactly one key, found {0}")]
    MultipleKeys(usize),

    #[error("operator {0:?} requires a list operand")]
    OperatorNotList(&'static str),

    #[error("`not` requires a single child node")]
    NotRequiresSingleNode,

    #[error("predicate node is not a mapping")]
    NotAMapping,

    #[error("leaf `{0}` expects a string value")]
    ExpectedString(&'static str),

    #[error("historical-query error: {0}")]
    Historical(#[from] historical::DefinitionError),
}

/// Which top-level keys are legal: `Trigger` allows `topic`/`category`/
/// `lambda`; `Criteria` allows `datanommer`. Both allow the boolean operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredicateContext {
    Trigger,
    Criteria,
}

/// A parsed trigger or criteria node.
#[derive(Debug, Clone)]
pub enum Predicate {
    All(Vec<Predicate>),
    Any(Vec<Predicate>),
    Not(Box<Predicate>),
    TopicEquals(String),
    CategoryEquals(String),
    Expression(String),
    HistoricalQuery(HistoricalQuery),
}

/// Everything a leaf predicate needs to evaluate against one message.
pub struct EvalContext<'a> {
    pub message: &'a Message,
    pub archival: &'a dyn historical::ArchivalStore,
    pub call_timeout: Duration,
}

impl Predicate {
    /// Parse a single-key YAML node into a `Predicate`.
    pub fn parse(node: &Yaml, ctx: PredicateContext) -> Result<Predicate, DefinitionError> {
        let map = node.as_mapping().ok_or(DefinitionError::NotAMapping)?;
        if map.len() != 1 {
            return Err(DefinitionError::MultipleKeys(map.len()));
        }
        let (key, value) = map.iter().next().expect("checked len == 1");
        let key = key.as_str().unwrap_or_default();

        match key {
            "all" => Ok(Predicate::All(parse_list(value, "all", ctx)?)),
            "any" => Ok(Predicate::Any(parse_list(value, "any", ctx)?)),
            "not" => {
                // spec.md §4.2 step 2: wrap the single child as a one-element
                // list and store as `Not`; negating a one-item conjunction is
                // equivalent to negating the item directly.
                let child = Predicate::parse(value, ctx)
                    .map_err(|_| DefinitionError::NotRequiresSingleNode)?;
                Ok(Predicate::Not(Box::new(child)))
            }
            "topic" if ctx == PredicateContext::Trigger => Ok(Predicate::TopicEquals(
                value
                    .as_str()
                    .ok_or(DefinitionError::ExpectedString("topic"))?
                    .to_string(),
            )),
            "category" if ctx == PredicateContext::Trigger => Ok(Predicate::CategoryEquals(
                value
                    .as_str()
                    .ok_or(DefinitionError::ExpectedString("category"))?
                    .to_string(),
            )),
            "lambda" if ctx == PredicateContext::Trigger => Ok(Predicate::Expression(
                value
                    .as_str()
                    .ok_or(DefinitionError::ExpectedString("lambda"))?
                    .to_string(),
            )),
            "datanommer" if ctx == PredicateContext::Criteria => Ok(Predicate::HistoricalQuery(
                HistoricalQuery::parse(value)?,
            )),
            other => Err(DefinitionError::UnknownKey(vec![other.to_string()])),
        }
    }

    /// Evaluate this node against a message. Boxed-future recursion: leaf
    /// evaluation may require a network round-trip to the archival store.
    pub fn matches<'a>(
        &'a self,
        ctx: &'a EvalContext<'a>,
    ) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
        Box::pin(async move {
            match self {
                Predicate::All(children) => {
                    for child in children {
                        if !child.matches(ctx).await {
                            return false;
                        }
                    }
                    true
                }
                Predicate::Any(children) => {
                    for child in children {
                        if child.matches(ctx).await {
                            return true;
                        }
                    }
                    false
                }
                Predicate::Not(child) => !child.matches(ctx).await,
                Predicate::TopicEquals(suffix) => ctx.message.topic.ends_with(suffix.as_str()),
                Predicate::CategoryEquals(cat) => {
                    ctx.message.category() == Some(cat.as_str())
                }
                Predicate::Expression(src) => {
                    expr::evaluate_bool(src, "msg", &ctx.message.body_as_value())
                }
                Predicate::HistoricalQuery(query) => query.matches(ctx).await,
            }
        })
    }
}

fn parse_list(
    value: &Yaml,
    op: &'static str,
    ctx: PredicateContext,
) -> Result<Vec<Predicate>, DefinitionError> {
    let seq = value
        .as_sequence()
        .ok_or(DefinitionError::OperatorNotList(op))?;
    seq.iter().map(|n| Predicate::parse(n, ctx)).collect()
}
