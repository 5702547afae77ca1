//! Crate-level error aggregation.
//!
//! Each subsystem owns its own narrower error enum (`predicate::DefinitionError`,
//! `historical::QueryError`, `identity::ResolverError`, `rule_repo::LoadError`,
//! `assertion_store::StoreError`, `award::AwardError`). `EngineError` exists
//! only at the boundary spec.md §7 calls fatal: process startup.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("failed to load rules from {path}: {source}")]
    RuleLoad {
        path: std::path::PathBuf,
        #[source]
        source: crate::rule_repo::LoadError,
    },

    #[error("assertion store unavailable: {0}")]
    Store(#[from] crate::assertion_store::StoreError),

    #[error("directory service unreachable: {0}")]
    Directory(#[from] reqwest::Error),

    #[error("{0}")]
    Other(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
