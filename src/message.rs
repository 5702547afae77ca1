//! The bus message — the engine's single unit of input.
//!
//! spec.md §3: `{ id: string, topic: string, body: nested-map, usernames: set<string> }`.
//! Decoding off the wire is the bus transport's job (out of scope, §1); by the
//! time a `Message` reaches the engine it is already a typed value.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

/// An incoming activity-bus message, immutable for the duration of evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub topic: String,
    pub body: BTreeMap<String, Value>,
    pub usernames: HashSet<String>,
}

impl Message {
    /// The topic's 4th dot-delimited segment, conventionally the "category".
    ///
    /// spec.md §3: "the 4th segment is conventionally the category."
    pub fn category(&self) -> Option<&str> {
        self.topic.split('.').nth(3)
    }

    /// Render `body` as a single JSON object under the `msg` key, the shape
    /// expected by the substitution/expression layers (§4.1, §4.2 `lambda`).
    pub fn body_as_value(&self) -> Value {
        Value::Object(self.body.clone().into_iter().collect())
    }
}
