//! Loads the rule directory into memory and publishes it as a lock-free,
//! hot-reloadable snapshot (spec.md §6, §9).
//!
//! Grounded on the teacher's `KnowledgeGraphSnapshot` / `ArcSwap` pattern
//! (examples/inputlayer-inputlayer/src/storage_engine/snapshot.rs): readers
//! (the consumer loop) take an O(1) `Arc` clone of the current rule set with
//! no locking; the scheduler publishes a freshly-parsed snapshot atomically
//! whenever the rule directory changes on disk.

use crate::assertion_store::AssertionStore;
use crate::config::BadgeIssuerConfig;
use crate::rule::Rule;
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("failed to read rule directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse YAML in {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("{path}: {source}")]
    Definition {
        path: PathBuf,
        #[source]
        source: crate::predicate::DefinitionError,
    },

    #[error("duplicate badge id `{badge_id}`: defined in both {first} and {second}")]
    DuplicateBadgeId {
        badge_id: String,
        first: PathBuf,
        second: PathBuf,
    },

    #[error("failed to register badge `{badge_id}` with the assertion store: {source}")]
    Registration {
        badge_id: String,
        #[source]
        source: crate::assertion_store::StoreError,
    },
}

static SNAPSHOT_VERSION: AtomicU64 = AtomicU64::new(0);

/// An immutable, versioned rule set. Cloning is O(1) (just an `Arc` bump).
#[derive(Clone)]
pub struct RuleSnapshot {
    pub version: u64,
    pub rules: Arc<Vec<Arc<Rule>>>,
}

impl RuleSnapshot {
    fn empty() -> Self {
        Self {
            version: SNAPSHOT_VERSION.fetch_add(1, Ordering::SeqCst),
            rules: Arc::new(Vec::new()),
        }
    }
}

/// Scan a directory of `*.yml`/`*.yaml` rule files, each containing exactly
/// one rule document, and parse every file. A single malformed file is a
/// definition error that excludes only that file's rule (spec.md §7);
/// however a badge id collision across files aborts the whole load, since
/// there is no well-defined way to pick a winner.
pub fn load_directory(dir: &Path) -> Result<Vec<Arc<Rule>>, LoadError> {
    let entries = std::fs::read_dir(dir).map_err(|source| LoadError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut rules = Vec::new();
    let mut seen_ids: HashMap<String, PathBuf> = HashMap::new();

    let mut paths: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| {
            matches!(
                p.extension().and_then(|e| e.to_str()),
                Some("yml") | Some("yaml")
            )
        })
        .collect();
    paths.sort();

    for path in paths {
        match load_file(&path) {
            Ok(rule) => {
                if let Some(existing) = seen_ids.get(&rule.badge_id) {
                    return Err(LoadError::DuplicateBadgeId {
                        badge_id: rule.badge_id,
                        first: existing.clone(),
                        second: path,
                    });
                }
                seen_ids.insert(rule.badge_id.clone(), path.clone());
                rules.push(Arc::new(rule));
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "skipping rule with definition error");
            }
        }
    }

    Ok(rules)
}

fn load_file(path: &Path) -> Result<Rule, LoadError> {
    let contents = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let doc: serde_yaml::Value =
        serde_yaml::from_str(&contents).map_err(|source| LoadError::Yaml {
            path: path.to_path_buf(),
            source,
        })?;
    Rule::parse(&doc).map_err(|source| LoadError::Definition {
        path: path.to_path_buf(),
        source,
    })
}

/// The hot-reloadable handle the consumer and scheduler share. Wraps an
/// `ArcSwap` over the current snapshot; `reload` parses the directory fresh,
/// registers every rule's badge with the assertion store (spec.md §2,
/// §4.6(d)), and republishes the snapshot atomically, never blocking a
/// concurrent reader.
pub struct RuleRepository {
    directory: PathBuf,
    assertion_store: Arc<dyn AssertionStore>,
    badge_issuer: BadgeIssuerConfig,
    current: ArcSwap<RuleSnapshot>,
}

impl RuleRepository {
    pub fn new(
        directory: impl Into<PathBuf>,
        assertion_store: Arc<dyn AssertionStore>,
        badge_issuer: BadgeIssuerConfig,
    ) -> Self {
        Self {
            directory: directory.into(),
            assertion_store,
            badge_issuer,
            current: ArcSwap::from_pointee(RuleSnapshot::empty()),
        }
    }

    /// Parse the directory, register each accepted rule's badge with the
    /// assertion store, and publish a new snapshot, replacing the old one
    /// atomically. Readers that already hold a clone of the prior snapshot
    /// keep using it until they ask again.
    pub async fn reload(&self) -> Result<usize, LoadError> {
        let rules = load_directory(&self.directory)?;
        for rule in &rules {
            self.assertion_store
                .register_badge(&rule.badge_id, &rule.badge, &self.badge_issuer)
                .await
                .map_err(|source| LoadError::Registration {
                    badge_id: rule.badge_id.clone(),
                    source,
                })?;
        }
        let count = rules.len();
        let snapshot = RuleSnapshot {
            version: SNAPSHOT_VERSION.fetch_add(1, Ordering::SeqCst),
            rules: Arc::new(rules),
        };
        self.current.store(Arc::new(snapshot));
        Ok(count)
    }

    /// An O(1) snapshot of the currently active rule set.
    pub fn snapshot(&self) -> Arc<RuleSnapshot> {
        self.current.load_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assertion_store::InMemoryAssertionStore;
    use std::io::Write;

    fn write_rule(dir: &Path, filename: &str, contents: &str) {
        let mut f = std::fs::File::create(dir.join(filename)).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    fn test_issuer() -> BadgeIssuerConfig {
        BadgeIssuerConfig {
            issuer_origin: "https://badges.fedoraproject.org".into(),
            issuer_name: "Fedora Project".into(),
            issuer_url: "https://fedoraproject.org".into(),
            issuer_email: "badges@fedoraproject.org".into(),
        }
    }

    const RULE_A: &str = r#"
name: "Rule A"
description: "desc a"
image_url: "https://badges.fedoraproject.org/images/rule-a.png"
creator: "tester"
discussion: "https://pagure.io/fedora-badges/issue/1"
issuer_id: "fedora-badges"
trigger:
  topic: foo
criteria:
  datanommer:
    filter:
      category: foo
    operation: count
    condition: { greater than or equal to: 0 }
"#;

    const RULE_B_SAME_ID: &str = r#"
name: "Rule A"
description: "desc b"
image_url: "https://badges.fedoraproject.org/images/rule-a.png"
creator: "tester"
discussion: "https://pagure.io/fedora-badges/issue/1"
issuer_id: "fedora-badges"
trigger:
  topic: bar
criteria:
  datanommer:
    filter:
      category: bar
    operation: count
    condition: { greater than or equal to: 0 }
"#;

    const RULE_MALFORMED: &str = r#"
name: "Bad Rule"
description: "desc"
image_url: "https://badges.fedoraproject.org/images/bad-rule.png"
creator: "tester"
discussion: "https://pagure.io/fedora-badges/issue/1"
issuer_id: "fedora-badges"
trigger:
  bogus_key: nope
criteria:
  datanommer:
    filter:
      category: foo
    operation: count
    condition: { greater than or equal to: 0 }
"#;

    #[test]
    fn loads_all_valid_rules_in_directory() {
        let dir = tempfile::tempdir().unwrap();
        write_rule(dir.path(), "a.yml", RULE_A);
        let rules = load_directory(dir.path()).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].badge_id, "rule-a");
    }

    #[test]
    fn skips_malformed_rule_but_loads_others() {
        let dir = tempfile::tempdir().unwrap();
        write_rule(dir.path(), "a.yml", RULE_A);
        write_rule(dir.path(), "bad.yml", RULE_MALFORMED);
        let rules = load_directory(dir.path()).unwrap();
        assert_eq!(rules.len(), 1);
    }

    #[test]
    fn duplicate_badge_id_aborts_load() {
        let dir = tempfile::tempdir().unwrap();
        write_rule(dir.path(), "a.yml", RULE_A);
        write_rule(dir.path(), "b.yml", RULE_B_SAME_ID);
        assert!(load_directory(dir.path()).is_err());
    }

    #[tokio::test]
    async fn reload_publishes_new_snapshot_atomically() {
        let dir = tempfile::tempdir().unwrap();
        write_rule(dir.path(), "a.yml", RULE_A);
        let store = Arc::new(InMemoryAssertionStore::default());
        let repo = RuleRepository::new(dir.path(), store.clone(), test_issuer());
        assert_eq!(repo.snapshot().rules.len(), 0);

        repo.reload().await.unwrap();
        let first = repo.snapshot();
        assert_eq!(first.rules.len(), 1);
        assert!(store.registered_badge("rule-a").is_some());

        write_rule(
            dir.path(),
            "b.yml",
            "name: \"Rule C\"\ndescription: d\nimage_url: u\ncreator: t\ndiscussion: u\nissuer_id: i\ntrigger:\n  topic: baz\ncriteria:\n  datanommer:\n    filter:\n      category: baz\n    operation: count\n    condition: { greater than or equal to: 0 }\n",
        );
        repo.reload().await.unwrap();
        let second = repo.snapshot();
        assert_eq!(second.rules.len(), 2);
        assert_ne!(first.version, second.version);
        assert!(store.registered_badge("rule-c").is_some());
        // The earlier snapshot handle is untouched by the later reload.
        assert_eq!(first.rules.len(), 1);
    }
}
