//! A single badge rule: the trigger/criteria predicate pair, recipient
//! extraction, and identity-translation flags that together decide who
//! earns a badge for a given message (spec.md §4.5, §6).

use crate::assertion_store::AssertionStore;
use crate::historical::ArchivalStore;
use crate::identity::{self, DirectoryClient, IdentityFlags, IdentityPolicy};
use crate::message::Message;
use crate::predicate::{DefinitionError, EvalContext, Predicate, PredicateContext};
use crate::substitution;
use serde_json::Value as Json;
use serde_yaml::Value as Yaml;
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;

/// Static metadata about the badge a rule awards, registered with the
/// assertion store once at rule-load time rather than re-derived per
/// message (spec.md §2, §4.6(d); grounded on the original's one-shot
/// `self.tahrir.add_badge(...)` call at rule construction).
#[derive(Debug, Clone)]
pub struct BadgeMetadata {
    pub name: String,
    pub description_template: String,
    pub image_url: String,
    pub creator: String,
    pub discussion_url: String,
    pub issuer_id: String,
    pub tags: Vec<String>,
}

/// A fully parsed rule: ready to evaluate against messages.
#[derive(Debug, Clone)]
pub struct Rule {
    pub badge_id: String,
    pub badge: BadgeMetadata,
    pub trigger: Predicate,
    pub criteria: Predicate,
    recipient_template: Option<String>,
    identity_flags: IdentityFlags,
}

/// Everything a rule evaluation needs beyond the message itself.
pub struct RuleContext<'a> {
    pub archival: &'a dyn ArchivalStore,
    pub directory: &'a dyn DirectoryClient,
    pub assertion_store: &'a dyn AssertionStore,
    pub identity_policy: &'a IdentityPolicy<'a>,
    pub call_timeout: Duration,
}

/// Raised when a `recipient` template resolves to an author-list entry
/// missing `name` (spec.md §4.4, "Pagure authors pattern" — a message
/// schema change, not an identifier to silently skip).
#[derive(Error, Debug)]
pub enum RecipientError {
    #[error("recipient template produced an author entry with no `name` field")]
    MissingAuthorName,
}

impl Rule {
    /// Parse one rule document (one YAML file's top-level mapping).
    pub fn parse(doc: &Yaml) -> Result<Rule, DefinitionError> {
        let map = doc.as_mapping().ok_or(DefinitionError::NotAMapping)?;

        let name = get_str(map, "name")?.to_string();
        let description_template = get_str(map, "description")?.to_string();
        let image_url = get_str(map, "image_url")?.to_string();
        let creator = get_str(map, "creator")?.to_string();
        let discussion_url = get_str(map, "discussion")?.to_string();
        let issuer_id = get_str(map, "issuer_id")?.to_string();

        let tags = match map.get(Yaml::String("tags".to_string())) {
            Some(node) => node
                .as_sequence()
                .ok_or(DefinitionError::ExpectedString("tags"))?
                .iter()
                .map(|v| v.as_str().map(str::to_string))
                .collect::<Option<Vec<_>>>()
                .ok_or(DefinitionError::ExpectedString("tags"))?,
            None => Vec::new(),
        };

        let recipient_template = map
            .get(Yaml::String("recipient".to_string()))
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let identity_flags = IdentityFlags {
            nick2fas: get_bool(map, "recipient_nick2fas"),
            email2fas: get_bool(map, "recipient_email2fas"),
            openid2fas: get_bool(map, "recipient_openid2fas"),
            github2fas: get_bool(map, "recipient_github2fas"),
            distgit2fas: get_bool(map, "recipient_distgit2fas"),
            krb2fas: get_bool(map, "recipient_krb2fas"),
        };

        let trigger_node = map
            .get(Yaml::String("trigger".to_string()))
            .ok_or(DefinitionError::MissingField("trigger"))?;
        let trigger = Predicate::parse(trigger_node, PredicateContext::Trigger)?;

        let criteria_node = map
            .get(Yaml::String("criteria".to_string()))
            .ok_or(DefinitionError::MissingField("criteria"))?;
        let criteria = Predicate::parse(criteria_node, PredicateContext::Criteria)?;

        Ok(Rule {
            badge_id: slugify(&name),
            badge: BadgeMetadata {
                name,
                description_template,
                image_url,
                creator,
                discussion_url,
                issuer_id,
                tags,
            },
            trigger,
            criteria,
            recipient_template,
            identity_flags,
        })
    }

    /// The seven-step evaluation pipeline (spec.md §4.5):
    /// 1. cheap trigger check, no I/O.
    /// 2. compute initial awardee set from `recipient` or `msg.usernames`.
    /// 3. translate identities, then filter banned/internal/dedup/opt-out.
    /// 4. bail out early if nothing survived.
    /// 5. criteria check, possibly a datanommer round-trip.
    /// 6. FAS-existence confirmation (last: most expensive, fewest candidates).
    /// 7. final recipient set.
    ///
    /// Total: never throws to the caller, even on a malformed message.
    pub async fn matches(&self, msg: &Message, ctx: &RuleContext<'_>) -> HashSet<String> {
        let eval_ctx = EvalContext {
            message: msg,
            archival: ctx.archival,
            call_timeout: ctx.call_timeout,
        };

        // 1. trigger
        if !self.trigger.matches(&eval_ctx).await {
            return HashSet::new();
        }

        // 2. initial awardee set
        let raw = match &self.recipient_template {
            Some(template) => match extract_recipients_from_template(template, msg) {
                Ok(names) => names,
                Err(err) => {
                    tracing::error!(
                        badge_id = %self.badge_id,
                        error = %err,
                        "aborting rule evaluation for this message"
                    );
                    return HashSet::new();
                }
            },
            None => msg.usernames.iter().cloned().collect(),
        };

        // 3. identity translation, then banned/internal/dedup/opt-out filters
        let translated =
            identity::translate_recipients(raw, &self.identity_flags, ctx.directory, ctx.identity_policy)
                .await;
        let awardees = identity::filter_banned_and_internal(translated, ctx.identity_policy);
        let awardees = identity::filter_already_awarded(
            ctx.assertion_store,
            &self.badge_id,
            ctx.identity_policy.primary_domain,
            awardees,
        )
        .await;
        let awardees = identity::filter_opted_out(
            ctx.assertion_store,
            ctx.identity_policy.primary_domain,
            awardees,
        )
        .await;

        // 4. nothing left, nothing to check
        if awardees.is_empty() {
            return HashSet::new();
        }

        // 5. criteria
        if !self.criteria.matches(&eval_ctx).await {
            return HashSet::new();
        }

        // 6. FAS existence, last
        identity::filter_existence(ctx.directory, ctx.identity_policy, awardees).await
    }
}

/// Expand the `recipient` template against a message: a scalar result is a
/// single recipient, `null` is none, and a list of Pagure-style author
/// mappings is reduced to their `name` fields (spec.md §4.4, §4.5 step 2,
/// §8 scenarios 3–4).
fn extract_recipients_from_template(
    template: &str,
    msg: &Message,
) -> Result<Vec<String>, RecipientError> {
    let subs_source = serde_json::json!({ "msg": msg.body_as_value() });
    let subs = substitution::flatten(&subs_source);
    let rendered = substitution::format(&Json::String(template.to_string()), &subs);

    match rendered {
        Json::Null => Ok(Vec::new()),
        Json::String(s) => Ok(vec![s]),
        Json::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Json::String(s) => Ok(s),
                Json::Object(map) => map
                    .get("name")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .ok_or(RecipientError::MissingAuthorName),
                other => Ok(other.to_string()),
            })
            .collect(),
        other => Ok(vec![other.to_string()]),
    }
}

fn get_str<'a>(
    map: &'a serde_yaml::Mapping,
    key: &'static str,
) -> Result<&'a str, DefinitionError> {
    map.get(Yaml::String(key.to_string()))
        .ok_or(DefinitionError::MissingField(key))?
        .as_str()
        .ok_or(DefinitionError::ExpectedString(key))
}

fn get_bool(map: &serde_yaml::Mapping, key: &'static str) -> bool {
    map.get(Yaml::String(key.to_string()))
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

/// Derive a badge id from its display name: lowercase, ASCII-alnum runs
/// joined by single hyphens. Mirrors `fedbadges.utils` slug derivation —
/// two rules whose names collide after slugification is a definition error
/// caught at registration time, not here (spec.md §6).
pub fn slugify(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_was_sep = true;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('-');
            last_was_sep = true;
        }
    }
    out.trim_end_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assertion_store::InMemoryAssertionStore;
    use crate::historical::InMemoryArchivalStore;
    use crate::identity::InMemoryDirectoryClient;
    use std::collections::BTreeMap;

    const SIMPLE_RULE: &str = r#"
name: "Long Life To Pork"
description: "%(msg.agent)s tagged a package for review"
image_url: "https://badges.fedoraproject.org/images/long-life-to-pork.png"
creator: "Ralph Bean"
discussion: "https://pagure.io/fedora-badges/issue/1"
issuer_id: "fedora-badges"
trigger:
  topic: pkgdb.package.new
criteria:
  datanommer:
    filter:
      category: pkgdb
    operation: count
    condition: { greater than or equal to: 1 }
"#;

    fn policy<'a>(
        banned: &'a HashSet<String>,
        prefixes: &'a [String],
    ) -> IdentityPolicy<'a> {
        IdentityPolicy {
            primary_domain: "fedoraproject.org",
            banned_accounts: banned,
            internal_ip_prefixes: prefixes,
            id_provider_hostname: "id.fedoraproject.org",
            distgit_hostname: "src.fedoraproject.org",
            verify_fas_existence: false,
        }
    }

    #[test]
    fn slugify_collapses_punctuation() {
        assert_eq!(slugify("Long Life To Pork!"), "long-life-to-pork");
        assert_eq!(slugify("  leading/trailing  "), "leading-trailing");
    }

    #[test]
    fn parses_full_rule_document() {
        let doc: Yaml = serde_yaml::from_str(SIMPLE_RULE).unwrap();
        let rule = Rule::parse(&doc).unwrap();
        assert_eq!(rule.badge_id, "long-life-to-pork");
        assert_eq!(rule.badge.creator, "Ralph Bean");
        assert_eq!(rule.badge.issuer_id, "fedora-badges");
    }

    #[test]
    fn missing_required_field_is_definition_error() {
        let doc: Yaml = serde_yaml::from_str(
            "name: x\ndescription: y\ntrigger:\n  topic: a\ncriteria:\n  datanommer:\n    filter: {}\n    operation: count\n    condition: { greater than or equal to: 0 }",
        )
        .unwrap();
        assert!(Rule::parse(&doc).is_err());
    }

    #[tokio::test]
    async fn matches_returns_recipients_when_trigger_and_criteria_pass() {
        let doc: Yaml = serde_yaml::from_str(SIMPLE_RULE).unwrap();
        let rule = Rule::parse(&doc).unwrap();

        let mut msg = Message {
            id: "1".into(),
            topic: "org.fedoraproject.prod.pkgdb.package.new".into(),
            body: BTreeMap::new(),
            usernames: HashSet::new(),
        };
        msg.usernames.insert("ralph".to_string());

        let archival = InMemoryArchivalStore { fixed_total: 4 };
        let directory = InMemoryDirectoryClient::default();
        let assertion_store = InMemoryAssertionStore::default();
        let banned = HashSet::new();
        let prefixes = vec![];
        let policy = policy(&banned, &prefixes);
        let ctx = RuleContext {
            archival: &archival,
            directory: &directory,
            assertion_store: &assertion_store,
            identity_policy: &policy,
            call_timeout: Duration::from_secs(1),
        };

        let recipients = rule.matches(&msg, &ctx).await;
        assert_eq!(recipients, ["ralph".to_string()].into());
    }

    #[tokio::test]
    async fn no_match_when_trigger_topic_differs() {
        let doc: Yaml = serde_yaml::from_str(SIMPLE_RULE).unwrap();
        let rule = Rule::parse(&doc).unwrap();

        let msg = Message {
            id: "1".into(),
            topic: "org.fedoraproject.prod.bodhi.update.request.testing".into(),
            body: BTreeMap::new(),
            usernames: HashSet::new(),
        };

        let archival = InMemoryArchivalStore { fixed_total: 100 };
        let directory = InMemoryDirectoryClient::default();
        let assertion_store = InMemoryAssertionStore::default();
        let banned = HashSet::new();
        let prefixes = vec![];
        let policy = policy(&banned, &prefixes);
        let ctx = RuleContext {
            archival: &archival,
            directory: &directory,
            assertion_store: &assertion_store,
            identity_policy: &policy,
            call_timeout: Duration::from_secs(1),
        };

        assert!(rule.matches(&msg, &ctx).await.is_empty());
    }

    #[tokio::test]
    async fn templated_recipient_extracts_single_nested_field() {
        let doc: Yaml = serde_yaml::from_str(&format!(
            "{SIMPLE_RULE}recipient: \"%(msg.agent.username)s\"\n"
        ))
        .unwrap();
        let rule = Rule::parse(&doc).unwrap();

        let mut body = BTreeMap::new();
        body.insert(
            "agent".to_string(),
            serde_json::json!({"username": "toshio"}),
        );
        body.insert("user".to_string(), serde_json::json!({"username": "ralph"}));
        let msg = Message {
            id: "1".into(),
            topic: "org.fedoraproject.prod.pkgdb.package.new".into(),
            body,
            usernames: HashSet::new(),
        };

        let archival = InMemoryArchivalStore { fixed_total: 4 };
        let directory = InMemoryDirectoryClient::default();
        let assertion_store = InMemoryAssertionStore::default();
        let banned = HashSet::new();
        let prefixes = vec![];
        let policy = policy(&banned, &prefixes);
        let ctx = RuleContext {
            archival: &archival,
            directory: &directory,
            assertion_store: &assertion_store,
            identity_policy: &policy,
            call_timeout: Duration::from_secs(1),
        };

        let recipients = rule.matches(&msg, &ctx).await;
        assert_eq!(recipients, ["toshio".to_string()].into());
    }

    #[tokio::test]
    async fn pagure_author_list_missing_name_raises_and_aborts() {
        let doc: Yaml = serde_yaml::from_str(&format!(
            "{SIMPLE_RULE}recipient: \"%(msg.authors)s\"\n"
        ))
        .unwrap();
        let rule = Rule::parse(&doc).unwrap();

        let mut body = BTreeMap::new();
        body.insert(
            "authors".to_string(),
            serde_json::json!([{"fullname": "Pierre-Yves"}]),
        );
        let msg = Message {
            id: "1".into(),
            topic: "org.fedoraproject.prod.pkgdb.package.new".into(),
            body,
            usernames: HashSet::new(),
        };

        let archival = InMemoryArchivalStore { fixed_total: 4 };
        let directory = InMemoryDirectoryClient::default();
        let assertion_store = InMemoryAssertionStore::default();
        let banned = HashSet::new();
        let prefixes = vec![];
        let policy = policy(&banned, &prefixes);
        let ctx = RuleContext {
            archival: &archival,
            directory: &directory,
            assertion_store: &assertion_store,
            identity_policy: &policy,
            call_timeout: Duration::from_secs(1),
        };

        assert!(rule.matches(&msg, &ctx).await.is_empty());
    }

    #[tokio::test]
    async fn dedup_drops_already_awarded_recipient() {
        let doc: Yaml = serde_yaml::from_str(SIMPLE_RULE).unwrap();
        let rule = Rule::parse(&doc).unwrap();

        let mut msg = Message {
            id: "1".into(),
            topic: "org.fedoraproject.prod.pkgdb.package.new".into(),
            body: BTreeMap::new(),
            usernames: HashSet::new(),
        };
        msg.usernames.insert("ralph".to_string());
        msg.usernames.insert("toshio".to_string());

        let archival = InMemoryArchivalStore { fixed_total: 4 };
        let directory = InMemoryDirectoryClient::default();
        let assertion_store = InMemoryAssertionStore::default();
        assertion_store
            .try_insert(crate::assertion_store::Assertion {
                badge_id: rule.badge_id.clone(),
                recipient: "toshio@fedoraproject.org".into(),
                issued_at_epoch_secs: 0,
                evidence_url: String::new(),
            })
            .await
            .unwrap();

        let banned = HashSet::new();
        let prefixes = vec![];
        let policy = policy(&banned, &prefixes);
        let ctx = RuleContext {
            archival: &archival,
            directory: &directory,
            assertion_store: &assertion_store,
            identity_policy: &policy,
            call_timeout: Duration::from_secs(1),
        };

        let recipients = rule.matches(&msg, &ctx).await;
        assert_eq!(recipients, ["ralph".to_string()].into());
    }
}
