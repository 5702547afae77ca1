//! # badgekeeper
//!
//! An event-driven badge-awarding rule engine. Rules are declarative YAML
//! documents describing a `trigger` (a cheap, I/O-free predicate over a bus
//! message) and a `criteria` (which may consult the archival message store
//! for historical counts). A message that satisfies the trigger yields an
//! initial set of raw recipient identifiers (from `msg.usernames` or a
//! `recipient` template); each is translated to a FAS account name, filtered
//! for banned/internal/already-awarded/opted-out accounts, checked against
//! criteria, and finally confirmed to exist before being awarded the badge
//! at most once.
//!
//! ## Pipeline
//!
//! ```text
//! MessageBus
//!     -> Message
//! RuleRepository::snapshot()
//!     -> Arc<[Rule]>             (hot-reloaded by Scheduler, never blocks readers)
//! Rule::matches(msg)
//!     -> trigger predicate               (§4.2, no I/O)
//!     -> raw recipients                  (msg.usernames or `recipient` template)
//!     -> identity::translate_recipients  (§4.4, may query DirectoryClient)
//!     -> identity::filter_banned_and_internal
//!     -> identity::filter_already_awarded  (may query AssertionStore)
//!     -> identity::filter_opted_out        (may query AssertionStore)
//!     -> criteria predicate               (§4.3, may query ArchivalStore)
//!     -> identity::filter_existence        (last: confirms against DirectoryClient)
//!     -> HashSet<String>          (recipients, bare FAS usernames)
//! award::award_one per recipient
//!     -> AssertionStore::ensure_person_exists
//!     -> AssertionStore::try_insert (at-most-once)
//!     -> Notifier::notify           (best-effort, backed off)
//! ```
//!
//! ## Module organization
//!
//! | Module | Purpose |
//! |---|---|
//! | [`message`] | The bus message type |
//! | [`expr`] | Sandboxed expression evaluator for `lambda` leaves |
//! | [`substitution`] | `flatten`/`format`/`resolve_lambdas` |
//! | [`predicate`] | Trigger/criteria predicate tree |
//! | [`historical`] | `datanommer` criteria leaf and archival-store port |
//! | [`identity`] | Cross-namespace identity resolution |
//! | [`rule`] | One parsed rule: metadata + trigger + criteria |
//! | [`rule_repo`] | Rule-directory scanning and hot-reloadable snapshots |
//! | [`vcs`] | Rule-directory git bookkeeping |
//! | [`bus`] | Activity-bus consumer port |
//! | [`assertion_store`] | At-most-once award ledger |
//! | [`award`] | Award + notification logic |
//! | [`consumer`] | Per-message evaluation loop |
//! | [`scheduler`] | Periodic rule-directory reload |
//! | [`config`] | Hierarchical configuration |
//! | [`error`] | Crate-level error aggregation |

pub mod assertion_store;
pub mod award;
pub mod bus;
pub mod config;
pub mod consumer;
pub mod error;
pub mod expr;
pub mod historical;
pub mod identity;
pub mod message;
pub mod predicate;
pub mod rule;
pub mod rule_repo;
pub mod scheduler;
pub mod substitution;
pub mod vcs;

pub use config::Config;
pub use error::{EngineError, EngineResult};
pub use message::Message;
pub use rule::Rule;
