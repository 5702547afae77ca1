//! The assertion store (spec.md §6, §4.8): durable record of which
//! `(badge_id, recipient)` pairs have already been awarded. Awarding is a
//! check-then-insert against a unique index; the store is the source of
//! truth for at-most-once semantics, not the in-process lock (the lock only
//! protects the index's read-then-write race, it doesn't survive a crash).

use crate::config::BadgeIssuerConfig;
use crate::rule::BadgeMetadata;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("assertion store I/O error: {0}")]
    Sled(#[from] sled::Error),

    #[error("failed to (de)serialize assertion record: {0}")]
    Codec(#[from] Box<bincode::ErrorKind>),
}

/// One previously-recorded award. `recipient` is the person address
/// (`<user>@<primary-domain>`, spec.md §4.8 step 1), not the bare FAS
/// username `Rule::matches` returns.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct Assertion {
    pub badge_id: String,
    pub recipient: String,
    pub issued_at_epoch_secs: i64,
    pub evidence_url: String,
}

/// The durable record written by badge registration: a snapshot of a rule's
/// static metadata plus the issuer it was registered under, keyed by
/// `badge_id` (spec.md §4.6(d), §2 "registers each badge with the assertion
/// store"). Grounded on `examples/original_source/fedbadges/rules.py`'s
/// `self.tahrir.add_badge(name, image_url, description, creator,
/// issuer_id=...)` call at rule construction.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct BadgeRegistration {
    pub name: String,
    pub description: String,
    pub image_url: String,
    pub creator: String,
    pub discussion_url: String,
    pub issuer_id: String,
    pub tags: Vec<String>,
    pub issuer_origin: String,
    pub issuer_name: String,
    pub issuer_url: String,
    pub issuer_email: String,
}

impl BadgeRegistration {
    fn from_parts(badge: &BadgeMetadata, issuer: &BadgeIssuerConfig) -> Self {
        Self {
            name: badge.name.clone(),
            description: badge.description_template.clone(),
            image_url: badge.image_url.clone(),
            creator: badge.creator.clone(),
            discussion_url: badge.discussion_url.clone(),
            issuer_id: badge.issuer_id.clone(),
            tags: badge.tags.clone(),
            issuer_origin: issuer.issuer_origin.clone(),
            issuer_name: issuer.issuer_name.clone(),
            issuer_url: issuer.issuer_url.clone(),
            issuer_email: issuer.issuer_email.clone(),
        }
    }
}

fn key_for(badge_id: &str, recipient: &str) -> Vec<u8> {
    format!("{badge_id}\u{0}{recipient}").into_bytes()
}

/// The assertion-store port.
pub trait AssertionStore: Send + Sync {
    /// Ensure a person record exists for `recipient` (idempotent insert,
    /// spec.md §4.8 step 1). Awarding does not depend on the return value,
    /// only on the record existing afterwards.
    fn ensure_person_exists<'a>(
        &'a self,
        recipient: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>>;

    /// Returns `true` if inserting succeeded (this is a new award) and
    /// `false` if the `(badge_id, recipient)` pair already existed — the
    /// at-most-once guarantee spec.md §6 requires.
    fn try_insert<'a>(
        &'a self,
        assertion: Assertion,
    ) -> Pin<Box<dyn Future<Output = Result<bool, StoreError>> + Send + 'a>>;

    fn already_awarded<'a>(
        &'a self,
        badge_id: &'a str,
        recipient: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, StoreError>> + Send + 'a>>;

    /// Has `recipient` opted out of receiving badges (spec.md §4.4 item 5)?
    fn is_opted_out<'a>(
        &'a self,
        recipient: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, StoreError>> + Send + 'a>>;

    /// Register (or re-register) a badge's static metadata under `badge_id`
    /// (spec.md §2, §4.6(d)). An idempotent upsert, not an insert-once: a
    /// rule reload re-registers every rule on disk, so re-registering the
    /// same `badge_id` with updated metadata must replace the prior record
    /// rather than error.
    fn register_badge<'a>(
        &'a self,
        badge_id: &'a str,
        badge: &'a BadgeMetadata,
        issuer: &'a BadgeIssuerConfig,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>>;
}

/// A `sled`-backed store. `sled`'s `compare_and_swap` gives the
/// check-then-insert its atomicity without an external lock — the index is
/// the tree itself, keyed on `badge_id\0recipient`.
pub struct SledAssertionStore {
    tree: sled::Tree,
    persons: sled::Tree,
    opt_outs: sled::Tree,
    badges: sled::Tree,
}

impl SledAssertionStore {
    pub fn open(db: &sled::Db) -> Result<Self, StoreError> {
        let tree = db.open_tree("assertions")?;
        let persons = db.open_tree("persons")?;
        let opt_outs = db.open_tree("opt_outs")?;
        let badges = db.open_tree("badges")?;
        Ok(Self {
            tree,
            persons,
            opt_outs,
            badges,
        })
    }
}

impl AssertionStore for SledAssertionStore {
    fn ensure_person_exists<'a>(
        &'a self,
        recipient: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>> {
        Box::pin(async move {
            self.persons
                .compare_and_swap(recipient, None as Option<&[u8]>, Some(b"1".as_slice()))?;
            self.persons.flush()?;
            Ok(())
        })
    }

    fn try_insert<'a>(
        &'a self,
        assertion: Assertion,
    ) -> Pin<Box<dyn Future<Output = Result<bool, StoreError>> + Send + 'a>> {
        Box::pin(async move {
            let key = key_for(&assertion.badge_id, &assertion.recipient);
            let value = bincode::serialize(&assertion)?;
            let result = self.tree.compare_and_swap(
                key,
                None as Option<&[u8]>,
                Some(value),
            )?;
            self.tree.flush()?;
            Ok(result.is_ok())
        })
    }

    fn already_awarded<'a>(
        &'a self,
        badge_id: &'a str,
        recipient: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, StoreError>> + Send + 'a>> {
        Box::pin(async move {
            let key = key_for(badge_id, recipient);
            Ok(self.tree.contains_key(key)?)
        })
    }

    fn is_opted_out<'a>(
        &'a self,
        recipient: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, StoreError>> + Send + 'a>> {
        Box::pin(async move { Ok(self.opt_outs.contains_key(recipient)?) })
    }

    fn register_badge<'a>(
        &'a self,
        badge_id: &'a str,
        badge: &'a BadgeMetadata,
        issuer: &'a BadgeIssuerConfig,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>> {
        Box::pin(async move {
            let record = BadgeRegistration::from_parts(badge, issuer);
            let value = bincode::serialize(&record)?;
            self.badges.insert(badge_id, value)?;
            self.badges.flush()?;
            Ok(())
        })
    }
}

/// An in-memory double for tests, backed by `dashmap` sets — mirrors the
/// real store's per-key atomicity without touching disk.
#[derive(Debug, Default)]
pub struct InMemoryAssertionStore {
    seen: dashmap::DashSet<(String, String)>,
    persons: dashmap::DashSet<String>,
    opted_out: dashmap::DashSet<String>,
    badges: dashmap::DashMap<String, BadgeRegistration>,
}

impl InMemoryAssertionStore {
    /// Test helper: mark `recipient` as having opted out.
    pub fn mark_opted_out(&self, recipient: impl Into<String>) {
        self.opted_out.insert(recipient.into());
    }

    /// Test helper: inspect a registered badge's stored record.
    pub fn registered_badge(&self, badge_id: &str) -> Option<BadgeRegistration> {
        self.badges.get(badge_id).map(|entry| entry.clone())
    }
}

impl AssertionStore for InMemoryAssertionStore {
    fn ensure_person_exists<'a>(
        &'a self,
        recipient: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>> {
        self.persons.insert(recipient.to_string());
        Box::pin(async move { Ok(()) })
    }

    fn try_insert<'a>(
        &'a self,
        assertion: Assertion,
    ) -> Pin<Box<dyn Future<Output = Result<bool, StoreError>> + Send + 'a>> {
        let key = (assertion.badge_id, assertion.recipient);
        let inserted = self.seen.insert(key);
        Box::pin(async move { Ok(inserted) })
    }

    fn already_awarded<'a>(
        &'a self,
        badge_id: &'a str,
        recipient: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, StoreError>> + Send + 'a>> {
        let exists = self
            .seen
            .contains(&(badge_id.to_string(), recipient.to_string()));
        Box::pin(async move { Ok(exists) })
    }

    fn is_opted_out<'a>(
        &'a self,
        recipient: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, StoreError>> + Send + 'a>> {
        let opted_out = self.opted_out.contains(recipient);
        Box::pin(async move { Ok(opted_out) })
    }

    fn register_badge<'a>(
        &'a self,
        badge_id: &'a str,
        badge: &'a BadgeMetadata,
        issuer: &'a BadgeIssuerConfig,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>> {
        self.badges
            .insert(badge_id.to_string(), BadgeRegistration::from_parts(badge, issuer));
        Box::pin(async move { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assertion(badge: &str, recipient: &str) -> Assertion {
        Assertion {
            badge_id: badge.into(),
            recipient: recipient.into(),
            issued_at_epoch_secs: 0,
            evidence_url: String::new(),
        }
    }

    fn badge_metadata(name: &str) -> BadgeMetadata {
        BadgeMetadata {
            name: name.into(),
            description_template: "desc".into(),
            image_url: "https://example.test/img.png".into(),
            creator: "tester".into(),
            discussion_url: "https://example.test/issue/1".into(),
            issuer_id: "fedora-badges".into(),
            tags: vec!["tag-a".into()],
        }
    }

    fn issuer() -> BadgeIssuerConfig {
        BadgeIssuerConfig {
            issuer_origin: "https://badges.fedoraproject.org".into(),
            issuer_name: "Fedora Project".into(),
            issuer_url: "https://fedoraproject.org".into(),
            issuer_email: "badges@fedoraproject.org".into(),
        }
    }

    #[tokio::test]
    async fn second_insert_of_same_pair_is_rejected() {
        let store = InMemoryAssertionStore::default();
        assert!(store.try_insert(assertion("b1", "ralph")).await.unwrap());
        assert!(!store.try_insert(assertion("b1", "ralph")).await.unwrap());
    }

    #[tokio::test]
    async fn distinct_recipients_both_succeed() {
        let store = InMemoryAssertionStore::default();
        assert!(store.try_insert(assertion("b1", "ralph")).await.unwrap());
        assert!(store.try_insert(assertion("b1", "toshio")).await.unwrap());
    }

    #[tokio::test]
    async fn opted_out_recipient_is_reported() {
        let store = InMemoryAssertionStore::default();
        store.mark_opted_out("ralph@fedoraproject.org");
        assert!(store
            .is_opted_out("ralph@fedoraproject.org")
            .await
            .unwrap());
        assert!(!store
            .is_opted_out("toshio@fedoraproject.org")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn sled_store_enforces_uniqueness() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let store = SledAssertionStore::open(&db).unwrap();
        assert!(store.try_insert(assertion("b1", "ralph")).await.unwrap());
        assert!(!store.try_insert(assertion("b1", "ralph")).await.unwrap());
        assert!(store.already_awarded("b1", "ralph").await.unwrap());
        assert!(!store.already_awarded("b1", "toshio").await.unwrap());
    }

    #[tokio::test]
    async fn sled_store_tracks_opt_outs_independently_of_assertions() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let store = SledAssertionStore::open(&db).unwrap();
        assert!(!store.is_opted_out("ralph@fedoraproject.org").await.unwrap());
        store.ensure_person_exists("ralph@fedoraproject.org").await.unwrap();
        assert!(!store.is_opted_out("ralph@fedoraproject.org").await.unwrap());
    }

    #[tokio::test]
    async fn in_memory_store_registers_badge_metadata() {
        let store = InMemoryAssertionStore::default();
        let badge = badge_metadata("Long Life To Pork");
        store
            .register_badge("long-life-to-pork", &badge, &issuer())
            .await
            .unwrap();

        let registered = store.registered_badge("long-life-to-pork").unwrap();
        assert_eq!(registered.name, "Long Life To Pork");
        assert_eq!(registered.issuer_id, "fedora-badges");
        assert_eq!(registered.issuer_name, "Fedora Project");
        assert_eq!(registered.tags, vec!["tag-a".to_string()]);
    }

    #[tokio::test]
    async fn re_registering_a_badge_id_upserts_rather_than_errors() {
        let store = InMemoryAssertionStore::default();
        let mut badge = badge_metadata("Long Life To Pork");
        store
            .register_badge("long-life-to-pork", &badge, &issuer())
            .await
            .unwrap();

        badge.description_template = "an updated description".into();
        store
            .register_badge("long-life-to-pork", &badge, &issuer())
            .await
            .unwrap();

        let registered = store.registered_badge("long-life-to-pork").unwrap();
        assert_eq!(registered.description, "an updated description");
    }

    #[tokio::test]
    async fn sled_store_registers_and_reregisters_badges() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let store = SledAssertionStore::open(&db).unwrap();
        let badge = badge_metadata("Long Life To Pork");
        store
            .register_badge("long-life-to-pork", &badge, &issuer())
            .await
            .unwrap();
        store
            .register_badge("long-life-to-pork", &badge, &issuer())
            .await
            .unwrap();
    }
}
