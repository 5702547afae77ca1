//! Award logic (spec.md §6): turn a rule's matched recipients into
//! persisted assertions and outbound notifications, exactly once per
//! `(badge_id, recipient)` pair even under concurrent evaluation.
//!
//! The per-pair lock follows the teacher's per-IP rate-limit map
//! (examples/inputlayer-inputlayer/src/protocol/rest/mod.rs): a
//! `DashMap` keyed on the thing being serialized, holding an async mutex per
//! key so unrelated pairs never contend.

use crate::assertion_store::{Assertion, AssertionStore, StoreError};
use dashmap::DashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Error, Debug)]
pub enum AwardError {
    #[error("assertion store error: {0}")]
    Store(#[from] StoreError),
}

/// Outbound notification of a freshly issued badge (e.g. to a Badgr-style
/// issuer, or back onto the activity bus). Implementations are expected to
/// retry internally on transient I/O error; `Notifier::notify` itself is not
/// retried for such errors by the caller (`award_one` already wraps it in
/// bounded backoff).
pub trait Notifier: Send + Sync {
    fn notify<'a>(
        &'a self,
        assertion: &'a Assertion,
    ) -> Pin<Box<dyn Future<Output = Result<(), AwardError>> + Send + 'a>>;
}

/// A no-op notifier for tests and for deployments that only care about the
/// assertion store's record.
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify<'a>(
        &'a self,
        _assertion: &'a Assertion,
    ) -> Pin<Box<dyn Future<Output = Result<(), AwardError>> + Send + 'a>> {
        Box::pin(async { Ok(()) })
    }
}

/// Serializes concurrent award attempts for the same `(badge_id, recipient)`
/// pair so the store's check-then-insert is never raced from within this
/// process (the store itself is still the authority across processes/crash
/// recovery — this lock is a latency optimization, not the safety net).
pub struct AwardLocks {
    locks: DashMap<(String, String), Arc<Mutex<()>>>,
}

impl Default for AwardLocks {
    fn default() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }
}

impl AwardLocks {
    fn lock_for(&self, badge_id: &str, recipient: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry((badge_id.to_string(), recipient.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Attempt to award one badge to one recipient. Returns `true` if this call
/// actually performed a new award, `false` if it was already on record.
///
/// Follows spec.md §4.8: ensure the person record exists before inserting
/// the assertion, so a crash between the two never leaves an assertion
/// pointing at a person who was never created.
pub async fn award_one(
    locks: &AwardLocks,
    store: &dyn AssertionStore,
    notifier: &dyn Notifier,
    badge_id: &str,
    recipient: &str,
    evidence_url: &str,
    issued_at_epoch_secs: i64,
) -> Result<bool, AwardError> {
    let lock = locks.lock_for(badge_id, recipient);
    let _guard = lock.lock().await;

    store.ensure_person_exists(recipient).await?;

    let assertion = Assertion {
        badge_id: badge_id.to_string(),
        recipient: recipient.to_string(),
        issued_at_epoch_secs,
        evidence_url: evidence_url.to_string(),
    };

    let inserted = store.try_insert(assertion.clone()).await?;
    if !inserted {
        return Ok(false);
    }

    notify_with_backoff(notifier, &assertion).await;
    Ok(true)
}

/// Bounded exponential backoff around the notification call: the award is
/// already durable by the time this runs, so a notification failure is
/// logged and swallowed rather than rolled back (spec.md §6, "awarding must
/// not be undone by a downstream notification failure").
async fn notify_with_backoff(notifier: &dyn Notifier, assertion: &Assertion) {
    const MAX_ATTEMPTS: u32 = 5;
    let mut delay = Duration::from_millis(200);

    for attempt in 1..=MAX_ATTEMPTS {
        match notifier.notify(assertion).await {
            Ok(()) => return,
            Err(err) if attempt == MAX_ATTEMPTS => {
                tracing::error!(
                    badge_id = %assertion.badge_id,
                    recipient = %assertion.recipient,
                    error = %err,
                    "giving up on badge notification after {attempt} attempts"
                );
                return;
            }
            Err(err) => {
                tracing::warn!(
                    badge_id = %assertion.badge_id,
                    recipient = %assertion.recipient,
                    error = %err,
                    attempt,
                    "badge notification failed, retrying"
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_secs(30));
            }
        }
    }
}
