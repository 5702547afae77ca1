//! The per-message consumer loop (spec.md §6, §9): pull a message off the
//! bus, evaluate every active rule against it concurrently, and award
//! badges to whichever recipients come out the other side.
//!
//! Each rule runs in its own `tokio::spawn`'d task so a bug that panics one
//! rule's evaluation (a pathological `lambda`, a store adapter bug) cannot
//! take down evaluation of the others — the spec.md §7 "per-rule error
//! isolation" requirement, extended to cover panics as well as `Result`
//! errors.

use crate::assertion_store::AssertionStore;
use crate::award::{self, AwardLocks, Notifier};
use crate::bus::MessageBus;
use crate::historical::ArchivalStore;
use crate::identity::{DirectoryClient, IdentityPolicy};
use crate::message::Message;
use crate::rule_repo::RuleRepository;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Owned identity-filtering settings, cloned cheaply into each rule task.
pub struct IdentitySettings {
    pub primary_domain: String,
    pub banned_accounts: Arc<HashSet<String>>,
    pub internal_ip_prefixes: Arc<Vec<String>>,
    pub id_provider_hostname: String,
    pub distgit_hostname: String,
    pub verify_fas_existence: bool,
}

pub struct Consumer {
    pub bus: Arc<dyn MessageBus>,
    pub rules: Arc<RuleRepository>,
    pub archival: Arc<dyn ArchivalStore>,
    pub directory: Arc<dyn DirectoryClient>,
    pub assertion_store: Arc<dyn AssertionStore>,
    pub notifier: Arc<dyn Notifier>,
    pub award_locks: Arc<AwardLocks>,
    pub identity: Arc<IdentitySettings>,
    /// Base URL used to compose each award's evidence link (spec.md §4.8).
    pub datagrepper_url: Arc<String>,
    pub consume_delay: Duration,
    pub call_timeout: Duration,
}

impl Consumer {
    /// Run forever, or until the bus closes / `shutdown` fires.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("consumer received shutdown signal");
                        return;
                    }
                }
                message = self.bus.next_message() => {
                    match message {
                        Ok(message) => self.process_message(Arc::new(message)).await,
                        Err(err) => {
                            tracing::error!(error = %err, "message bus closed, stopping consumer");
                            return;
                        }
                    }
                }
            }

            if !self.consume_delay.is_zero() {
                tokio::time::sleep(self.consume_delay).await;
            }
        }
    }

    async fn process_message(&self, message: Arc<Message>) {
        let snapshot = self.rules.snapshot();
        let mut tasks = tokio::task::JoinSet::new();

        for rule in snapshot.rules.iter().cloned() {
            let message = message.clone();
            let archival = self.archival.clone();
            let directory = self.directory.clone();
            let assertion_store = self.assertion_store.clone();
            let notifier = self.notifier.clone();
            let award_locks = self.award_locks.clone();
            let identity = self.identity.clone();
            let datagrepper_url = self.datagrepper_url.clone();
            let call_timeout = self.call_timeout;

            tasks.spawn(async move {
                let policy = IdentityPolicy {
                    primary_domain: &identity.primary_domain,
                    banned_accounts: &identity.banned_accounts,
                    internal_ip_prefixes: &identity.internal_ip_prefixes,
                    id_provider_hostname: &identity.id_provider_hostname,
                    distgit_hostname: &identity.distgit_hostname,
                    verify_fas_existence: identity.verify_fas_existence,
                };
                let ctx = crate::rule::RuleContext {
                    archival: &*archival,
                    directory: &*directory,
                    assertion_store: &*assertion_store,
                    identity_policy: &policy,
                    call_timeout,
                };

                let recipients = rule.matches(&message, &ctx).await;
                let issued_at = chrono::Utc::now().timestamp();
                let evidence_url =
                    format!("{}/id?id={}&is_raw=true&size=extra-large", datagrepper_url, message.id);

                for username in recipients {
                    let person_address = format!("{username}@{}", identity.primary_domain);
                    match award::award_one(
                        &award_locks,
                        &*assertion_store,
                        &*notifier,
                        &rule.badge_id,
                        &person_address,
                        &evidence_url,
                        issued_at,
                    )
                    .await
                    {
                        Ok(true) => {
                            tracing::info!(badge_id = %rule.badge_id, recipient = %person_address, "badge awarded");
                        }
                        Ok(false) => {
                            tracing::debug!(badge_id = %rule.badge_id, recipient = %person_address, "badge already awarded, skipping");
                        }
                        Err(err) => {
                            tracing::error!(badge_id = %rule.badge_id, recipient = %person_address, error = %err, "award failed");
                        }
                    }
                }
            });
        }

        while let Some(result) = tasks.join_next().await {
            if let Err(join_err) = result {
                tracing::error!(error = %join_err, "rule evaluation task panicked, isolated from other rules");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assertion_store::InMemoryAssertionStore;
    use crate::award::NullNotifier;
    use crate::historical::InMemoryArchivalStore;
    use crate::identity::InMemoryDirectoryClient;
    use crate::rule_repo::RuleRepository;
    use std::collections::BTreeMap;

    fn write_rule(dir: &std::path::Path, filename: &str, contents: &str) {
        std::fs::write(dir.join(filename), contents).unwrap();
    }

    const RULE: &str = r#"
name: "Long Life To Pork"
description: "d"
image_url: "https://badges.fedoraproject.org/images/long-life-to-pork.png"
creator: "tester"
discussion: "https://pagure.io/fedora-badges/issue/1"
issuer_id: "fedora-badges"
trigger:
  topic: pkgdb.package.new
criteria:
  datanommer:
    filter:
      category: pkgdb
    operation: count
    condition: { greater than or equal to: 0 }
"#;

    #[tokio::test]
    async fn processes_one_message_and_awards_once() {
        let dir = tempfile::tempdir().unwrap();
        write_rule(dir.path(), "a.yml", RULE);
        let assertion_store = Arc::new(InMemoryAssertionStore::default());
        let repo = Arc::new(RuleRepository::new(
            dir.path(),
            assertion_store.clone(),
            crate::config::BadgeIssuerConfig {
                issuer_origin: "https://badges.fedoraproject.org".into(),
                issuer_name: "Fedora Project".into(),
                issuer_url: "https://fedoraproject.org".into(),
                issuer_email: "badges@fedoraproject.org".into(),
            },
        ));
        repo.reload().await.unwrap();

        let consumer = Consumer {
            bus: Arc::new(crate::bus::ChannelMessageBus::new(
                tokio::sync::mpsc::channel(1).1,
            )),
            rules: repo,
            archival: Arc::new(InMemoryArchivalStore::default()),
            directory: Arc::new(InMemoryDirectoryClient::default()),
            assertion_store,
            notifier: Arc::new(NullNotifier),
            award_locks: Arc::new(AwardLocks::default()),
            identity: Arc::new(IdentitySettings {
                primary_domain: "fedoraproject.org".into(),
                banned_accounts: Arc::new(HashSet::new()),
                internal_ip_prefixes: Arc::new(Vec::new()),
                id_provider_hostname: "id.fedoraproject.org".into(),
                distgit_hostname: "src.fedoraproject.org".into(),
                verify_fas_existence: false,
            }),
            datagrepper_url: Arc::new("https://apps.fedoraproject.org/datagrepper".into()),
            consume_delay: Duration::from_secs(0),
            call_timeout: Duration::from_secs(1),
        };

        let mut msg = Message {
            id: "1".into(),
            topic: "org.fedoraproject.prod.pkgdb.package.new".into(),
            body: BTreeMap::new(),
            usernames: HashSet::new(),
        };
        msg.usernames.insert("ralph".to_string());

        consumer.process_message(Arc::new(msg.clone())).await;
        assert!(consumer
            .assertion_store
            .already_awarded("long-life-to-pork", "ralph@fedoraproject.org")
            .await
            .unwrap());

        // Processing the same message again must not award a second time.
        consumer.process_message(Arc::new(msg)).await;
    }
}
