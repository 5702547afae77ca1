//! Periodic rule-directory reload (spec.md §9): polls the rule directory's
//! VCS state and republishes a fresh `RuleSnapshot` whenever it has moved,
//! so operators can land new badges without restarting the consumer.

use crate::rule_repo::RuleRepository;
use crate::vcs::VersionControl;
use std::sync::Arc;
use std::time::Duration;

pub struct Scheduler {
    pub rules: Arc<RuleRepository>,
    pub vcs: Arc<dyn VersionControl>,
    pub interval: Duration,
}

impl Scheduler {
    /// Run the reload loop until `shutdown` is signalled. `reload_on_startup`
    /// controls whether the very first tick runs immediately.
    pub async fn run(
        &self,
        reload_on_startup: bool,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(self.interval);
        if !reload_on_startup {
            ticker.tick().await;
        }

        let mut last_seen: Option<String> = None;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("scheduler received shutdown signal");
                        return;
                    }
                }
                _ = ticker.tick() => {
                    self.maybe_reload(&mut last_seen).await;
                }
            }
        }
    }

    async fn maybe_reload(&self, last_seen: &mut Option<String>) {
        let head = match self.vcs.head_commit() {
            Ok(head) => head,
            Err(err) => {
                tracing::warn!(error = %err, "failed to read rule directory VCS state, reloading anyway");
                None
            }
        };

        if head.is_some() && head == *last_seen {
            tracing::debug!("rule directory unchanged since last reload, skipping");
            return;
        }

        match self.rules.reload().await {
            Ok(count) => {
                tracing::info!(rule_count = count, "reloaded rule directory");
                *last_seen = head;
            }
            Err(err) => {
                tracing::error!(error = %err, "rule directory reload failed, keeping prior snapshot");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assertion_store::InMemoryAssertionStore;
    use crate::config::BadgeIssuerConfig;
    use crate::vcs::NoVersionControl;

    fn test_issuer() -> BadgeIssuerConfig {
        BadgeIssuerConfig {
            issuer_origin: "https://badges.fedoraproject.org".into(),
            issuer_name: "Fedora Project".into(),
            issuer_url: "https://fedoraproject.org".into(),
            issuer_email: "badges@fedoraproject.org".into(),
        }
    }

    #[tokio::test]
    async fn unchanged_head_skips_reload() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("a.yml"),
            "name: A\ndescription: d\nimage_url: u\ncreator: t\ndiscussion: u\nissuer_id: i\ntrigger:\n  topic: a\ncriteria:\n  datanommer:\n    filter: {}\n    operation: count\n    condition: { greater than or equal to: 0 }\n",
        )
        .unwrap();
        let repo = Arc::new(RuleRepository::new(
            dir.path(),
            Arc::new(InMemoryAssertionStore::default()),
            test_issuer(),
        ));
        let scheduler = Scheduler {
            rules: repo.clone(),
            vcs: Arc::new(NoVersionControl),
            interval: Duration::from_secs(60),
        };

        let mut last_seen = None;
        scheduler.maybe_reload(&mut last_seen).await;
        assert_eq!(repo.snapshot().rules.len(), 1);
    }
}
