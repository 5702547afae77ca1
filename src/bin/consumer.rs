//! Process entry point: wires the configured adapters together and runs the
//! consumer loop and the reload scheduler side by side until shutdown.

use badgekeeper::assertion_store::SledAssertionStore;
use badgekeeper::award::{AwardLocks, NullNotifier};
use badgekeeper::bus::ChannelMessageBus;
use badgekeeper::config::Config;
use badgekeeper::consumer::{Consumer, IdentitySettings};
use badgekeeper::historical::DatagrepperArchivalStore;
use badgekeeper::identity::FasjsonDirectoryClient;
use badgekeeper::rule_repo::RuleRepository;
use badgekeeper::scheduler::Scheduler;
use badgekeeper::vcs::GitVersionControl;
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "badgekeeper-consumer", version, about = "Badge-awarding rule engine consumer")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "config.toml")]
    config: String,
}

fn init_logging(cfg: &badgekeeper::config::LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_new(&cfg.level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if cfg.format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match Config::from_file(&args.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load configuration from {}: {err}", args.config);
            return ExitCode::FAILURE;
        }
    };

    init_logging(&config.logging);

    let sled_path = config
        .storage
        .database_uri
        .trim_start_matches("sled://")
        .to_string();
    let sled_db = match sled::open(&sled_path) {
        Ok(db) => db,
        Err(err) => {
            tracing::error!(error = %err, path = %sled_path, "failed to open assertion store");
            return ExitCode::FAILURE;
        }
    };
    let assertion_store = match SledAssertionStore::open(&sled_db) {
        Ok(store) => Arc::new(store),
        Err(err) => {
            tracing::error!(error = %err, "failed to open assertion tree");
            return ExitCode::FAILURE;
        }
    };

    let rule_repo = Arc::new(RuleRepository::new(
        config.badges.badges_directory.clone(),
        assertion_store.clone(),
        config.badge_issuer.clone(),
    ));
    if let Err(err) = rule_repo.reload().await {
        tracing::error!(error = %err, "initial rule load failed, starting with an empty rule set");
    }

    let archival = Arc::new(DatagrepperArchivalStore::new(config.badges.datagrepper_url.clone()));
    let directory = Arc::new(FasjsonDirectoryClient::new(config.identity.fasjson_base_url.clone()));
    let vcs = Arc::new(GitVersionControl::new(config.badges.badges_directory.clone()));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let scheduler = Scheduler {
        rules: rule_repo.clone(),
        vcs,
        interval: Duration::from_secs(config.badges.reload_interval_secs),
    };
    let scheduler_shutdown = shutdown_rx.clone();
    let reload_on_startup = config.badges.reload_on_startup;
    let scheduler_handle =
        tokio::spawn(async move { scheduler.run(reload_on_startup, scheduler_shutdown).await });

    // The bus transport itself is out of scope (spec.md §1); this channel
    // stands in for whatever decodes wire frames into `Message`s upstream.
    let (_bus_tx, bus_rx) = tokio::sync::mpsc::channel(256);
    let bus = Arc::new(ChannelMessageBus::new(bus_rx));

    let consumer = Consumer {
        bus,
        rules: rule_repo,
        archival,
        directory,
        assertion_store,
        notifier: Arc::new(NullNotifier),
        award_locks: Arc::new(AwardLocks::default()),
        identity: Arc::new(IdentitySettings {
            primary_domain: config.identity.primary_domain.clone(),
            banned_accounts: Arc::new(config.identity.banned_accounts.clone()),
            internal_ip_prefixes: Arc::new(config.identity.internal_ip_prefixes.clone()),
            id_provider_hostname: config.identity.id_provider_hostname.clone(),
            distgit_hostname: config.identity.distgit_hostname.clone(),
            verify_fas_existence: true,
        }),
        datagrepper_url: Arc::new(config.badges.datagrepper_url.clone()),
        consume_delay: Duration::from_secs(config.badges.consume_delay),
        call_timeout: Duration::from_secs(10),
    };

    let consumer_shutdown = shutdown_rx.clone();
    let consumer_handle = tokio::spawn(async move { consumer.run(consumer_shutdown).await });

    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("received ctrl-c, shutting down");
    }
    let _ = shutdown_tx.send(true);

    let _ = tokio::join!(scheduler_handle, consumer_handle);

    ExitCode::SUCCESS
}
