//! Configuration System
//!
//! Provides hierarchical configuration loading from:
//! - config.toml (default configuration)
//! - config.local.toml (git-ignored local overrides)
//! - Environment variables (BADGEKEEPER_* prefix)
//!
//! ## Example
//!
//! ```toml
//! # config.toml
//! [storage]
//! database_uri = "postgresql://localhost/tahrir"
//! datanommer_db_uri = "postgresql://localhost/datanommer"
//!
//! [badges]
//! badges_directory = "/srv/badges/rules"
//! ```
//!
//! Environment variable overrides:
//! ```bash
//! BADGEKEEPER_BADGES__CONSUME_DELAY=5
//! BADGEKEEPER_IDENTITY__ID_PROVIDER_HOSTNAME=id.fedoraproject.org
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

/// Main configuration struct, §6 "Configuration (process-wide)".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
    pub badges: BadgesConfig,
    pub identity: IdentityConfig,
    pub badge_issuer: BadgeIssuerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Connection strings for the two external databases the engine talks to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Assertion-store (tahrir) connection string.
    pub database_uri: String,
    /// Archival-store (datanommer) connection string.
    pub datanommer_db_uri: String,
}

/// Rule-directory and per-message behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BadgesConfig {
    /// Path to the rules tree (a git checkout).
    pub badges_directory: PathBuf,

    /// Base URL used to compose the evidence link on awards.
    pub datagrepper_url: String,

    /// Seconds to wait before evaluating a message, to let the archival
    /// store settle (spec.md §4.7 step 1).
    #[serde(default = "default_consume_delay")]
    pub consume_delay: u64,

    /// How often the periodic scheduler checks for rule-directory updates.
    #[serde(default = "default_reload_interval_secs")]
    pub reload_interval_secs: u64,

    /// Run the rule-repository refresh once eagerly at startup, in
    /// addition to the recurring schedule.
    #[serde(default = "default_true")]
    pub reload_on_startup: bool,
}

fn default_consume_delay() -> u64 {
    3
}
fn default_reload_interval_secs() -> u64 {
    60
}

/// Directory-service (FASJSON) base URL and identity-translation knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    pub fasjson_base_url: String,

    /// Hostname identifying an OpenID URI as belonging to our provider,
    /// e.g. `id.fedoraproject.org`.
    pub id_provider_hostname: String,

    /// Hostname identifying a dist-git URI as belonging to our instance,
    /// e.g. `src.fedoraproject.org`.
    pub distgit_hostname: String,

    /// Domain appended to a bare username to form the assertion-store
    /// person address, e.g. `fedoraproject.org`.
    #[serde(default = "default_primary_domain")]
    pub primary_domain: String,

    /// Accounts that must never receive a badge (service/bot accounts).
    #[serde(default = "default_banned_accounts")]
    pub banned_accounts: HashSet<String>,

    /// IP-literal prefixes that mark an identifier as a non-human agent.
    #[serde(default = "default_internal_ip_prefixes")]
    pub internal_ip_prefixes: Vec<String>,
}

fn default_primary_domain() -> String {
    "fedoraproject.org".to_string()
}

fn default_banned_accounts() -> HashSet<String> {
    ["bodhi", "oscar", "apache", "koji", "taskotron"]
        .iter()
        .map(|s| (*s).to_string())
        .collect()
}

fn default_internal_ip_prefixes() -> Vec<String> {
    vec!["192.168.".to_string(), "10.".to_string()]
}

/// Badge-issuer identity registered with the assertion store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BadgeIssuerConfig {
    pub issuer_origin: String,
    pub issuer_name: String,
    pub issuer_url: String,
    pub issuer_email: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_true() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from default locations.
    ///
    /// Merges in order:
    /// 1. config.toml (base configuration)
    /// 2. config.local.toml (local overrides, git-ignored)
    /// 3. Environment variables (`BADGEKEEPER_*` prefix)
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file("config.toml"))
            .merge(Toml::file("config.local.toml"))
            .merge(Env::prefixed("BADGEKEEPER_").split("__"))
            .extract()
    }

    /// Load configuration from a specific file path.
    pub fn from_file(path: &str) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("BADGEKEEPER_").split("__"))
            .extract()
    }
}
