//! Identity resolution (spec.md §4.4): raw recipient identifiers pulled off
//! a message carry several shapes (nickname, email, OpenID URL, GitHub
//! profile URL, dist-git commit-author URL, Kerberos principal); before a
//! badge can be awarded every one must be translated to a canonical FAS
//! account name, filtered for banned/internal/already-awarded/opted-out
//! accounts, and finally confirmed to exist.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::OnceLock;
use thiserror::Error;

use crate::assertion_store::AssertionStore;

#[derive(Error, Debug)]
pub enum ResolverError {
    #[error("directory service request failed: {0}")]
    Directory(#[from] reqwest::Error),

    #[error("directory service returned malformed data: {0}")]
    Malformed(String),
}

/// The namespaces the directory service can search by. Only namespaces that
/// genuinely require a round-trip are represented here — `openid2fas`,
/// `distgit2fas`, and `krb2fas` are pure string/regex transforms and never
/// touch the directory (spec.md §4.4 table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Nick,
    Email,
    GitHub,
}

/// The directory-service port. The real adapter speaks FASJSON over HTTP;
/// `InMemoryDirectoryClient` backs tests.
pub trait DirectoryClient: Send + Sync {
    /// Search for accounts matching `query` in `namespace`. `nick2fas` and
    /// `email2fas` treat more than one hit as ambiguous and drop the
    /// candidate; `github2fas` is explicit about this in spec.md §4.4.
    fn search<'a>(
        &'a self,
        namespace: Namespace,
        query: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>, ResolverError>> + Send + 'a>>;

    /// Confirm a FAS account name actually exists (spec.md §4.4, item 6: run
    /// last, only against otherwise-winning candidates).
    fn account_exists<'a>(
        &'a self,
        username: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, ResolverError>> + Send + 'a>>;
}

/// Which `recipient_*2fas` translators a rule has requested, applied in the
/// fixed order spec.md §4.4's table lists them (and §9 "Identity translation
/// flags: applied in a fixed order by a pipeline of functions").
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityFlags {
    pub nick2fas: bool,
    pub email2fas: bool,
    pub openid2fas: bool,
    pub github2fas: bool,
    pub distgit2fas: bool,
    pub krb2fas: bool,
}

/// Settings that shape translation and filtering, independent of any
/// particular message.
pub struct IdentityPolicy<'a> {
    pub primary_domain: &'a str,
    pub banned_accounts: &'a HashSet<String>,
    pub internal_ip_prefixes: &'a [String],
    pub id_provider_hostname: &'a str,
    pub distgit_hostname: &'a str,
    pub verify_fas_existence: bool,
}

fn openid_regex(hostname: &str) -> regex::Regex {
    regex::Regex::new(&format!(r"^https?://([^./]+)\.{}/?$", regex::escape(hostname)))
        .expect("hostname is regex-escaped")
}

fn distgit_regex(hostname: &str) -> regex::Regex {
    regex::Regex::new(&format!(r"^https?://{}/user/([^/]+)/?$", regex::escape(hostname)))
        .expect("hostname is regex-escaped")
}

fn github_login_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"^https?://api\.github\.com/users/([^/]+)/?$").unwrap())
}

/// `openid2fas`: regex-capture the username from `https?://<user>.<id-
/// provider-host>`; on non-match, return the input unchanged (spec.md §4.4).
fn openid2fas(id_provider_hostname: &str, raw: &str) -> String {
    match openid_regex(id_provider_hostname).captures(raw) {
        Some(caps) => caps[1].to_string(),
        None => raw.to_string(),
    }
}

/// `distgit2fas`: regex-capture the username from `https?://<distgit-
/// host>/user/<user>`; on non-match, return the input unchanged.
fn distgit2fas(distgit_hostname: &str, raw: &str) -> String {
    match distgit_regex(distgit_hostname).captures(raw) {
        Some(caps) => caps[1].to_string(),
        None => raw.to_string(),
    }
}

/// `krb2fas`: take the substring before the first `/` of `user/host@REALM`.
fn krb2fas(raw: &str) -> String {
    raw.split('/').next().unwrap_or(raw).to_string()
}

/// `nick2fas`: directory lookup by nickname. More than one hit is
/// ambiguous and the candidate is dropped, mirroring `github2fas`'s
/// explicit 0-or->1 rule (spec.md §4.4).
async fn nick2fas(directory: &dyn DirectoryClient, raw: &str) -> Option<String> {
    single_match(directory.search(Namespace::Nick, raw).await)
}

/// `email2fas`: strip an `@<primary-domain>` suffix and treat the remainder
/// as a nickname directly; otherwise search the directory by exact email.
async fn email2fas(
    directory: &dyn DirectoryClient,
    primary_domain: &str,
    raw: &str,
) -> Option<String> {
    if let Some(nick) = raw.strip_suffix(&format!("@{primary_domain}")) {
        return Some(nick.to_string());
    }
    single_match(directory.search(Namespace::Email, raw).await)
}

/// `github2fas`: directory search by exact `github_username`; 0 or >1
/// results drop the candidate.
async fn github2fas(directory: &dyn DirectoryClient, raw: &str) -> Option<String> {
    let login = github_login_regex().captures(raw).map(|c| c[1].to_string())?;
    single_match(directory.search(Namespace::GitHub, &login).await)
}

fn single_match(result: Result<Vec<String>, ResolverError>) -> Option<String> {
    match result {
        Ok(mut matches) if matches.len() == 1 => Some(matches.remove(0)),
        Ok(_) => None,
        Err(err) => {
            tracing::warn!(error = %err, "directory search failed, dropping candidate");
            None
        }
    }
}

/// Apply every requested translator, in the fixed table order, to a raw
/// identifier list. A `None` slot means the identifier was dropped by some
/// translator along the way (e.g. an ambiguous `github2fas` search); it
/// stays `None` through the rest of the pipeline.
pub async fn translate_recipients(
    raw: Vec<String>,
    flags: &IdentityFlags,
    directory: &dyn DirectoryClient,
    policy: &IdentityPolicy<'_>,
) -> Vec<Option<String>> {
    let mut current: Vec<Option<String>> = raw.into_iter().map(Some).collect();

    if flags.nick2fas {
        let mut next = Vec::with_capacity(current.len());
        for slot in current {
            next.push(match slot {
                Some(id) => nick2fas(directory, &id).await,
                None => None,
            });
        }
        current = next;
    }

    if flags.email2fas {
        let mut next = Vec::with_capacity(current.len());
        for slot in current {
            next.push(match slot {
                Some(id) => email2fas(directory, policy.primary_domain, &id).await,
                None => None,
            });
        }
        current = next;
    }

    if flags.openid2fas {
        current = current
            .into_iter()
            .map(|slot| slot.map(|id| openid2fas(policy.id_provider_hostname, &id)))
            .collect();
    }

    if flags.github2fas {
        let mut next = Vec::with_capacity(current.len());
        for slot in current {
            next.push(match slot {
                Some(id) => github2fas(directory, &id).await,
                None => None,
            });
        }
        current = next;
    }

    if flags.distgit2fas {
        current = current
            .into_iter()
            .map(|slot| slot.map(|id| distgit2fas(policy.distgit_hostname, &id)))
            .collect();
    }

    if flags.krb2fas {
        current = current
            .into_iter()
            .map(|slot| slot.map(|id| krb2fas(&id)))
            .collect();
    }

    current
}

fn is_internal(username: &str, prefixes: &[String]) -> bool {
    prefixes.iter().any(|p| username.starts_with(p.as_str()))
}

/// Post-translation filter steps 1–3 (spec.md §4.4): drop missing entries,
/// banned accounts, and internal-IP-literal identifiers.
pub fn filter_banned_and_internal(
    candidates: Vec<Option<String>>,
    policy: &IdentityPolicy<'_>,
) -> HashSet<String> {
    candidates
        .into_iter()
        .flatten()
        .filter(|u| !policy.banned_accounts.contains(u) && !is_internal(u, policy.internal_ip_prefixes))
        .collect()
}

fn person_address(username: &str, primary_domain: &str) -> String {
    format!("{username}@{primary_domain}")
}

/// Post-translation filter step 4: drop identifiers already recorded as
/// having received this badge. A store error fails open (the candidate
/// survives) since the store's unique index is the real backstop at insert
/// time (spec.md §9 "the in-process lock is an optimisation, not a
/// correctness mechanism" — the same reasoning applies to this read).
pub async fn filter_already_awarded(
    store: &dyn AssertionStore,
    badge_id: &str,
    primary_domain: &str,
    candidates: HashSet<String>,
) -> HashSet<String> {
    let mut surviving = HashSet::new();
    for username in candidates {
        let address = person_address(&username, primary_domain);
        match store.already_awarded(badge_id, &address).await {
            Ok(true) => {
                tracing::debug!(%username, badge_id, "already awarded, dropping");
            }
            Ok(false) => {
                surviving.insert(username);
            }
            Err(err) => {
                tracing::warn!(error = %err, %username, "dedup check failed, keeping candidate");
                surviving.insert(username);
            }
        }
    }
    surviving
}

/// Post-translation filter step 5: drop identifiers whose owner opted out.
pub async fn filter_opted_out(
    store: &dyn AssertionStore,
    primary_domain: &str,
    candidates: HashSet<String>,
) -> HashSet<String> {
    let mut surviving = HashSet::new();
    for username in candidates {
        let address = person_address(&username, primary_domain);
        match store.is_opted_out(&address).await {
            Ok(true) => {
                tracing::debug!(%username, "recipient opted out, dropping");
            }
            Ok(false) => {
                surviving.insert(username);
            }
            Err(err) => {
                tracing::warn!(error = %err, %username, "opt-out check failed, keeping candidate");
                surviving.insert(username);
            }
        }
    }
    surviving
}

/// Post-translation filter step 6, run last per spec.md §4.4: confirm the
/// directory service reports the account as real.
pub async fn filter_existence(
    directory: &dyn DirectoryClient,
    policy: &IdentityPolicy<'_>,
    candidates: HashSet<String>,
) -> HashSet<String> {
    if !policy.verify_fas_existence {
        return candidates;
    }

    let mut confirmed = HashSet::new();
    for username in candidates {
        match directory.account_exists(&username).await {
            Ok(true) => {
                confirmed.insert(username);
            }
            Ok(false) => {
                tracing::debug!(%username, "resolved username does not exist in FAS, dropping");
            }
            Err(err) => {
                tracing::warn!(error = %err, %username, "FAS existence check failed, dropping candidate");
            }
        }
    }
    confirmed
}

/// The FASJSON-backed adapter: a thin `reqwest` client over the directory
/// service's namespace search and account-existence endpoints.
pub struct FasjsonDirectoryClient {
    http: reqwest::Client,
    base_url: String,
}

impl FasjsonDirectoryClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    fn namespace_path(namespace: Namespace) -> &'static str {
        match namespace {
            Namespace::Nick => "nickname",
            Namespace::Email => "email",
            Namespace::GitHub => "github",
        }
    }
}

#[derive(serde::Deserialize)]
struct FasjsonLookupResponse {
    result: Vec<FasjsonUser>,
}

#[derive(serde::Deserialize)]
struct FasjsonUser {
    username: String,
}

impl DirectoryClient for FasjsonDirectoryClient {
    fn search<'a>(
        &'a self,
        namespace: Namespace,
        query: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>, ResolverError>> + Send + 'a>> {
        Box::pin(async move {
            let url = format!(
                "{}/v2/search/{}/",
                self.base_url.trim_end_matches('/'),
                Self::namespace_path(namespace)
            );
            let resp = self
                .http
                .get(&url)
                .query(&[("q", query)])
                .send()
                .await?
                .error_for_status()?
                .json::<FasjsonLookupResponse>()
                .await?;
            Ok(resp.result.into_iter().map(|u| u.username).collect())
        })
    }

    fn account_exists<'a>(
        &'a self,
        username: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, ResolverError>> + Send + 'a>> {
        Box::pin(async move {
            let url = format!(
                "{}/v2/users/{}/",
                self.base_url.trim_end_matches('/'),
                username
            );
            let resp = self.http.get(&url).send().await?;
            Ok(resp.status().is_success())
        })
    }
}

/// A fixed-table directory client for tests and local development.
#[derive(Debug, Default)]
pub struct InMemoryDirectoryClient {
    pub table: std::collections::HashMap<(Namespace, String), Vec<String>>,
    pub known_accounts: HashSet<String>,
}

impl DirectoryClient for InMemoryDirectoryClient {
    fn search<'a>(
        &'a self,
        namespace: Namespace,
        query: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>, ResolverError>> + Send + 'a>> {
        let result = self
            .table
            .get(&(namespace, query.to_string()))
            .cloned()
            .unwrap_or_default();
        Box::pin(async move { Ok(result) })
    }

    fn account_exists<'a>(
        &'a self,
        username: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, ResolverError>> + Send + 'a>> {
        let exists = self.known_accounts.contains(username);
        Box::pin(async move { Ok(exists) })
    }
}
