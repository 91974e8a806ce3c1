//! Release channel check
//!
//! Lists the project's GitHub releases, caches the list for an hour and
//! compares the newest release on the selected channel with the installed
//! `VERSION`. Installing an update is not done here.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

pub const GITHUB_API: &str = "https://api.github.com";

/// Cached release lists are reused for this long
pub const CACHE_TTL: Duration = Duration::from_secs(3600);

const PER_PAGE: usize = 100;
const MAX_PAGES: usize = 10;

#[derive(Debug, Error)]
pub enum ReleaseError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Release API returned {0}")]
    Status(reqwest::StatusCode),

    #[error("Cache error: {0}")]
    Cache(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Unknown channel '{0}', expected stable or beta")]
    UnknownChannel(String),
}

/// Which releases count as candidates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Stable,
    Beta,
}

impl FromStr for Channel {
    type Err = ReleaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "stable" => Ok(Channel::Stable),
            "beta" => Ok(Channel::Beta),
            other => Err(ReleaseError::UnknownChannel(other.to_string())),
        }
    }
}

/// Release entry as served by the GitHub API
#[derive(Debug, Clone, Deserialize)]
struct GithubRelease {
    tag_name: String,
    name: Option<String>,
    #[serde(default)]
    prerelease: bool,
    #[serde(default)]
    draft: bool,
    published_at: Option<String>,
    tarball_url: Option<String>,
    body: Option<String>,
}

/// One published release
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    pub tag: String,
    pub name: String,
    pub prerelease: bool,
    pub published_at: Option<String>,
    pub tarball_url: Option<String>,
    pub body: String,
}

impl From<GithubRelease> for Release {
    fn from(r: GithubRelease) -> Self {
        Self {
            name: r.name.filter(|n| !n.is_empty()).unwrap_or_else(|| r.tag_name.clone()),
            tag: r.tag_name,
            prerelease: r.prerelease,
            published_at: r.published_at,
            tarball_url: r.tarball_url,
            body: r.body.unwrap_or_default(),
        }
    }
}

/// Result printed by `check-updates`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateCheck {
    pub current: String,
    pub latest: Option<String>,
    pub update_available: bool,
    pub releases: Vec<Release>,
}

/// Numeric components of a tag plus whether it carries a pre-release suffix
fn version_key(tag: &str) -> (Vec<u64>, bool) {
    let tag = tag.trim().trim_start_matches(['v', 'V']);
    let (core, pre) = match tag.split_once(['-', '+']) {
        Some((core, _)) => (core, true),
        None => (tag, false),
    };
    let parts = core
        .split('.')
        .map(|p| p.parse().unwrap_or(0))
        .collect();
    (parts, pre)
}

/// True when `candidate` is a newer version than `current`
pub fn is_newer(candidate: &str, current: &str) -> bool {
    let (mut a, a_pre) = version_key(candidate);
    let (mut b, b_pre) = version_key(current);
    let len = a.len().max(b.len());
    a.resize(len, 0);
    b.resize(len, 0);
    match a.cmp(&b) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        // 1.2.0 is newer than 1.2.0-beta.1
        std::cmp::Ordering::Equal => b_pre && !a_pre,
    }
}

/// Releases visible on `channel`, in API order (newest first)
pub fn filter_channel(releases: &[Release], channel: Channel) -> Vec<Release> {
    releases
        .iter()
        .filter(|r| channel == Channel::Beta || !r.prerelease)
        .cloned()
        .collect()
}

/// Build the check result from a release list
pub fn evaluate_updates(current: &str, releases: &[Release], channel: Channel) -> UpdateCheck {
    let releases = filter_channel(releases, channel);
    let latest = releases.first().map(|r| r.tag.clone());
    let update_available = latest
        .as_deref()
        .map(|tag| is_newer(tag, current))
        .unwrap_or(false);
    UpdateCheck {
        current: current.to_string(),
        latest,
        update_available,
        releases,
    }
}

/// Installed version from the `VERSION` file
pub fn read_current_version(path: &Path) -> String {
    fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string())
}

#[derive(Debug, Serialize, Deserialize)]
struct ReleaseCache {
    repo: String,
    fetched_at_unix: i64,
    releases: Vec<Release>,
}

/// On-disk cache of the release list
#[derive(Debug, Clone)]
pub struct CacheFile {
    pub path: PathBuf,
    pub ttl: Duration,
}

impl CacheFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ttl: CACHE_TTL,
        }
    }

    /// Fresh cached releases for `repo`, if any
    pub fn load(&self, repo: &str, now_unix: i64) -> Option<Vec<Release>> {
        let content = fs::read_to_string(&self.path).ok()?;
        let cache: ReleaseCache = serde_json::from_str(&content).ok()?;
        let age = now_unix.saturating_sub(cache.fetched_at_unix);
        if cache.repo != repo || age < 0 || age as u64 >= self.ttl.as_secs() {
            debug!(age, "Release cache stale");
            return None;
        }
        Some(cache.releases)
    }

    pub fn store(&self, repo: &str, now_unix: i64, releases: &[Release]) -> Result<(), ReleaseError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let cache = ReleaseCache {
            repo: repo.to_string(),
            fetched_at_unix: now_unix,
            releases: releases.to_vec(),
        };
        let mut tmp = self.path.as_os_str().to_owned();
        tmp.push(".tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&cache)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// GitHub releases API client
#[derive(Debug, Clone)]
pub struct ReleaseClient {
    client: reqwest::Client,
    api_base: String,
    per_page: usize,
}

impl ReleaseClient {
    pub fn new() -> Result<Self, ReleaseError> {
        Self::with_api_base(GITHUB_API)
    }

    pub fn with_api_base(api_base: &str) -> Result<Self, ReleaseError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("forpost-stream/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            per_page: PER_PAGE,
        })
    }

    pub fn with_per_page(mut self, per_page: usize) -> Self {
        self.per_page = per_page.max(1);
        self
    }

    /// All published (non-draft) releases, following pagination
    pub async fn fetch_releases(&self, repo: &str) -> Result<Vec<Release>, ReleaseError> {
        let url = format!("{}/repos/{}/releases", self.api_base, repo);
        let mut releases = Vec::new();

        for page in 1..=MAX_PAGES {
            let response = self
                .client
                .get(&url)
                .header("Accept", "application/vnd.github+json")
                .query(&[("per_page", self.per_page), ("page", page)])
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(ReleaseError::Status(response.status()));
            }

            let batch: Vec<GithubRelease> = response.json().await?;
            let count = batch.len();
            releases.extend(batch.into_iter().filter(|r| !r.draft).map(Release::from));
            debug!(page, count, "Fetched release page");

            if count < self.per_page {
                break;
            }
        }
        Ok(releases)
    }
}

/// Cached-or-fetched release list, then the update verdict
///
/// A fetch failure is returned as an error and leaves the cache untouched.
pub async fn check_updates(
    client: &ReleaseClient,
    cache: &CacheFile,
    repo: &str,
    current: &str,
    channel: Channel,
    force: bool,
) -> Result<UpdateCheck, ReleaseError> {
    let now = chrono::Utc::now().timestamp();

    let cached = if force { None } else { cache.load(repo, now) };
    let releases = match cached {
        Some(releases) => {
            debug!(count = releases.len(), "Using cached release list");
            releases
        }
        None => {
            let releases = client.fetch_releases(repo).await?;
            info!(count = releases.len(), repo, "Fetched release list");
            cache.store(repo, now, &releases)?;
            releases
        }
    };

    Ok(evaluate_updates(current, &releases, channel))
}
