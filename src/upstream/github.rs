use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::{send_retrying, send_with_retry};
use crate::discovery::{RepoCatalog, RepoListing};

const GITHUB_API: &str = "https://api.github.com";
const MAX_PAGES: u32 = 5;

/// GitHub REST client. Lists an organization's repositories when one is
/// configured, otherwise everything the token can see.
pub struct GithubClient {
    http: reqwest::Client,
    token: String,
    org: Option<String>,
    api_base: String,
}

#[derive(Debug, Deserialize)]
struct GitHubRepo {
    full_name: String,
    html_url: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    default_branch: Option<String>,
    #[serde(default)]
    pushed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    archived: bool,
}

impl From<GitHubRepo> for RepoListing {
    fn from(repo: GitHubRepo) -> Self {
        Self {
            full_name: repo.full_name,
            description: repo.description.unwrap_or_default(),
            default_branch: repo.default_branch.unwrap_or_else(|| "main".into()),
            pushed_at: repo.pushed_at,
            url: repo.html_url,
        }
    }
}

/// Parse the `owner/repo` slug from a GitHub URL.
///
/// Accepts `https://github.com/owner/repo`, a `.git` suffix, and
/// token-embedded clone URLs.
pub fn parse_owner_repo_from_url(url: &str) -> Option<String> {
    let rest = url.strip_prefix("https://")?;
    let path = match rest.strip_prefix("x-access-token:") {
        Some(after) => &after[after.find('@')? + 1..],
        None => rest,
    };
    let repo_path = path.strip_prefix("github.com/")?;
    let repo_path = repo_path.trim_end_matches('/');
    let repo_path = repo_path.strip_suffix(".git").unwrap_or(repo_path);
    let parts: Vec<&str> = repo_path.split('/').collect();
    if parts.len() == 2 && !parts[0].is_empty() && !parts[1].is_empty() {
        Some(format!("{}/{}", parts[0], parts[1]))
    } else {
        None
    }
}

impl GithubClient {
    pub fn new(http: reqwest::Client, token: &str, org: Option<String>) -> Self {
        Self {
            http,
            token: token.to_string(),
            org,
            api_base: GITHUB_API.to_string(),
        }
    }

    /// Point the client at another API root, e.g. GitHub Enterprise.
    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    fn repos_url(&self) -> String {
        match &self.org {
            Some(org) => format!("{}/orgs/{}/repos", self.api_base, org),
            None => format!("{}/user/repos", self.api_base),
        }
    }
}

#[async_trait]
impl RepoCatalog for GithubClient {
    async fn list_repos(&self) -> Result<Vec<RepoListing>> {
        let url = self.repos_url();
        let mut out = Vec::new();
        for page in 1..=MAX_PAGES {
            let page_str = page.to_string();
            let repos: Vec<GitHubRepo> = send_with_retry("github repos", || {
                self.http
                    .get(&url)
                    .bearer_auth(&self.token)
                    .header("Accept", "application/vnd.github+json")
                    .query(&[("sort", "pushed"), ("per_page", "100"), ("page", page_str.as_str())])
            })
            .await?
            .json()
            .await
            .context("Failed to parse repos response from GitHub")?;
            let count = repos.len();
            out.extend(repos.into_iter().filter(|r| !r.archived).map(RepoListing::from));
            if count < 100 {
                break;
            }
        }
        Ok(out)
    }

    async fn readme(&self, full_name: &str) -> Result<Option<String>> {
        let url = format!("{}/repos/{}/readme", self.api_base, full_name);
        let resp = send_retrying("github readme", || {
            self.http
                .get(&url)
                .bearer_auth(&self.token)
                .header("Accept", "application/vnd.github.raw")
        })
        .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let text = resp
            .error_for_status()
            .context("GitHub readme API returned error status")?
            .text()
            .await
            .context("Failed to read README body")?;
        Ok(Some(text))
    }
}
