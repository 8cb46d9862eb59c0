//! Discovery over a code host's repository catalog.
//!
//! Repositories are scored against the query by token overlap with their
//! name and description. An exact `owner/name` or bare name match always
//! wins. Ties go to the most recently pushed repository.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use enhancer_common::RepoMetadata;

use super::RepoDiscovery;
use crate::errors::DiscoveryError;

const SUMMARY_SOFT_LIMIT: usize = 300;
const SUMMARY_HARD_LIMIT: usize = 400;
const SUMMARY_MIN_LINE: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoListing {
    pub full_name: String,
    pub description: String,
    pub default_branch: String,
    pub pushed_at: Option<DateTime<Utc>>,
    pub url: String,
}

impl RepoListing {
    pub fn into_metadata(self, readme_summary: String) -> RepoMetadata {
        RepoMetadata {
            pushed_at: self
                .pushed_at
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
                .unwrap_or_default(),
            full_name: self.full_name,
            description: self.description,
            default_branch: self.default_branch,
            readme_summary,
            url: self.url,
        }
    }

    fn short_name(&self) -> &str {
        self.full_name
            .rsplit_once('/')
            .map(|(_, n)| n)
            .unwrap_or(&self.full_name)
    }
}

/// The code host's repository listing.
#[async_trait]
pub trait RepoCatalog: Send + Sync {
    async fn list_repos(&self) -> anyhow::Result<Vec<RepoListing>>;

    /// Raw README text, `None` when the repository has none.
    async fn readme(&self, full_name: &str) -> anyhow::Result<Option<String>>;
}

pub struct CatalogDiscovery<C> {
    catalog: C,
}

impl<C: RepoCatalog> CatalogDiscovery<C> {
    pub fn new(catalog: C) -> Self {
        Self { catalog }
    }
}

fn tokens(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1)
        .map(|t| t.to_lowercase())
        .collect()
}

/// Score a listing against a query. Zero means no relation.
fn score(listing: &RepoListing, query: &str) -> u32 {
    let q = query.trim().to_lowercase();
    if q == listing.full_name.to_lowercase() || q == listing.short_name().to_lowercase() {
        return u32::MAX;
    }
    let wanted = tokens(&q);
    let name = tokens(&listing.full_name);
    let description = tokens(&listing.description);
    wanted
        .iter()
        .map(|t| {
            if name.contains(t) {
                3
            } else if description.contains(t) {
                1
            } else {
                0
            }
        })
        .sum()
}

/// Pick the best listing for `query`, if any relates to it.
pub fn best_match<'a>(listings: &'a [RepoListing], query: &str) -> Option<&'a RepoListing> {
    listings
        .iter()
        .map(|l| (score(l, query), l))
        .filter(|(s, _)| *s > 0)
        .max_by(|(sa, a), (sb, b)| {
            sa.cmp(sb)
                .then(a.pushed_at.cmp(&b.pushed_at))
                .then(b.full_name.cmp(&a.full_name))
        })
        .map(|(_, l)| l)
}

/// First meaningful paragraph of a README: badges, images, HTML and headings
/// are skipped, as are lines too short to be prose.
pub fn summarize_readme(readme: &str) -> String {
    let mut lines: Vec<&str> = Vec::new();
    for line in readme.lines() {
        let line = line.trim();
        if line.is_empty() {
            if !lines.is_empty() {
                break;
            }
            continue;
        }
        if ["![", "<", "[!", "#"].iter().any(|p| line.starts_with(p)) {
            continue;
        }
        if line.chars().count() < SUMMARY_MIN_LINE {
            continue;
        }
        lines.push(line);
        if lines.iter().map(|l| l.len() + 1).sum::<usize>() > SUMMARY_SOFT_LIMIT {
            break;
        }
    }
    let joined = lines.join(" ");
    joined
        .chars()
        .take(SUMMARY_HARD_LIMIT)
        .collect::<String>()
        .trim()
        .to_string()
}

#[async_trait]
impl<C: RepoCatalog> RepoDiscovery for CatalogDiscovery<C> {
    async fn discover(&self, query: &str) -> Result<RepoMetadata, DiscoveryError> {
        let listings = self
            .catalog
            .list_repos()
            .await
            .map_err(|e| DiscoveryError::Upstream(format!("{:#}", e)))?;
        let Some(best) = best_match(&listings, query).cloned() else {
            return Err(DiscoveryError::NoMatch(query.to_string()));
        };

        let summary = match self.catalog.readme(&best.full_name).await {
            Ok(Some(text)) => summarize_readme(&text),
            Ok(None) => String::new(),
            Err(e) => {
                tracing::debug!(repo = %best.full_name, error = %e, "README unavailable");
                String::new()
            }
        };
        tracing::info!(query, repo = %best.full_name, "Discovered repository");
        Ok(best.into_metadata(summary))
    }
}
