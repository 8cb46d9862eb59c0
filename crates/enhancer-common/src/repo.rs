use serde::{Deserialize, Serialize};

/// A concrete repository identity produced by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoMetadata {
    /// `owner/name`
    pub full_name: String,
    #[serde(default)]
    pub description: String,
    pub default_branch: String,
    /// RFC 3339 timestamp of the last push, empty when unknown.
    #[serde(default)]
    pub pushed_at: String,
    #[serde(default)]
    pub readme_summary: String,
    pub url: String,
}

impl RepoMetadata {
    pub fn clone_url(&self) -> String {
        format!("https://github.com/{}.git", self.full_name)
    }

    /// The repository name without its owner.
    pub fn short_name(&self) -> &str {
        self.full_name
            .rsplit_once('/')
            .map(|(_, name)| name)
            .unwrap_or(&self.full_name)
    }
}
