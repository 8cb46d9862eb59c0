//! Issue tracker boundary.
//!
//! Writes are assumed to be delivered at least once; nothing here relies on
//! exactly-once behavior from the tracker.

pub mod linear;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use linear::LinearClient;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    /// Human key such as `ENG-123`.
    pub identifier: String,
    pub title: String,
    pub description: Option<String>,
    pub url: String,
}

impl Issue {
    pub fn description_text(&self) -> &str {
        self.description.as_deref().unwrap_or("")
    }
}

#[async_trait]
pub trait IssueTracker: Send + Sync {
    async fn get_issue(&self, issue_id: &str) -> anyhow::Result<Issue>;

    async fn update_description(&self, issue_id: &str, text: &str) -> anyhow::Result<()>;

    /// Post a comment, threaded under `parent_id` when given.
    async fn post_comment(
        &self,
        issue_id: &str,
        text: &str,
        parent_id: Option<&str>,
    ) -> anyhow::Result<()>;
}
