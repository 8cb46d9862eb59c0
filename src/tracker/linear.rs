use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use super::{Issue, IssueTracker};
use crate::upstream::send_with_retry;

const LINEAR_API_URL: &str = "https://api.linear.app/graphql";

const GET_ISSUE: &str = r#"
query GetIssue($id: String!) {
    issue(id: $id) { id identifier title description url }
}"#;

const UPDATE_DESCRIPTION: &str = r#"
mutation UpdateIssue($id: String!, $description: String!) {
    issueUpdate(id: $id, input: { description: $description }) { success }
}"#;

const CREATE_COMMENT: &str = r#"
mutation AddComment($input: CommentCreateInput!) {
    commentCreate(input: $input) { success }
}"#;

/// Linear GraphQL client.
pub struct LinearClient {
    http: reqwest::Client,
    api_key: String,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct GraphqlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

#[derive(Debug, Deserialize)]
struct GraphqlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct IssueData {
    issue: Option<Issue>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateData {
    issue_update: Success,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommentData {
    comment_create: Success,
}

#[derive(Debug, Deserialize)]
struct Success {
    success: bool,
}

/// Unwrap a GraphQL response, turning `errors` into an `Err`.
fn into_data<T>(resp: GraphqlResponse<T>) -> Result<T> {
    if !resp.errors.is_empty() {
        let messages: Vec<_> = resp.errors.into_iter().map(|e| e.message).collect();
        anyhow::bail!("Linear API error: {}", messages.join("; "));
    }
    resp.data.context("Linear response had no data")
}

impl LinearClient {
    pub fn new(http: reqwest::Client, api_key: &str) -> Self {
        Self {
            http,
            api_key: api_key.to_string(),
            endpoint: LINEAR_API_URL.to_string(),
        }
    }

    async fn graphql<T: DeserializeOwned>(&self, query: &str, variables: Value) -> Result<T> {
        let body = json!({ "query": query, "variables": variables });
        let resp: GraphqlResponse<T> = send_with_retry("linear graphql", || {
            self.http
                .post(&self.endpoint)
                .header("Authorization", &self.api_key)
                .json(&body)
        })
        .await?
        .json()
        .await
        .context("Failed to parse Linear response")?;
        into_data(resp)
    }
}

#[async_trait]
impl IssueTracker for LinearClient {
    async fn get_issue(&self, issue_id: &str) -> Result<Issue> {
        let data: IssueData = self.graphql(GET_ISSUE, json!({ "id": issue_id })).await?;
        data.issue
            .with_context(|| format!("Issue {} not found", issue_id))
    }

    async fn update_description(&self, issue_id: &str, text: &str) -> Result<()> {
        let data: UpdateData = self
            .graphql(
                UPDATE_DESCRIPTION,
                json!({ "id": issue_id, "description": text }),
            )
            .await?;
        if !data.issue_update.success {
            anyhow::bail!("Linear rejected description update for {}", issue_id);
        }
        Ok(())
    }

    async fn post_comment(&self, issue_id: &str, text: &str, parent_id: Option<&str>) -> Result<()> {
        let mut input = json!({ "issueId": issue_id, "body": text });
        if let Some(parent) = parent_id {
            input["parentId"] = json!(parent);
        }
        let data: CommentData = self
            .graphql(CREATE_COMMENT, json!({ "input": input }))
            .await?;
        if !data.comment_create.success {
            anyhow::bail!("Linear rejected comment on {}", issue_id);
        }
        Ok(())
    }
}
