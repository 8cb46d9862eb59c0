use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;

use super::send_with_retry;
use crate::sync::connectors::{ChatChannel, ChatMessage, ChatSource};

const SLACK_API: &str = "https://slack.com/api";
const PAGE_SIZE: &str = "200";

/// Slack Web API client. Works with user (`xoxp-`) and bot (`xoxb-`) tokens.
pub struct SlackClient {
    http: reqwest::Client,
    token: String,
    users: Mutex<Option<HashMap<String, SlackUser>>>,
}

#[derive(Debug, Clone, Deserialize)]
struct SlackUser {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    real_name: Option<String>,
    #[serde(default)]
    profile: SlackProfile,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SlackProfile {
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
}

impl SlackUser {
    fn display(&self) -> String {
        self.profile
            .display_name
            .clone()
            .filter(|n| !n.is_empty())
            .or_else(|| self.real_name.clone().filter(|n| !n.is_empty()))
            .unwrap_or_else(|| self.name.clone())
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    response_metadata: Option<Metadata>,
    #[serde(flatten)]
    body: Option<T>,
}

#[derive(Debug, Default, Deserialize)]
struct Metadata {
    #[serde(default)]
    next_cursor: String,
}

#[derive(Debug, Deserialize)]
struct ChannelsPage {
    channels: Vec<RawChannel>,
}

#[derive(Debug, Deserialize)]
struct RawChannel {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    is_member: bool,
    #[serde(default)]
    is_im: bool,
    #[serde(default)]
    user: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HistoryPage {
    messages: Vec<RawMessage>,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    ts: String,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    text: String,
    #[serde(default)]
    subtype: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsersPage {
    members: Vec<SlackUser>,
}

/// Parse a Slack `ts` ("1709294400.000100") into a timestamp.
pub fn parse_ts(ts: &str) -> Option<DateTime<Utc>> {
    let (secs, frac) = ts.split_once('.').unwrap_or((ts, "0"));
    let secs: i64 = secs.parse().ok()?;
    let micros: u32 = format!("{:0<6}", frac).get(..6)?.parse().ok()?;
    DateTime::from_timestamp(secs, micros * 1000)
}

impl SlackClient {
    pub fn new(http: reqwest::Client, token: &str) -> Self {
        Self {
            http,
            token: token.to_string(),
            users: Mutex::new(None),
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        query: &[(&str, String)],
    ) -> Result<(T, String)> {
        let url = format!("{}/{}", SLACK_API, method);
        let resp = send_with_retry(method, || {
            self.http
                .get(&url)
                .bearer_auth(&self.token)
                .query(query)
        })
        .await?;
        let envelope: Envelope<T> = resp
            .json()
            .await
            .with_context(|| format!("Failed to parse Slack {} response", method))?;
        if !envelope.ok {
            anyhow::bail!(
                "Slack {} failed: {}",
                method,
                envelope.error.unwrap_or_else(|| "unknown error".into())
            );
        }
        let next = envelope
            .response_metadata
            .map(|m| m.next_cursor)
            .unwrap_or_default();
        let body = envelope
            .body
            .with_context(|| format!("Slack {} response had no body", method))?;
        Ok((body, next))
    }

    async fn users(&self) -> Result<HashMap<String, SlackUser>> {
        let mut guard = self.users.lock().await;
        if let Some(users) = guard.as_ref() {
            return Ok(users.clone());
        }
        let mut users = HashMap::new();
        let mut cursor = String::new();
        loop {
            let (page, next): (UsersPage, String) = self
                .call(
                    "users.list",
                    &[("limit", PAGE_SIZE.to_string()), ("cursor", cursor.clone())],
                )
                .await?;
            users.extend(page.members.into_iter().map(|u| (u.id.clone(), u)));
            if next.is_empty() {
                break;
            }
            cursor = next;
        }
        *guard = Some(users.clone());
        Ok(users)
    }
}

#[async_trait]
impl ChatSource for SlackClient {
    async fn channels(&self) -> Result<Vec<ChatChannel>> {
        let users = self.users().await?;
        let mut out = Vec::new();
        let mut cursor = String::new();
        loop {
            let (page, next): (ChannelsPage, String) = self
                .call(
                    "conversations.list",
                    &[
                        ("types", "public_channel,private_channel,im,mpim".to_string()),
                        ("exclude_archived", "true".to_string()),
                        ("limit", PAGE_SIZE.to_string()),
                        ("cursor", cursor.clone()),
                    ],
                )
                .await?;
            for raw in page.channels {
                if !raw.is_member && !raw.is_im {
                    continue;
                }
                let name = match (raw.is_im, raw.user.as_ref()) {
                    (true, Some(uid)) => users
                        .get(uid)
                        .map(|u| format!("dm-{}", u.display()))
                        .unwrap_or_else(|| format!("dm-{}", uid)),
                    _ => raw.name.unwrap_or_else(|| raw.id.clone()),
                };
                out.push(ChatChannel { id: raw.id, name });
            }
            if next.is_empty() {
                break;
            }
            cursor = next;
        }
        Ok(out)
    }

    async fn history(
        &self,
        channel_id: &str,
        oldest: Option<DateTime<Utc>>,
    ) -> Result<Vec<ChatMessage>> {
        let users = self.users().await?;
        let oldest = oldest
            .map(|t| format!("{}.{:06}", t.timestamp(), t.timestamp_subsec_micros()))
            .unwrap_or_else(|| "0".to_string());
        let mut out = Vec::new();
        let mut cursor = String::new();
        loop {
            let (page, next): (HistoryPage, String) = self
                .call(
                    "conversations.history",
                    &[
                        ("channel", channel_id.to_string()),
                        ("oldest", oldest.clone()),
                        ("inclusive", "true".to_string()),
                        ("limit", PAGE_SIZE.to_string()),
                        ("cursor", cursor.clone()),
                    ],
                )
                .await?;
            for raw in page.messages {
                // Joins, leaves and topic changes carry no context.
                if raw.subtype.as_deref().is_some_and(|s| s.starts_with("channel_")) {
                    continue;
                }
                let Some(posted_at) = parse_ts(&raw.ts) else {
                    tracing::debug!(ts = %raw.ts, "Skipping message with unparseable ts");
                    continue;
                };
                let user = raw.user.as_ref().and_then(|id| users.get(id));
                out.push(ChatMessage {
                    author: user
                        .map(SlackUser::display)
                        .or(raw.user.clone())
                        .unwrap_or_else(|| "unknown".into()),
                    author_email: user.and_then(|u| u.profile.email.clone()),
                    ts: raw.ts,
                    text: raw.text,
                    posted_at,
                });
            }
            if next.is_empty() {
                break;
            }
            cursor = next;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ts_keeps_microseconds() {
        let t = parse_ts("1709294400.000100").unwrap();
        assert_eq!(t.timestamp(), 1709294400);
        assert_eq!(t.timestamp_subsec_micros(), 100);
        assert_eq!(parse_ts("1709294400").unwrap().timestamp_subsec_micros(), 0);
        assert!(parse_ts("yesterday").is_none());
    }

    #[test]
    fn envelope_reports_errors() {
        let env: Envelope<HistoryPage> =
            serde_json::from_str(r#"{"ok": false, "error": "channel_not_found"}"#).unwrap();
        assert!(!env.ok);
        assert_eq!(env.error.as_deref(), Some("channel_not_found"));
    }

    #[test]
    fn envelope_flattens_body_and_cursor() {
        let env: Envelope<HistoryPage> = serde_json::from_str(
            r#"{"ok": true, "messages": [{"ts": "1.0", "text": "hi", "user": "U1"}],
                "response_metadata": {"next_cursor": "abc"}}"#,
        )
        .unwrap();
        assert_eq!(env.body.unwrap().messages.len(), 1);
        assert_eq!(env.response_metadata.unwrap().next_cursor, "abc");
    }

    #[test]
    fn user_display_prefers_profile_name() {
        let user: SlackUser = serde_json::from_str(
            r#"{"id": "U1", "name": "jdoe", "real_name": "Jane Doe",
                "profile": {"email": "jane@acme.io", "display_name": ""}}"#,
        )
        .unwrap();
        assert_eq!(user.display(), "Jane Doe");
    }
}
