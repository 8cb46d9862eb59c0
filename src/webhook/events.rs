//! Linear webhook payloads.
//!
//! Only two deliveries matter: an issue being created and a comment being
//! created. Everything else parses to [`LinearEvent::Ignored`]. A payload that
//! claims to be one of the two but lacks the ids we need is an error.

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{kind} payload is missing {field}")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueCreated {
    pub issue_id: String,
    pub identifier: String,
    pub title: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentCreated {
    pub issue_id: String,
    pub comment_id: Option<String>,
    /// Set when the comment is itself a reply.
    pub parent_id: Option<String>,
    pub body: String,
    pub author: String,
}

impl CommentCreated {
    /// Linear threads one level deep: answer under the parent when the
    /// command was a reply, otherwise under the command itself.
    pub fn reply_target(&self) -> Option<&str> {
        self.parent_id.as_deref().or(self.comment_id.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinearEvent {
    IssueCreated(IssueCreated),
    CommentCreated(CommentCreated),
    /// `type/action` of a delivery we do not handle.
    Ignored(String),
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    action: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Deserialize)]
struct IssueData {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    identifier: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommentData {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    body: String,
    #[serde(default)]
    issue_id: Option<String>,
    #[serde(default)]
    issue: Option<IssueRef>,
    #[serde(default)]
    parent_id: Option<String>,
    #[serde(default)]
    parent: Option<IssueRef>,
    #[serde(default)]
    user: Option<UserRef>,
}

#[derive(Deserialize)]
struct IssueRef {
    #[serde(default)]
    id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserRef {
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

pub fn parse_event(payload: &[u8]) -> Result<LinearEvent, ParseError> {
    let envelope: Envelope = serde_json::from_slice(payload)?;

    match (envelope.kind.as_str(), envelope.action.as_str()) {
        ("Issue", "create") => {
            let data: IssueData = serde_json::from_value(envelope.data)?;
            let issue_id = non_empty(data.id).ok_or(ParseError::MissingField {
                kind: "Issue",
                field: "data.id",
            })?;
            Ok(LinearEvent::IssueCreated(IssueCreated {
                issue_id,
                identifier: data.identifier,
                title: data.title,
                description: data.description.unwrap_or_default(),
            }))
        }
        ("Comment", "create") => {
            let data: CommentData = serde_json::from_value(envelope.data)?;
            let issue_id = non_empty(data.issue_id)
                .or_else(|| non_empty(data.issue.and_then(|i| i.id)))
                .ok_or(ParseError::MissingField {
                    kind: "Comment",
                    field: "data.issueId",
                })?;
            let author = data
                .user
                .and_then(|u| non_empty(u.display_name).or(non_empty(u.name)))
                .unwrap_or_default();
            Ok(LinearEvent::CommentCreated(CommentCreated {
                issue_id,
                comment_id: non_empty(data.id),
                parent_id: non_empty(data.parent_id)
                    .or_else(|| non_empty(data.parent.and_then(|p| p.id))),
                body: data.body,
                author,
            }))
        }
        (kind, action) => Ok(LinearEvent::Ignored(format!("{}/{}", kind, action))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_create_parses() {
        let event = parse_event(
            br#"{"type": "Issue", "action": "create",
                 "data": {"id": "abc", "identifier": "ENG-7", "title": "Login", "description": null}}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            LinearEvent::IssueCreated(IssueCreated {
                issue_id: "abc".into(),
                identifier: "ENG-7".into(),
                title: "Login".into(),
                description: String::new(),
            })
        );
    }

    #[test]
    fn comment_create_reads_nested_issue_and_parent() {
        let event = parse_event(
            br#"{"type": "Comment", "action": "create",
                 "data": {"id": "c2", "body": "/retry", "issue": {"id": "abc"},
                          "parentId": "c1", "user": {"displayName": "Dana"}}}"#,
        )
        .unwrap();
        let LinearEvent::CommentCreated(comment) = event else {
            panic!("expected comment, got {:?}", event);
        };
        assert_eq!(comment.issue_id, "abc");
        assert_eq!(comment.author, "Dana");
        assert_eq!(comment.reply_target(), Some("c1"));
    }

    #[test]
    fn top_level_comment_replies_to_itself() {
        let event = parse_event(
            br#"{"type": "Comment", "action": "create",
                 "data": {"id": "c1", "body": "/help", "issueId": "abc"}}"#,
        )
        .unwrap();
        let LinearEvent::CommentCreated(comment) = event else {
            panic!("expected comment");
        };
        assert_eq!(comment.reply_target(), Some("c1"));
    }

    #[test]
    fn other_events_are_ignored() {
        let event = parse_event(br#"{"type": "Issue", "action": "update", "data": {"id": "abc"}}"#)
            .unwrap();
        assert_eq!(event, LinearEvent::Ignored("Issue/update".into()));
        assert!(matches!(
            parse_event(br#"{"type": "Reaction"}"#).unwrap(),
            LinearEvent::Ignored(_)
        ));
    }

    #[test]
    fn missing_ids_and_bad_json_are_errors() {
        assert!(matches!(
            parse_event(br#"{"type": "Issue", "action": "create", "data": {"title": "x"}}"#),
            Err(ParseError::MissingField { .. })
        ));
        assert!(matches!(
            parse_event(br#"{"type": "Comment", "action": "create", "data": {"body": "/help"}}"#),
            Err(ParseError::MissingField { .. })
        ));
        assert!(matches!(parse_event(b"not json"), Err(ParseError::Json(_))));
    }
}
