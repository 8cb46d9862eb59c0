//! Google Drive v3 and Gmail v1 clients, authenticated with a bearer access
//! token.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;

use super::send_with_retry;
use crate::sync::connectors::{DocumentMeta, DocumentSource, MailMessage, MailSource};

const DRIVE_API: &str = "https://www.googleapis.com/drive/v3";
const GMAIL_API: &str = "https://gmail.googleapis.com/gmail/v1/users/me";
const MAX_MESSAGES: usize = 500;

// ── Drive ─────────────────────────────────────────────────────────────

pub struct DriveClient {
    http: reqwest::Client,
    token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    name: String,
    mime_type: String,
    modified_time: DateTime<Utc>,
    #[serde(default)]
    owners: Vec<DriveOwner>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveOwner {
    #[serde(default)]
    display_name: String,
    #[serde(default)]
    email_address: Option<String>,
}

/// How a Drive file becomes text: an export format for native Google types,
/// a raw download for plain files, or nothing.
fn export_strategy(mime_type: &str) -> Option<Export> {
    match mime_type {
        "application/vnd.google-apps.document" | "application/vnd.google-apps.presentation" => {
            Some(Export::As("text/plain"))
        }
        "application/vnd.google-apps.spreadsheet" => Some(Export::As("text/csv")),
        m if m.starts_with("text/") || m == "application/json" => Some(Export::Download),
        _ => None,
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Export {
    As(&'static str),
    Download,
}

impl DriveClient {
    pub fn new(http: reqwest::Client, token: &str) -> Self {
        Self {
            http,
            token: token.to_string(),
        }
    }

    async fn file_mime(&self, file_id: &str) -> Result<String> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Mime {
            mime_type: String,
        }
        let url = format!("{}/files/{}", DRIVE_API, file_id);
        let mime: Mime = send_with_retry("drive files.get", || {
            self.http
                .get(&url)
                .bearer_auth(&self.token)
                .query(&[("fields", "mimeType")])
        })
        .await?
        .json()
        .await
        .context("Failed to parse Drive file metadata")?;
        Ok(mime.mime_type)
    }
}

#[async_trait]
impl DocumentSource for DriveClient {
    async fn changed_files(&self, since: Option<DateTime<Utc>>) -> Result<Vec<DocumentMeta>> {
        let mut q = "trashed = false".to_string();
        if let Some(since) = since {
            q.push_str(&format!(
                " and modifiedTime >= '{}'",
                since.to_rfc3339_opts(SecondsFormat::Millis, true)
            ));
        }
        let url = format!("{}/files", DRIVE_API);
        let mut out = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut query = vec![
                ("q", q.clone()),
                ("orderBy", "modifiedTime".to_string()),
                ("pageSize", "100".to_string()),
                (
                    "fields",
                    "nextPageToken,files(id,name,mimeType,modifiedTime,owners(displayName,emailAddress))"
                        .to_string(),
                ),
            ];
            if let Some(token) = &page_token {
                query.push(("pageToken", token.clone()));
            }
            let list: FileList = send_with_retry("drive files.list", || {
                self.http.get(&url).bearer_auth(&self.token).query(&query)
            })
            .await?
            .json()
            .await
            .context("Failed to parse Drive file list")?;

            for file in list.files {
                if export_strategy(&file.mime_type).is_none() {
                    continue;
                }
                let owner = file.owners.into_iter().next();
                out.push(DocumentMeta {
                    id: file.id,
                    name: file.name,
                    owner: owner
                        .as_ref()
                        .map(|o| o.display_name.clone())
                        .unwrap_or_default(),
                    owner_email: owner.and_then(|o| o.email_address),
                    modified_at: file.modified_time,
                });
            }
            match list.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(out)
    }

    async fn export_text(&self, file_id: &str) -> Result<Option<String>> {
        let mime = self.file_mime(file_id).await?;
        let resp = match export_strategy(&mime) {
            Some(Export::As(target)) => {
                let url = format!("{}/files/{}/export", DRIVE_API, file_id);
                send_with_retry("drive files.export", || {
                    self.http
                        .get(&url)
                        .bearer_auth(&self.token)
                        .query(&[("mimeType", target)])
                })
                .await?
            }
            Some(Export::Download) => {
                let url = format!("{}/files/{}", DRIVE_API, file_id);
                send_with_retry("drive files.get media", || {
                    self.http
                        .get(&url)
                        .bearer_auth(&self.token)
                        .query(&[("alt", "media")])
                })
                .await?
            }
            None => return Ok(None),
        };
        let text = resp.text().await.context("Failed to read Drive export")?;
        Ok(Some(text).filter(|t| !t.trim().is_empty()))
    }
}

// ── Gmail ─────────────────────────────────────────────────────────────

pub struct GmailClient {
    http: reqwest::Client,
    token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageList {
    #[serde(default)]
    messages: Vec<MessageRef>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    id: String,
    internal_date: String,
    #[serde(default)]
    snippet: String,
    payload: Part,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    headers: Vec<Header>,
    #[serde(default)]
    body: Option<PartBody>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Header {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct PartBody {
    #[serde(default)]
    data: Option<String>,
}

impl Part {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// First `text/plain` body, depth first.
    fn plain_text(&self) -> Option<String> {
        if self.mime_type == "text/plain" {
            let data = self.body.as_ref()?.data.as_ref()?;
            let bytes = URL_SAFE_NO_PAD.decode(data.trim_end_matches('=')).ok()?;
            return Some(String::from_utf8_lossy(&bytes).into_owned());
        }
        self.parts.iter().find_map(Part::plain_text)
    }
}

/// Split a `From` header into display name and address.
pub fn parse_from(header: &str) -> (String, String) {
    match (header.rfind('<'), header.rfind('>')) {
        (Some(start), Some(end)) if start < end => {
            let name = header[..start].trim().trim_matches('"').to_string();
            let address = header[start + 1..end].trim().to_string();
            let name = if name.is_empty() { address.clone() } else { name };
            (name, address)
        }
        _ => {
            let address = header.trim().to_string();
            (address.clone(), address)
        }
    }
}

impl GmailClient {
    pub fn new(http: reqwest::Client, token: &str) -> Self {
        Self {
            http,
            token: token.to_string(),
        }
    }

    async fn get_message(&self, id: &str) -> Result<MailMessage> {
        let url = format!("{}/messages/{}", GMAIL_API, id);
        let raw: RawMessage = send_with_retry("gmail messages.get", || {
            self.http
                .get(&url)
                .bearer_auth(&self.token)
                .query(&[("format", "full")])
        })
        .await?
        .json()
        .await
        .context("Failed to parse Gmail message")?;

        let millis: i64 = raw
            .internal_date
            .parse()
            .with_context(|| format!("Invalid internalDate for message {}", raw.id))?;
        let received_at = DateTime::from_timestamp_millis(millis)
            .with_context(|| format!("internalDate out of range for message {}", raw.id))?;
        let (from_name, from_address) = parse_from(raw.payload.header("From").unwrap_or_default());
        Ok(MailMessage {
            subject: raw
                .payload
                .header("Subject")
                .unwrap_or("(no subject)")
                .to_string(),
            body: raw.payload.plain_text().unwrap_or(raw.snippet),
            id: raw.id,
            from_name,
            from_address,
            received_at,
        })
    }
}

#[async_trait]
impl MailSource for GmailClient {
    async fn messages_since(&self, since: Option<DateTime<Utc>>) -> Result<Vec<MailMessage>> {
        let mut q = "-in:chats".to_string();
        if let Some(since) = since {
            // `after:` has one-second resolution and is exclusive; step back
            // so the boundary second is re-read and filtered by cursor.
            q.push_str(&format!(" after:{}", since.timestamp() - 1));
        }
        let url = format!("{}/messages", GMAIL_API);
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut query = vec![("q", q.clone()), ("maxResults", "100".to_string())];
            if let Some(token) = &page_token {
                query.push(("pageToken", token.clone()));
            }
            let list: MessageList = send_with_retry("gmail messages.list", || {
                self.http.get(&url).bearer_auth(&self.token).query(&query)
            })
            .await?
            .json()
            .await
            .context("Failed to parse Gmail message list")?;
            ids.extend(list.messages.into_iter().map(|m| m.id));
            match list.next_page_token {
                Some(token) if ids.len() < MAX_MESSAGES => page_token = Some(token),
                _ => break,
            }
        }

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            out.push(self.get_message(&id).await?);
        }
        Ok(out)
    }
}
