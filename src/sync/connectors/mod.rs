//! Connector implementations, each generic over the narrow upstream trait it
//! reads from.

pub mod chat;
pub mod documents;
pub mod email;
pub mod github;

use std::sync::Arc;

use enhancer_common::Connector;

use crate::config::EnhancerConfig;
use crate::discovery::DiscoveryCache;
use crate::store::DbHandle;
use crate::upstream::github::GithubClient;
use crate::upstream::google::{DriveClient, GmailClient};
use crate::upstream::slack::SlackClient;

pub use chat::{ChatChannel, ChatConnector, ChatMessage, ChatSource};
pub use documents::{DocumentConnector, DocumentMeta, DocumentSource};
pub use email::{EmailConnector, MailMessage, MailSource};
pub use github::GithubConnector;

pub const CHAT: &str = "slack";
pub const DOCUMENTS: &str = "gdrive";
pub const EMAIL: &str = "gmail";
pub const GITHUB: &str = "github";

pub const ALL: [&str; 4] = [CHAT, DOCUMENTS, GITHUB, EMAIL];

/// Construct the enabled connectors in configured order.
pub fn build(
    config: &EnhancerConfig,
    db: &DbHandle,
    cache: &Arc<DiscoveryCache>,
    http: &reqwest::Client,
) -> Vec<Arc<dyn Connector>> {
    let creds = &config.credentials;
    let internal = config.email.internal_domains.clone();
    let mut out: Vec<Arc<dyn Connector>> = Vec::new();

    for name in config.enabled_connectors() {
        let connector: Option<Arc<dyn Connector>> = match name.as_str() {
            CHAT => creds.slack_token.as_ref().map(|token| {
                Arc::new(ChatConnector::new(
                    SlackClient::new(http.clone(), token),
                    internal.clone(),
                )) as Arc<dyn Connector>
            }),
            DOCUMENTS => creds.google_access_token.as_ref().map(|token| {
                Arc::new(DocumentConnector::new(
                    DriveClient::new(http.clone(), token),
                    internal.clone(),
                )) as Arc<dyn Connector>
            }),
            EMAIL => creds.google_access_token.as_ref().map(|token| {
                Arc::new(EmailConnector::new(
                    GmailClient::new(http.clone(), token),
                    config.email.allowed_senders.clone(),
                    internal.clone(),
                    Arc::new(db.clone()),
                )) as Arc<dyn Connector>
            }),
            GITHUB => creds.github_token.as_ref().map(|token| {
                Arc::new(GithubConnector::new(
                    GithubClient::new(http.clone(), token, creds.github_org.clone()),
                    cache.clone(),
                )) as Arc<dyn Connector>
            }),
            other => {
                tracing::warn!(connector = other, "Ignoring unknown connector in sync order");
                None
            }
        };
        out.extend(connector);
    }
    out
}
