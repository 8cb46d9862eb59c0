//! Chat-history connector. One sub-source per channel.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use enhancer_common::{
    Connector, ConnectorError, ContextRecord, FetchOutcome, Fetched, PartialSync, RecordSink,
    SourceKind, Visibility, WatermarkSet, materialize_in_order,
};

use super::CHAT;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatChannel {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    /// Platform message id, unique within the channel.
    pub ts: String,
    pub author: String,
    pub author_email: Option<String>,
    pub text: String,
    pub posted_at: DateTime<Utc>,
}

/// The narrow slice of a chat platform the connector needs.
#[async_trait]
pub trait ChatSource: Send + Sync {
    async fn channels(&self) -> anyhow::Result<Vec<ChatChannel>>;

    /// Messages posted at or after `oldest` (all history when `None`).
    async fn history(
        &self,
        channel_id: &str,
        oldest: Option<DateTime<Utc>>,
    ) -> anyhow::Result<Vec<ChatMessage>>;
}

pub struct ChatConnector<S> {
    source: S,
    internal_domains: Vec<String>,
}

impl<S: ChatSource> ChatConnector<S> {
    pub fn new(source: S, internal_domains: Vec<String>) -> Self {
        Self {
            source,
            internal_domains,
        }
    }

    fn to_record(&self, channel: &ChatChannel, msg: ChatMessage) -> ContextRecord {
        let visibility = Visibility::for_address(msg.author_email.as_deref(), &self.internal_domains);
        ContextRecord {
            source_kind: SourceKind::Chat,
            source_id: format!("{}:{}", channel.id, msg.ts),
            title: format!("#{}", channel.name),
            body_text: msg.text,
            author: msg.author,
            author_address: msg.author_email,
            visibility,
            modified_at: msg.posted_at,
        }
    }
}

#[async_trait]
impl<S: ChatSource> Connector for ChatConnector<S> {
    fn name(&self) -> &'static str {
        CHAT
    }

    async fn fetch_since(
        &self,
        watermarks: &WatermarkSet,
        sink: &dyn RecordSink,
    ) -> Result<FetchOutcome, PartialSync> {
        let channels = self
            .source
            .channels()
            .await
            .map_err(ConnectorError::Upstream)?;

        let mut outcome = FetchOutcome::default();
        for channel in &channels {
            let since = watermarks.cursor(&channel.id);
            let messages = match self
                .source
                .history(&channel.id, since.map(|c| c.modified_at))
                .await
            {
                Ok(m) => m,
                Err(e) => {
                    return Err(PartialSync {
                        committed: outcome,
                        source: ConnectorError::Upstream(
                            e.context(format!("history for channel {}", channel.id)),
                        ),
                    });
                }
            };

            let items = messages
                .into_iter()
                .filter(|m| !m.text.trim().is_empty())
                .map(|m| Fetched::Record(self.to_record(channel, m)))
                .collect();

            if let Err(source) =
                materialize_in_order(CHAT, &channel.id, since, items, sink, &mut outcome).await
            {
                return Err(PartialSync {
                    committed: outcome,
                    source,
                });
            }
        }

        tracing::debug!(
            connector = CHAT,
            channels = channels.len(),
            written = outcome.written,
            "Chat fetch complete"
        );
        Ok(outcome)
    }
}
