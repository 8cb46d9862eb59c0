//! Email connector.
//!
//! Messages from senders that are not allow-listed are fetched and dropped
//! here. They never reach the corpus, but they still move the cursor so they
//! are not fetched again.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use enhancer_common::{
    Connector, ConnectorError, ContextRecord, Cursor, FetchOutcome, Fetched, PartialSync,
    RecordSink, SourceKind, Visibility, WatermarkSet, materialize_in_order,
};

use super::EMAIL;
use crate::sync::allow_list::{AddressBook, AllowList};

const SUB_SOURCE: &str = "inbox";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailMessage {
    pub id: String,
    pub from_name: String,
    pub from_address: String,
    pub subject: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

#[async_trait]
pub trait MailSource: Send + Sync {
    async fn messages_since(&self, since: Option<DateTime<Utc>>) -> anyhow::Result<Vec<MailMessage>>;
}

pub struct EmailConnector<S> {
    source: S,
    explicit_senders: Vec<String>,
    internal_domains: Vec<String>,
    address_book: Arc<dyn AddressBook>,
}

impl<S: MailSource> EmailConnector<S> {
    pub fn new(
        source: S,
        explicit_senders: Vec<String>,
        internal_domains: Vec<String>,
        address_book: Arc<dyn AddressBook>,
    ) -> Self {
        Self {
            source,
            explicit_senders,
            internal_domains,
            address_book,
        }
    }

    async fn allow_list(&self) -> Result<AllowList, ConnectorError> {
        let chat = self
            .address_book
            .chat_addresses()
            .await
            .map_err(ConnectorError::Upstream)?;
        Ok(AllowList::build(
            &self.explicit_senders,
            &self.internal_domains,
            &chat,
        ))
    }
}

#[async_trait]
impl<S: MailSource> Connector for EmailConnector<S> {
    fn name(&self) -> &'static str {
        EMAIL
    }

    async fn fetch_since(
        &self,
        watermarks: &WatermarkSet,
        sink: &dyn RecordSink,
    ) -> Result<FetchOutcome, PartialSync> {
        let allow = self.allow_list().await?;
        if allow.is_empty() {
            tracing::warn!(connector = EMAIL, "No allowed senders configured; skipping");
            return Ok(FetchOutcome::default());
        }
        tracing::debug!(connector = EMAIL, entries = allow.len(), "Allow-list built");

        let since = watermarks.cursor(SUB_SOURCE);
        let messages = self
            .source
            .messages_since(since.map(|c| c.modified_at))
            .await
            .map_err(ConnectorError::Upstream)?;

        let items = messages
            .into_iter()
            .map(|m| {
                if allow.permits(&m.from_address).is_none() {
                    return Fetched::Discarded(Cursor::new(m.received_at, &m.id));
                }
                let visibility =
                    Visibility::for_address(Some(&m.from_address), &self.internal_domains);
                Fetched::Record(ContextRecord {
                    source_kind: SourceKind::Email,
                    source_id: m.id,
                    title: m.subject,
                    body_text: m.body,
                    author: m.from_name,
                    author_address: Some(m.from_address.to_lowercase()),
                    visibility,
                    modified_at: m.received_at,
                })
            })
            .collect();

        let mut outcome = FetchOutcome::default();
        materialize_in_order(EMAIL, SUB_SOURCE, since, items, sink, &mut outcome)
            .await
            .map_err(|source| PartialSync {
                committed: outcome.clone(),
                source,
            })?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DbHandle, EnhancerDb};
    use chrono::TimeZone;

    struct FakeInbox(Vec<MailMessage>);

    #[async_trait]
    impl MailSource for FakeInbox {
        async fn messages_since(&self, since: Option<DateTime<Utc>>) -> anyhow::Result<Vec<MailMessage>> {
            Ok(self
                .0
                .iter()
                .filter(|m| since.is_none_or(|s| m.received_at >= s))
                .cloned()
                .collect())
        }
    }

    struct StaticBook(Vec<String>);

    #[async_trait]
    impl AddressBook for StaticBook {
        async fn chat_addresses(&self) -> anyhow::Result<Vec<String>> {
            Ok(self.0.clone())
        }
    }

    fn mail(id: &str, from: &str, minute: u32) -> MailMessage {
        MailMessage {
            id: id.into(),
            from_name: "Sender".into(),
            from_address: from.into(),
            subject: format!("Subject {}", id),
            body: "Hello".into(),
            received_at: Utc.with_ymd_and_hms(2024, 3, 3, 12, minute, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn non_allow_listed_mail_is_never_stored() {
        let db = DbHandle::new(EnhancerDb::new_in_memory().unwrap());
        let inbox = FakeInbox(vec![
            mail("m1", "boss@acme.io", 1),
            mail("m2", "spam@random.biz", 2),
            mail("m3", "friend@chat-derived.org", 3),
        ]);
        let connector = EmailConnector::new(
            inbox,
            vec![],
            vec!["acme.io".into()],
            Arc::new(StaticBook(vec!["friend@chat-derived.org".into()])),
        );

        let outcome = connector.fetch_since(&WatermarkSet::new(), &db).await.unwrap();
        assert_eq!(outcome.written, 2);
        assert_eq!(outcome.discarded, 1);
        assert_eq!(outcome.advanced[0].cursor.source_id, "m3");

        let records = db.call(|db| db.latest_records()).await.unwrap();
        assert!(records.iter().all(|r| r.source_id != "m2"));
        let boss = records.iter().find(|r| r.source_id == "m1").unwrap();
        assert_eq!(boss.visibility, Visibility::Internal);
    }

    #[tokio::test]
    async fn empty_allow_list_skips_without_fetching() {
        let db = DbHandle::new(EnhancerDb::new_in_memory().unwrap());
        let connector = EmailConnector::new(
            FakeInbox(vec![mail("m1", "a@b.com", 1)]),
            vec![],
            vec![],
            Arc::new(StaticBook(vec![])),
        );
        let outcome = connector.fetch_since(&WatermarkSet::new(), &db).await.unwrap();
        assert_eq!(outcome, FetchOutcome::default());
    }

    #[tokio::test]
    async fn discarded_tail_still_advances_cursor() {
        let db = DbHandle::new(EnhancerDb::new_in_memory().unwrap());
        let connector = EmailConnector::new(
            FakeInbox(vec![mail("m1", "ok@vendor.com", 1), mail("m2", "no@spam.com", 2)]),
            vec!["@vendor.com".into()],
            vec![],
            Arc::new(StaticBook(vec![])),
        );
        let first = connector.fetch_since(&WatermarkSet::new(), &db).await.unwrap();
        let marks: WatermarkSet = first.advanced.into_iter().collect();
        let second = connector.fetch_since(&marks, &db).await.unwrap();
        assert_eq!(second.written + second.discarded, 0);
    }
}
