//! The connector contract.
//!
//! A connector pulls items modified since its watermarks and writes them to a
//! [`RecordSink`] before returning. The returned watermarks are the only
//! signal of progress the orchestrator trusts, so they must never point past
//! a record that was not durably written.

use async_trait::async_trait;
use thiserror::Error;

use crate::record::ContextRecord;
use crate::watermark::{Cursor, SyncWatermark, WatermarkSet};

/// Durable destination for materialized records.
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Write a record. Returns `true` if it was new, `false` if an identical
    /// version was already stored.
    async fn write(&self, record: &ContextRecord) -> anyhow::Result<bool>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Stable identity used for watermark keys and subset selection.
    fn name(&self) -> &'static str;

    async fn fetch_since(
        &self,
        watermarks: &WatermarkSet,
        sink: &dyn RecordSink,
    ) -> Result<FetchOutcome, PartialSync>;
}

/// What one `fetch_since` call durably achieved.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchOutcome {
    /// Watermarks that moved. Sub-sources without progress are absent.
    pub advanced: Vec<SyncWatermark>,
    pub written: usize,
    /// Items re-seen with an identical stored version.
    pub unchanged: usize,
    /// Items deliberately dropped at the connector boundary.
    pub discarded: usize,
}

impl FetchOutcome {
    pub fn merge(&mut self, other: FetchOutcome) {
        self.advanced.extend(other.advanced);
        self.written += other.written;
        self.unchanged += other.unchanged;
        self.discarded += other.discarded;
    }
}

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("Upstream request failed: {0}")]
    Upstream(#[source] anyhow::Error),

    #[error("Failed to write record {source_id}: {source}")]
    Materialize {
        source_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Cannot determine a safe cursor: {0}")]
    UnsafeCursor(String),
}

/// A failed fetch together with whatever prefix was durably committed first.
#[derive(Debug, Error)]
#[error("sync failed after {} committed records: {source}", committed.written)]
pub struct PartialSync {
    pub committed: FetchOutcome,
    #[source]
    pub source: ConnectorError,
}

impl PartialSync {
    pub fn nothing_committed(source: ConnectorError) -> Self {
        Self {
            committed: FetchOutcome::default(),
            source,
        }
    }
}

impl From<ConnectorError> for PartialSync {
    fn from(source: ConnectorError) -> Self {
        Self::nothing_committed(source)
    }
}

/// One upstream item after connector-side filtering.
#[derive(Debug, Clone)]
pub enum Fetched {
    Record(ContextRecord),
    /// Seen and intentionally not stored (e.g. sender not allow-listed).
    Discarded(Cursor),
}

impl Fetched {
    pub fn cursor(&self) -> Cursor {
        match self {
            Self::Record(r) => r.cursor(),
            Self::Discarded(c) => c.clone(),
        }
    }
}

/// Materialize one sub-source's items in cursor order.
///
/// Items at or before `since` are skipped. Progress is recorded into
/// `outcome` as it happens: on a write failure the watermark pushed for this
/// sub-source is the cursor of the last item that made it, and the error is
/// returned for the caller to wrap in [`PartialSync`].
pub async fn materialize_in_order(
    connector_id: &str,
    sub_source: &str,
    since: Option<&Cursor>,
    mut items: Vec<Fetched>,
    sink: &dyn RecordSink,
    outcome: &mut FetchOutcome,
) -> Result<(), ConnectorError> {
    items.sort_by_key(Fetched::cursor);
    let mut last: Option<Cursor> = None;
    let mut failure = None;

    for item in items {
        let cursor = item.cursor();
        if since.is_some_and(|s| &cursor <= s) {
            continue;
        }
        match item {
            Fetched::Discarded(_) => outcome.discarded += 1,
            Fetched::Record(record) => match sink.write(&record).await {
                Ok(true) => outcome.written += 1,
                Ok(false) => outcome.unchanged += 1,
                Err(e) => {
                    failure = Some(ConnectorError::Materialize {
                        source_id: record.source_id.clone(),
                        source: e,
                    });
                    break;
                }
            },
        }
        last = Some(cursor);
    }

    if let Some(cursor) = last {
        outcome
            .advanced
            .push(SyncWatermark::new(connector_id, sub_source, cursor));
    }
    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{SourceKind, Visibility};
    use chrono::{Duration, TimeZone, Utc};
    use std::sync::Mutex;

    struct VecSink {
        stored: Mutex<Vec<ContextRecord>>,
        fail_on_write: Option<usize>,
        writes: Mutex<usize>,
    }

    impl VecSink {
        fn new(fail_on_write: Option<usize>) -> Self {
            Self {
                stored: Mutex::new(Vec::new()),
                fail_on_write,
                writes: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl RecordSink for VecSink {
        async fn write(&self, record: &ContextRecord) -> anyhow::Result<bool> {
            let mut writes = self.writes.lock().unwrap();
            *writes += 1;
            if Some(*writes) == self.fail_on_write {
                anyhow::bail!("disk full");
            }
            let mut stored = self.stored.lock().unwrap();
            if stored.contains(record) {
                return Ok(false);
            }
            stored.push(record.clone());
            Ok(true)
        }
    }

    fn record(i: i64) -> ContextRecord {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        ContextRecord {
            source_kind: SourceKind::Chat,
            source_id: format!("msg-{}", i),
            title: format!("Message {}", i),
            body_text: "body".into(),
            author: "alice".into(),
            author_address: None,
            visibility: Visibility::Internal,
            modified_at: base + Duration::minutes(i),
        }
    }

    #[tokio::test]
    async fn writes_in_cursor_order_and_advances_to_last() {
        let sink = VecSink::new(None);
        let mut outcome = FetchOutcome::default();
        let items = vec![
            Fetched::Record(record(3)),
            Fetched::Record(record(1)),
            Fetched::Record(record(2)),
        ];
        materialize_in_order("chat", "C1", None, items, &sink, &mut outcome)
            .await
            .unwrap();

        let stored = sink.stored.lock().unwrap();
        let ids: Vec<_> = stored.iter().map(|r| r.source_id.as_str()).collect();
        assert_eq!(ids, vec!["msg-1", "msg-2", "msg-3"]);
        assert_eq!(outcome.written, 3);
        assert_eq!(outcome.advanced.len(), 1);
        assert_eq!(outcome.advanced[0].cursor, record(3).cursor());
    }

    #[tokio::test]
    async fn failure_at_k_advances_exactly_to_prefix() {
        let sink = VecSink::new(Some(3));
        let mut outcome = FetchOutcome::default();
        let items = (1..=5).map(|i| Fetched::Record(record(i))).collect();
        let err = materialize_in_order("chat", "C1", None, items, &sink, &mut outcome)
            .await
            .unwrap_err();

        assert!(matches!(err, ConnectorError::Materialize { ref source_id, .. } if source_id == "msg-3"));
        assert_eq!(outcome.written, 2);
        assert_eq!(outcome.advanced[0].cursor, record(2).cursor());
    }

    #[tokio::test]
    async fn failure_on_first_write_leaves_no_watermark() {
        let sink = VecSink::new(Some(1));
        let mut outcome = FetchOutcome::default();
        let items = vec![Fetched::Record(record(1))];
        assert!(
            materialize_in_order("chat", "C1", None, items, &sink, &mut outcome)
                .await
                .is_err()
        );
        assert!(outcome.advanced.is_empty());
    }

    #[tokio::test]
    async fn skips_items_at_or_before_since_and_counts_discards() {
        let sink = VecSink::new(None);
        let mut outcome = FetchOutcome::default();
        let since = record(2).cursor();
        let items = vec![
            Fetched::Record(record(1)),
            Fetched::Record(record(2)),
            Fetched::Discarded(record(3).cursor()),
            Fetched::Record(record(4)),
        ];
        materialize_in_order("email", "inbox", Some(&since), items, &sink, &mut outcome)
            .await
            .unwrap();
        assert_eq!(outcome.written, 1);
        assert_eq!(outcome.discarded, 1);
        assert_eq!(outcome.advanced[0].cursor, record(4).cursor());
    }

    #[tokio::test]
    async fn nothing_new_produces_no_watermark() {
        let sink = VecSink::new(None);
        let mut outcome = FetchOutcome::default();
        let since = record(5).cursor();
        let items = (1..=5).map(|i| Fetched::Record(record(i))).collect();
        materialize_in_order("chat", "C1", Some(&since), items, &sink, &mut outcome)
            .await
            .unwrap();
        assert_eq!(outcome, FetchOutcome::default());
    }
}
