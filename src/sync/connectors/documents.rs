//! Shared-document connector.
//!
//! Listing and exporting are separate upstream calls. Exports happen in cursor
//! order so that when one fails, everything before it can still be committed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use enhancer_common::{
    Connector, ConnectorError, ContextRecord, Cursor, FetchOutcome, Fetched, PartialSync,
    RecordSink, SourceKind, Visibility, WatermarkSet, materialize_in_order,
};

use super::DOCUMENTS;

const SUB_SOURCE: &str = "files";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentMeta {
    pub id: String,
    pub name: String,
    pub owner: String,
    pub owner_email: Option<String>,
    pub modified_at: DateTime<Utc>,
}

impl DocumentMeta {
    fn cursor(&self) -> Cursor {
        Cursor::new(self.modified_at, &self.id)
    }
}

#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// Files modified at or after `since` (everything when `None`).
    async fn changed_files(&self, since: Option<DateTime<Utc>>) -> anyhow::Result<Vec<DocumentMeta>>;

    /// Plain-text export of one file. `None` for files with no text form.
    async fn export_text(&self, file_id: &str) -> anyhow::Result<Option<String>>;
}

pub struct DocumentConnector<S> {
    source: S,
    internal_domains: Vec<String>,
}

impl<S: DocumentSource> DocumentConnector<S> {
    pub fn new(source: S, internal_domains: Vec<String>) -> Self {
        Self {
            source,
            internal_domains,
        }
    }
}

#[async_trait]
impl<S: DocumentSource> Connector for DocumentConnector<S> {
    fn name(&self) -> &'static str {
        DOCUMENTS
    }

    async fn fetch_since(
        &self,
        watermarks: &WatermarkSet,
        sink: &dyn RecordSink,
    ) -> Result<FetchOutcome, PartialSync> {
        let since = watermarks.cursor(SUB_SOURCE);
        let mut files = self
            .source
            .changed_files(since.map(|c| c.modified_at))
            .await
            .map_err(ConnectorError::Upstream)?;
        files.sort_by_key(DocumentMeta::cursor);
        files.retain(|f| since.is_none_or(|s| &f.cursor() > s));

        let mut items = Vec::with_capacity(files.len());
        let mut export_failure = None;
        for file in files {
            match self.source.export_text(&file.id).await {
                Ok(Some(text)) => items.push(Fetched::Record(ContextRecord {
                    source_kind: SourceKind::Document,
                    visibility: Visibility::for_address(
                        file.owner_email.as_deref(),
                        &self.internal_domains,
                    ),
                    source_id: file.id,
                    title: file.name,
                    body_text: text,
                    author: file.owner,
                    author_address: file.owner_email,
                    modified_at: file.modified_at,
                })),
                Ok(None) => items.push(Fetched::Discarded(file.cursor())),
                Err(e) => {
                    export_failure =
                        Some(ConnectorError::Upstream(e.context(format!("export {}", file.id))));
                    break;
                }
            }
        }

        let mut outcome = FetchOutcome::default();
        if let Err(source) =
            materialize_in_order(DOCUMENTS, SUB_SOURCE, since, items, sink, &mut outcome).await
        {
            return Err(PartialSync {
                committed: outcome,
                source,
            });
        }
        match export_failure {
            Some(source) => Err(PartialSync {
                committed: outcome,
                source,
            }),
            None => Ok(outcome),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DbHandle, EnhancerDb};
    use chrono::TimeZone;
    use std::sync::Mutex;

    struct FakeDrive {
        files: Vec<DocumentMeta>,
        fail_export: Mutex<Option<String>>,
        exports: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DocumentSource for FakeDrive {
        async fn changed_files(&self, since: Option<DateTime<Utc>>) -> anyhow::Result<Vec<DocumentMeta>> {
            Ok(self
                .files
                .iter()
                .filter(|f| since.is_none_or(|s| f.modified_at >= s))
                .cloned()
                .collect())
        }

        async fn export_text(&self, file_id: &str) -> anyhow::Result<Option<String>> {
            self.exports.lock().unwrap().push(file_id.to_string());
            if self.fail_export.lock().unwrap().as_deref() == Some(file_id) {
                anyhow::bail!("503 backend error");
            }
            if file_id.starts_with("img") {
                return Ok(None);
            }
            Ok(Some(format!("contents of {}", file_id)))
        }
    }

    fn file(id: &str, minute: u32) -> DocumentMeta {
        DocumentMeta {
            id: id.into(),
            name: format!("{}.gdoc", id),
            owner: "Owner".into(),
            owner_email: Some("owner@acme.io".into()),
            modified_at: Utc.with_ymd_and_hms(2024, 4, 1, 8, minute, 0).unwrap(),
        }
    }

    fn drive(fail: Option<&str>) -> FakeDrive {
        FakeDrive {
            files: (1..=5).map(|i| file(&format!("doc{}", i), i)).collect(),
            fail_export: Mutex::new(fail.map(String::from)),
            exports: Mutex::new(Vec::new()),
        }
    }

    #[tokio::test]
    async fn failure_at_k_then_rerun_completes_without_duplicates() {
        let db = DbHandle::new(EnhancerDb::new_in_memory().unwrap());

        let failing = DocumentConnector::new(drive(Some("doc3")), vec![]);
        let err = failing.fetch_since(&WatermarkSet::new(), &db).await.unwrap_err();
        assert_eq!(err.committed.written, 2);
        assert_eq!(err.committed.advanced[0].cursor, file("doc2", 2).cursor());

        let marks: WatermarkSet = err.committed.advanced.into_iter().collect();
        let healthy = DocumentConnector::new(drive(None), vec![]);
        let outcome = healthy.fetch_since(&marks, &db).await.unwrap();
        assert_eq!(outcome.written, 3);
        assert_eq!(outcome.unchanged, 0);
        assert_eq!(
            *healthy.source.exports.lock().unwrap(),
            vec!["doc3", "doc4", "doc5"],
            "already-synced files are not re-exported"
        );

        let stats = db.call(|db| db.corpus_stats()).await.unwrap();
        assert_eq!(stats.document, 5);
    }

    #[tokio::test]
    async fn files_without_text_are_discarded_but_advance_the_cursor() {
        let db = DbHandle::new(EnhancerDb::new_in_memory().unwrap());
        let mut source = drive(None);
        source.files = vec![file("doc1", 1), file("img2", 2)];
        let connector = DocumentConnector::new(source, vec![]);

        let outcome = connector.fetch_since(&WatermarkSet::new(), &db).await.unwrap();
        assert_eq!(outcome.written, 1);
        assert_eq!(outcome.discarded, 1);
        assert_eq!(outcome.advanced[0].cursor, file("img2", 2).cursor());
    }
}
