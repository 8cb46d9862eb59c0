//! Drives connectors in order and owns watermark commits.
//!
//! Each connector has its own async lock. A sync triggered while another is
//! running for the same connector waits for it and then starts from the
//! watermarks it committed, so two fetches never share a starting watermark.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use enhancer_common::{Connector, FetchOutcome, RecordSink};
use serde::Serialize;
use tokio::sync::Mutex;

use super::state::SyncStateStore;
use crate::errors::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectorReport {
    pub connector: String,
    pub status: ConnectorStatus,
    pub written: usize,
    pub unchanged: usize,
    pub discarded: usize,
    pub watermarks_advanced: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl ConnectorReport {
    fn new(connector: &str, outcome: &FetchOutcome, advanced: usize, started: Instant) -> Self {
        Self {
            connector: connector.to_string(),
            status: ConnectorStatus::Succeeded,
            written: outcome.written,
            unchanged: outcome.unchanged,
            discarded: outcome.discarded,
            watermarks_advanced: advanced,
            error: None,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }

    fn failed(mut self, error: String) -> Self {
        self.status = ConnectorStatus::Failed;
        self.error = Some(error);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub started_at: DateTime<Utc>,
    pub connectors: Vec<ConnectorReport>,
    /// Requested names that matched no enabled connector.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unknown: Vec<String>,
}

impl SyncReport {
    pub fn total_written(&self) -> usize {
        self.connectors.iter().map(|c| c.written).sum()
    }

    pub fn failures(&self) -> impl Iterator<Item = &ConnectorReport> {
        self.connectors
            .iter()
            .filter(|c| c.status == ConnectorStatus::Failed)
    }

    pub fn all_succeeded(&self) -> bool {
        self.failures().next().is_none()
    }
}

pub struct SyncOrchestrator {
    connectors: Vec<Arc<dyn Connector>>,
    locks: HashMap<&'static str, Arc<Mutex<()>>>,
    state: SyncStateStore,
    sink: Arc<dyn RecordSink>,
    interval: Duration,
}

impl SyncOrchestrator {
    /// `connectors` is the execution order.
    pub fn new(
        connectors: Vec<Arc<dyn Connector>>,
        state: SyncStateStore,
        sink: Arc<dyn RecordSink>,
        interval: Duration,
    ) -> Self {
        let locks = connectors
            .iter()
            .map(|c| (c.name(), Arc::new(Mutex::new(()))))
            .collect();
        Self {
            connectors,
            locks,
            state,
            sink,
            interval,
        }
    }

    pub fn connector_names(&self) -> Vec<&'static str> {
        self.connectors.iter().map(|c| c.name()).collect()
    }

    pub fn state(&self) -> &SyncStateStore {
        &self.state
    }

    /// Sync every enabled connector, then record the pass time.
    pub async fn sync_all(&self) -> SyncReport {
        let selected: Vec<_> = self.connectors.iter().collect();
        let report = self.run(selected).await;
        if let Err(e) = self.state.mark_synced(report.started_at).await {
            tracing::error!(error = %e, "Failed to record sync time");
        }
        report
    }

    /// Sync only the named connectors, still in configured order. Unknown
    /// names are reported alongside the known ones; a request naming nothing
    /// known is an error.
    pub async fn sync_subset(&self, names: &[String]) -> Result<SyncReport, SyncError> {
        let unknown: Vec<String> = names
            .iter()
            .filter(|n| !self.locks.contains_key(n.as_str()))
            .cloned()
            .collect();
        let selected: Vec<_> = self
            .connectors
            .iter()
            .filter(|c| names.iter().any(|n| n == c.name()))
            .collect();
        if selected.is_empty() {
            return Err(if unknown.is_empty() {
                SyncError::NothingToSync(names.join(","))
            } else {
                SyncError::UnknownConnector(unknown.join(","))
            });
        }
        for name in &unknown {
            tracing::warn!(connector = %name, "Skipping unknown connector");
        }
        let mut report = self.run(selected).await;
        report.unknown = unknown;
        Ok(report)
    }

    async fn run(&self, selected: Vec<&Arc<dyn Connector>>) -> SyncReport {
        let started_at = Utc::now();
        let mut connectors = Vec::with_capacity(selected.len());
        for connector in selected {
            connectors.push(self.sync_one(connector.as_ref()).await);
        }
        let report = SyncReport {
            started_at,
            connectors,
            unknown: Vec::new(),
        };
        tracing::info!(
            connectors = report.connectors.len(),
            written = report.total_written(),
            failed = report.failures().count(),
            "Sync pass complete"
        );
        report
    }

    async fn sync_one(&self, connector: &dyn Connector) -> ConnectorReport {
        let name = connector.name();
        let started = Instant::now();
        let lock = self.locks.get(name).cloned().unwrap_or_default();
        let _guard = lock.lock().await;

        let watermarks = match self.state.watermarks(name).await {
            Ok(w) => w,
            Err(e) => {
                tracing::error!(connector = name, error = %e, "Could not load watermarks");
                return ConnectorReport::new(name, &FetchOutcome::default(), 0, started)
                    .failed(e.to_string());
            }
        };

        match connector.fetch_since(&watermarks, self.sink.as_ref()).await {
            Ok(outcome) => match self.state.commit(outcome.advanced.clone()).await {
                Ok(advanced) => {
                    tracing::info!(
                        connector = name,
                        written = outcome.written,
                        unchanged = outcome.unchanged,
                        discarded = outcome.discarded,
                        advanced,
                        "Connector synced"
                    );
                    ConnectorReport::new(name, &outcome, advanced, started)
                }
                Err(e) => {
                    tracing::error!(connector = name, error = %e, "Failed to commit watermarks");
                    ConnectorReport::new(name, &outcome, 0, started).failed(e.to_string())
                }
            },
            Err(partial) => {
                // Records in the committed prefix are durable; persisting their
                // watermark keeps the rerun from fetching them again.
                let advanced = match self.state.commit(partial.committed.advanced.clone()).await {
                    Ok(n) => n,
                    Err(e) => {
                        tracing::error!(connector = name, error = %e, "Failed to commit partial watermarks");
                        0
                    }
                };
                tracing::warn!(
                    connector = name,
                    error = %format!("{:#}", anyhow::Error::from(partial.source)),
                    committed = partial.committed.written,
                    advanced,
                    "Connector sync failed; continuing with next connector"
                );
                ConnectorReport::new(name, &partial.committed, advanced, started)
                    .failed(format!("sync failed after {} committed records", partial.committed.written))
            }
        }
    }

    /// Whether the last full pass is older than the sync interval.
    pub async fn needs_sync(&self) -> bool {
        match self.state.last_sync_at().await {
            Ok(Some(at)) => {
                let age = Utc::now().signed_duration_since(at);
                age.to_std().map(|a| a >= self.interval).unwrap_or(false)
            }
            Ok(None) => true,
            Err(e) => {
                tracing::warn!(error = %e, "Could not read last sync time; assuming stale");
                true
            }
        }
    }

    /// Run a full pass only when the corpus is stale.
    pub async fn sync_if_stale(&self) -> Option<SyncReport> {
        if self.connectors.is_empty() || !self.needs_sync().await {
            return None;
        }
        tracing::info!("Corpus is stale; syncing before use");
        Some(self.sync_all().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DbHandle, EnhancerDb};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use enhancer_common::{
        ConnectorError, ContextRecord, Fetched, PartialSync, SourceKind, Visibility, WatermarkSet,
        materialize_in_order,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves a fixed list of records; can fail the k-th write of its next run.
    struct Scripted {
        name: &'static str,
        items: Vec<ContextRecord>,
        fail_at: std::sync::Mutex<Option<usize>>,
        active: AtomicUsize,
        max_active: AtomicUsize,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl Scripted {
        fn new(name: &'static str, n: i64) -> Self {
            let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
            let items = (1..=n)
                .map(|i| ContextRecord {
                    source_kind: SourceKind::Document,
                    source_id: format!("{}-{}", name, i),
                    title: format!("item {}", i),
                    body_text: "body".into(),
                    author: "a".into(),
                    author_address: None,
                    visibility: Visibility::Internal,
                    modified_at: base + chrono::Duration::minutes(i),
                })
                .collect();
            Self {
                name,
                items,
                fail_at: std::sync::Mutex::new(None),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }
    }

    struct FailingSink<'a> {
        inner: &'a dyn RecordSink,
        fail_at: usize,
        seen: AtomicUsize,
    }

    #[async_trait]
    impl RecordSink for FailingSink<'_> {
        async fn write(&self, record: &ContextRecord) -> anyhow::Result<bool> {
            if self.seen.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_at {
                anyhow::bail!("injected write failure");
            }
            self.inner.write(record).await
        }
    }

    #[async_trait]
    impl Connector for Scripted {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn fetch_since(
            &self,
            watermarks: &WatermarkSet,
            sink: &dyn RecordSink,
        ) -> Result<FetchOutcome, PartialSync> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;

            let items = self.items.iter().cloned().map(Fetched::Record).collect();
            let fail_at = self.fail_at.lock().unwrap().take();
            let mut outcome = FetchOutcome::default();
            let result = match fail_at {
                Some(k) => {
                    let failing = FailingSink {
                        inner: sink,
                        fail_at: k,
                        seen: AtomicUsize::new(0),
                    };
                    materialize_in_order(self.name, "all", watermarks.cursor("all"), items, &failing, &mut outcome)
                        .await
                }
                None => {
                    materialize_in_order(self.name, "all", watermarks.cursor("all"), items, sink, &mut outcome)
                        .await
                }
            };
            self.active.fetch_sub(1, Ordering::SeqCst);
            match result {
                Ok(()) => Ok(outcome),
                Err(source) => Err(PartialSync {
                    committed: outcome,
                    source,
                }),
            }
        }
    }

    struct Broken;

    #[async_trait]
    impl Connector for Broken {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn fetch_since(
            &self,
            _watermarks: &WatermarkSet,
            _sink: &dyn RecordSink,
        ) -> Result<FetchOutcome, PartialSync> {
            Err(ConnectorError::Upstream(anyhow::anyhow!("503")).into())
        }
    }

    fn orchestrator(connectors: Vec<Arc<dyn Connector>>) -> (SyncOrchestrator, DbHandle) {
        let db = DbHandle::new(EnhancerDb::new_in_memory().unwrap());
        let orch = SyncOrchestrator::new(
            connectors,
            SyncStateStore::new(db.clone()),
            Arc::new(db.clone()),
            Duration::from_secs(3600),
        );
        (orch, db)
    }

    async fn record_count(db: &DbHandle) -> usize {
        db.call(|db| db.latest_records()).await.unwrap().len()
    }

    #[tokio::test]
    async fn failure_at_k_commits_prefix_and_rerun_completes() {
        let scripted = Arc::new(Scripted::new("docs", 5));
        *scripted.fail_at.lock().unwrap() = Some(3);
        let (orch, db) = orchestrator(vec![scripted.clone()]);

        let first = orch.sync_all().await;
        assert_eq!(first.connectors[0].status, ConnectorStatus::Failed);
        assert_eq!(first.connectors[0].written, 2);
        let marks = orch.state().watermarks("docs").await.unwrap();
        assert_eq!(marks.cursor("all").unwrap().source_id, "docs-2");
        assert_eq!(record_count(&db).await, 2);

        let second = orch.sync_all().await;
        assert!(second.all_succeeded());
        assert_eq!(second.connectors[0].written, 3);
        assert_eq!(second.connectors[0].unchanged, 0, "no record is written twice");
        assert_eq!(record_count(&db).await, 5);
    }

    #[tokio::test]
    async fn unchanged_upstream_resync_is_a_no_op() {
        let scripted = Arc::new(Scripted::new("docs", 3));
        let (orch, db) = orchestrator(vec![scripted]);

        orch.sync_all().await;
        let before = orch.state().watermarks("docs").await.unwrap();
        let again = orch.sync_all().await;

        assert_eq!(again.total_written(), 0);
        assert_eq!(again.connectors[0].watermarks_advanced, 0);
        assert_eq!(orch.state().watermarks("docs").await.unwrap(), before);
        assert_eq!(record_count(&db).await, 3);
    }

    #[tokio::test]
    async fn one_failing_connector_does_not_block_others() {
        let good = Arc::new(Scripted::new("good", 2));
        let (orch, _db) = orchestrator(vec![Arc::new(Broken), good.clone()]);

        let report = orch.sync_all().await;
        assert_eq!(report.connectors[0].status, ConnectorStatus::Failed);
        assert_eq!(report.connectors[1].status, ConnectorStatus::Succeeded);
        assert!(orch.state().watermarks("broken").await.unwrap().is_empty());
        assert_eq!(good.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_syncs_never_overlap_per_connector() {
        let mut scripted = Scripted::new("docs", 3);
        scripted.delay = Duration::from_millis(30);
        let scripted = Arc::new(scripted);
        let (orch, db) = orchestrator(vec![scripted.clone()]);
        let orch = Arc::new(orch);

        let runs = (0..4).map(|_| {
            let orch = orch.clone();
            tokio::spawn(async move { orch.sync_all().await })
        });
        let reports = futures::future::join_all(runs).await;

        assert_eq!(scripted.max_active.load(Ordering::SeqCst), 1);
        let written: usize = reports.into_iter().map(|r| r.unwrap().total_written()).sum();
        assert_eq!(written, 3, "later runs start from the first run's watermark");
        assert_eq!(record_count(&db).await, 3);
    }

    #[tokio::test]
    async fn subset_selection_validates_names() {
        let (orch, _db) = orchestrator(vec![
            Arc::new(Scripted::new("a", 1)),
            Arc::new(Scripted::new("b", 1)),
        ]);

        let report = orch.sync_subset(&["b".to_string()]).await.unwrap();
        assert_eq!(report.connectors.len(), 1);
        assert_eq!(report.connectors[0].connector, "b");
        assert!(report.unknown.is_empty());

        let report = orch
            .sync_subset(&["fax".to_string(), "a".to_string()])
            .await
            .unwrap();
        assert_eq!(report.connectors.len(), 1);
        assert_eq!(report.unknown, vec!["fax".to_string()]);

        assert!(matches!(
            orch.sync_subset(&["fax".to_string()]).await,
            Err(SyncError::UnknownConnector(n)) if n == "fax"
        ));
        assert!(matches!(
            orch.sync_subset(&[]).await,
            Err(SyncError::NothingToSync(_))
        ));
    }

    #[tokio::test]
    async fn staleness_follows_last_full_pass() {
        let (orch, db) = orchestrator(vec![Arc::new(Scripted::new("a", 1))]);
        assert!(orch.needs_sync().await);
        assert!(orch.sync_if_stale().await.is_some());
        assert!(!orch.needs_sync().await);
        assert!(orch.sync_if_stale().await.is_none());

        let old = Utc::now() - chrono::Duration::hours(2);
        db.call(move |db| db.set_last_sync_at(old)).await.unwrap();
        assert!(orch.needs_sync().await);
    }
}
