use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use enhancer_common::{SyncWatermark, WatermarkSet};
use serde::Serialize;

use crate::errors::SyncError;
use crate::store::{CorpusStats, DbHandle};

#[derive(Debug, Clone, Serialize)]
pub struct WatermarkView {
    pub sub_source: String,
    pub cursor: String,
    pub last_success_at: DateTime<Utc>,
}

/// Everything `/sync/status` and `issue-enhancer status` report.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub last_sync_at: Option<DateTime<Utc>>,
    pub watermarks: BTreeMap<String, Vec<WatermarkView>>,
    pub corpus: CorpusStats,
}

/// Persisted sync progress. The orchestrator is its only writer.
#[derive(Clone)]
pub struct SyncStateStore {
    db: DbHandle,
}

impl SyncStateStore {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }

    pub async fn watermarks(&self, connector: &str) -> Result<WatermarkSet, SyncError> {
        let connector = connector.to_string();
        self.db
            .call(move |db| db.load_watermarks(&connector))
            .await
            .map_err(SyncError::State)
    }

    /// Persist advanced watermarks. Returns how many moved forward.
    pub async fn commit(&self, watermarks: Vec<SyncWatermark>) -> Result<usize, SyncError> {
        if watermarks.is_empty() {
            return Ok(0);
        }
        self.db
            .call(move |db| db.commit_watermarks(&watermarks))
            .await
            .map_err(SyncError::State)
    }

    pub async fn last_sync_at(&self) -> Result<Option<DateTime<Utc>>, SyncError> {
        self.db
            .call(|db| db.last_sync_at())
            .await
            .map_err(SyncError::State)
    }

    pub async fn mark_synced(&self, at: DateTime<Utc>) -> Result<(), SyncError> {
        self.db
            .call(move |db| db.set_last_sync_at(at))
            .await
            .map_err(SyncError::State)
    }

    pub async fn status(&self) -> Result<SyncStatus, SyncError> {
        self.db
            .call(|db| {
                let watermarks = db
                    .all_watermarks()?
                    .into_iter()
                    .map(|(connector, marks)| {
                        let views: Vec<WatermarkView> = marks
                            .into_iter()
                            .map(|w| WatermarkView {
                                sub_source: w.sub_source,
                                cursor: w.cursor.encode(),
                                last_success_at: w.last_success_at,
                            })
                            .collect();
                        (connector, views)
                    })
                    .collect();
                Ok(SyncStatus {
                    last_sync_at: db.last_sync_at()?,
                    watermarks,
                    corpus: db.corpus_stats()?,
                })
            })
            .await
            .map_err(SyncError::State)
    }
}
