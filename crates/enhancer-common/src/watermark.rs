use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Position in a sub-source's sync order.
///
/// Ordering is by `modified_at` first, then `source_id`, so two items that
/// share a timestamp still have a strict order and a cursor can sit exactly
/// between them. Upstream APIs are queried with the timestamp (inclusive) and
/// the connector drops everything at or before the cursor locally.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Cursor {
    pub modified_at: DateTime<Utc>,
    pub source_id: String,
}

impl Cursor {
    pub fn new(modified_at: DateTime<Utc>, source_id: &str) -> Self {
        Self {
            modified_at,
            source_id: source_id.to_string(),
        }
    }

    /// Opaque string form persisted by the sync state store.
    pub fn encode(&self) -> String {
        format!(
            "{}|{}",
            self.modified_at.to_rfc3339_opts(SecondsFormat::Micros, true),
            self.source_id
        )
    }

    /// Parse a persisted cursor. Returns `None` for anything malformed so the
    /// caller can fall back to "never synced".
    pub fn decode(raw: &str) -> Option<Self> {
        let (ts, id) = raw.split_once('|')?;
        let modified_at = DateTime::parse_from_rfc3339(ts).ok()?.with_timezone(&Utc);
        Some(Self::new(modified_at, id))
    }
}

/// How far one (connector, sub-source) pair has synced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncWatermark {
    pub connector_id: String,
    pub sub_source: String,
    pub cursor: Cursor,
    pub last_success_at: DateTime<Utc>,
}

impl SyncWatermark {
    pub fn new(connector_id: &str, sub_source: &str, cursor: Cursor) -> Self {
        Self {
            connector_id: connector_id.to_string(),
            sub_source: sub_source.to_string(),
            cursor,
            last_success_at: Utc::now(),
        }
    }
}

/// All watermarks for one connector, keyed by sub-source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WatermarkSet {
    by_sub_source: BTreeMap<String, SyncWatermark>,
}

impl WatermarkSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, watermark: SyncWatermark) {
        self.by_sub_source
            .insert(watermark.sub_source.clone(), watermark);
    }

    pub fn get(&self, sub_source: &str) -> Option<&SyncWatermark> {
        self.by_sub_source.get(sub_source)
    }

    pub fn cursor(&self, sub_source: &str) -> Option<&Cursor> {
        self.get(sub_source).map(|w| &w.cursor)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SyncWatermark> {
        self.by_sub_source.values()
    }

    pub fn len(&self) -> usize {
        self.by_sub_source.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_sub_source.is_empty()
    }
}

impl FromIterator<SyncWatermark> for WatermarkSet {
    fn from_iter<I: IntoIterator<Item = SyncWatermark>>(iter: I) -> Self {
        let mut set = Self::new();
        for w in iter {
            set.insert(w);
        }
        set
    }
}
