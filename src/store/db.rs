use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use enhancer_common::{
    ContextRecord, Cursor, RecordSink, SourceKind, SyncWatermark, Visibility, WatermarkSet,
};
use rusqlite::{Connection, OptionalExtension, params};

const LAST_SYNC_KEY: &str = "last_sync_at";

/// Async-safe handle to the enhancer database.
///
/// Wraps `EnhancerDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<EnhancerDb>>,
}

impl DbHandle {
    pub fn new(db: EnhancerDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&EnhancerDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

#[async_trait]
impl RecordSink for DbHandle {
    async fn write(&self, record: &ContextRecord) -> Result<bool> {
        let record = record.clone();
        self.call(move |db| db.insert_record(&record)).await
    }
}

/// Per-kind counts for status output.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct CorpusStats {
    pub chat: usize,
    pub document: usize,
    pub email: usize,
}

pub struct EnhancerDb {
    conn: Connection,
}

impl EnhancerDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Open the database, moving an unreadable file aside and starting fresh.
    ///
    /// Sync state is recoverable by re-syncing, so a damaged file degrades to
    /// "never synced" instead of blocking startup.
    pub fn open_or_recover(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        match Self::new(path) {
            Ok(db) => Ok(db),
            Err(e) if path.exists() => {
                let aside = quarantine_path(path);
                tracing::warn!(
                    path = %path.display(),
                    moved_to = %aside.display(),
                    error = %format!("{:#}", e),
                    "Database unreadable; moving it aside and starting fresh"
                );
                std::fs::rename(path, &aside).with_context(|| {
                    format!("Failed to move corrupt database to {}", aside.display())
                })?;
                Self::new(path)
            }
            Err(e) => Err(e),
        }
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        // Touch the schema first: a garbage file fails here rather than later.
        self.conn
            .query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| {
                row.get::<_, i64>(0)
            })
            .context("Database file is not readable")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS sync_watermarks (
                    connector_id TEXT NOT NULL,
                    sub_source TEXT NOT NULL,
                    cursor TEXT NOT NULL,
                    last_success_at TEXT NOT NULL,
                    PRIMARY KEY (connector_id, sub_source)
                );

                CREATE TABLE IF NOT EXISTS context_records (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    source_kind TEXT NOT NULL,
                    source_id TEXT NOT NULL,
                    title TEXT NOT NULL,
                    body_text TEXT NOT NULL,
                    author TEXT NOT NULL DEFAULT '',
                    author_address TEXT,
                    visibility TEXT NOT NULL,
                    modified_at TEXT NOT NULL,
                    synced_at TEXT NOT NULL DEFAULT (datetime('now')),
                    UNIQUE(source_kind, source_id, modified_at)
                );

                CREATE TABLE IF NOT EXISTS settings (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_records_source
                    ON context_records(source_kind, source_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Watermarks ────────────────────────────────────────────────────

    /// Load every watermark for a connector. Rows whose cursor cannot be
    /// decoded are skipped, which makes that sub-source "never synced".
    pub fn load_watermarks(&self, connector_id: &str) -> Result<WatermarkSet> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT sub_source, cursor, last_success_at FROM sync_watermarks
                 WHERE connector_id = ?1",
            )
            .context("Failed to prepare load_watermarks")?;
        let rows = stmt
            .query_map(params![connector_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .context("Failed to query watermarks")?;

        let mut set = WatermarkSet::new();
        for row in rows {
            let (sub_source, raw_cursor, raw_success) = row.context("Failed to read watermark row")?;
            let Some(cursor) = Cursor::decode(&raw_cursor) else {
                tracing::warn!(
                    connector = connector_id,
                    sub_source = %sub_source,
                    "Ignoring unreadable watermark; sub-source will resync from scratch"
                );
                continue;
            };
            let last_success_at = parse_timestamp(&raw_success).unwrap_or_else(Utc::now);
            set.insert(SyncWatermark {
                connector_id: connector_id.to_string(),
                sub_source,
                cursor,
                last_success_at,
            });
        }
        Ok(set)
    }

    /// Persist watermarks, never moving one backwards.
    ///
    /// Returns how many rows actually advanced.
    pub fn commit_watermarks(&self, watermarks: &[SyncWatermark]) -> Result<usize> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin watermark transaction")?;
        let mut advanced = 0;
        for w in watermarks {
            let existing: Option<String> = tx
                .query_row(
                    "SELECT cursor FROM sync_watermarks WHERE connector_id = ?1 AND sub_source = ?2",
                    params![w.connector_id, w.sub_source],
                    |row| row.get(0),
                )
                .optional()
                .context("Failed to read current watermark")?;
            let current = existing.as_deref().and_then(Cursor::decode);
            if current.as_ref().is_some_and(|c| c >= &w.cursor) {
                continue;
            }
            tx.execute(
                "INSERT INTO sync_watermarks (connector_id, sub_source, cursor, last_success_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(connector_id, sub_source) DO UPDATE SET
                    cursor = excluded.cursor,
                    last_success_at = excluded.last_success_at",
                params![
                    w.connector_id,
                    w.sub_source,
                    w.cursor.encode(),
                    format_timestamp(&w.last_success_at)
                ],
            )
            .context("Failed to upsert watermark")?;
            advanced += 1;
        }
        tx.commit().context("Failed to commit watermarks")?;
        Ok(advanced)
    }

    /// All watermarks grouped by connector, for status reporting.
    pub fn all_watermarks(&self) -> Result<BTreeMap<String, Vec<SyncWatermark>>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT connector_id FROM sync_watermarks ORDER BY connector_id")
            .context("Failed to prepare all_watermarks")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .context("Failed to query connector ids")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read connector id")?;

        let mut out = BTreeMap::new();
        for id in ids {
            let set = self.load_watermarks(&id)?;
            out.insert(id, set.iter().cloned().collect());
        }
        Ok(out)
    }

    // ── Corpus ────────────────────────────────────────────────────────

    /// Store a record version. Returns `false` when this exact version
    /// (kind, id, modified_at) is already present.
    pub fn insert_record(&self, record: &ContextRecord) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO context_records
                    (source_kind, source_id, title, body_text, author, author_address, visibility, modified_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.source_kind.as_str(),
                    record.source_id,
                    record.title,
                    record.body_text,
                    record.author,
                    record.author_address,
                    record.visibility.as_str(),
                    format_timestamp(&record.modified_at),
                ],
            )
            .context("Failed to insert context record")?;
        Ok(changed > 0)
    }

    /// The newest version of every record in the corpus. Superseded versions
    /// are never returned.
    pub fn latest_records(&self) -> Result<Vec<ContextRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT source_kind, source_id, title, body_text, author, author_address, visibility, modified_at
                 FROM context_records r
                 WHERE modified_at = (
                    SELECT MAX(modified_at) FROM context_records
                    WHERE source_kind = r.source_kind AND source_id = r.source_id
                 )
                 ORDER BY source_kind, source_id",
            )
            .context("Failed to prepare latest_records")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(RecordRow {
                    source_kind: row.get(0)?,
                    source_id: row.get(1)?,
                    title: row.get(2)?,
                    body_text: row.get(3)?,
                    author: row.get(4)?,
                    author_address: row.get(5)?,
                    visibility: row.get(6)?,
                    modified_at: row.get(7)?,
                })
            })
            .context("Failed to query records")?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row.context("Failed to read record row")?.into_record()?);
        }
        Ok(records)
    }

    /// Distinct email addresses of chat authors. Feeds the email allow-list.
    pub fn chat_author_addresses(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT DISTINCT lower(author_address) FROM context_records
                 WHERE source_kind = 'chat' AND author_address IS NOT NULL AND author_address != ''
                 ORDER BY 1",
            )
            .context("Failed to prepare chat_author_addresses")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .context("Failed to query chat authors")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("Failed to read chat author")?);
        }
        Ok(out)
    }

    pub fn corpus_stats(&self) -> Result<CorpusStats> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT source_kind, COUNT(DISTINCT source_id) FROM context_records GROUP BY source_kind",
            )
            .context("Failed to prepare corpus_stats")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .context("Failed to query corpus stats")?;
        let mut stats = CorpusStats::default();
        for row in rows {
            let (kind, count) = row.context("Failed to read corpus stats")?;
            let count = count as usize;
            match SourceKind::from_str(&kind) {
                Ok(SourceKind::Chat) => stats.chat = count,
                Ok(SourceKind::Document) => stats.document = count,
                Ok(SourceKind::Email) => stats.email = count,
                Err(_) => {}
            }
        }
        Ok(stats)
    }

    // ── Settings ──────────────────────────────────────────────────────

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .context("Failed to query setting")
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = datetime('now')",
                params![key, value],
            )
            .context("Failed to upsert setting")?;
        Ok(())
    }

    /// When the last full sync pass finished. Unparseable values read as never.
    pub fn last_sync_at(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .get_setting(LAST_SYNC_KEY)?
            .as_deref()
            .and_then(parse_timestamp))
    }

    pub fn set_last_sync_at(&self, at: DateTime<Utc>) -> Result<()> {
        self.set_setting(LAST_SYNC_KEY, &format_timestamp(&at))
    }
}

struct RecordRow {
    source_kind: String,
    source_id: String,
    title: String,
    body_text: String,
    author: String,
    author_address: Option<String>,
    visibility: String,
    modified_at: String,
}

impl RecordRow {
    fn into_record(self) -> Result<ContextRecord> {
        Ok(ContextRecord {
            source_kind: SourceKind::from_str(&self.source_kind).map_err(|e| anyhow::anyhow!(e))?,
            visibility: Visibility::from_str(&self.visibility).map_err(|e| anyhow::anyhow!(e))?,
            modified_at: parse_timestamp(&self.modified_at).with_context(|| {
                format!("Invalid modified_at '{}' for {}", self.modified_at, self.source_id)
            })?,
            source_id: self.source_id,
            title: self.title,
            body_text: self.body_text,
            author: self.author,
            author_address: self.author_address,
        })
    }
}

/// Fixed-width UTC form, so lexical order matches time order in SQL.
fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn quarantine_path(path: &Path) -> PathBuf {
    let stamp = Utc::now().format("%Y%m%d%H%M%S");
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".corrupt-{}", stamp));
    path.with_file_name(name)
}

// ── Tests ─────────────────────────────────────────────────────────────
