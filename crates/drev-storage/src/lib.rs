//! Record persistence + remote transport utilities for dialog ingestion.

use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use drev_core::{join_violations, split_violations, Direction, IngestedRecord, Metrics, Violation};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{QueryBuilder, Row, Sqlite};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub mod remote;

pub use remote::{
    EntryKind, FtpConfig, FtpConnector, MemoryRemote, RemoteConnector, RemoteEntry, RemoteSession,
    TransportError,
};

pub const CRATE_NAME: &str = "drev-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record `{key}` already ingested for source `{source_id}`")]
    Duplicate { source_id: String, key: String },
    #[error("store rejected write for `{key}`: {message}")]
    Rejected { key: String, message: String },
    #[error("corrupt row {id}: {message}")]
    CorruptRow { id: String, message: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, StoreError::Duplicate { .. })
    }
}

/// Read-side filter used by dashboards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordQuery {
    pub source_id: Option<String>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub status: Option<String>,
    pub violation: Option<Violation>,
    /// Any violation at all.
    #[serde(default)]
    pub violations_only: bool,
    pub limit: Option<u32>,
}

impl RecordQuery {
    pub fn matches(&self, record: &IngestedRecord) -> bool {
        self.source_id
            .as_deref()
            .map_or(true, |s| s == record.source_id)
            && self.from.map_or(true, |d| record.date >= d)
            && self.to.map_or(true, |d| record.date <= d)
            && self.status.as_deref().map_or(true, |s| s == record.status)
            && self.violation.map_or(true, |v| record.has_violation(v))
            && (!self.violations_only || !record.violations.is_empty())
    }
}

/// One finished sync run for one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRunRow {
    pub run_id: Uuid,
    pub source_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: String,
    pub candidates_seen: u64,
    pub written: u64,
    pub skipped: u64,
    pub rejected: u64,
    pub failed: u64,
}

impl SyncRunRow {
    pub const COMPLETED: &'static str = "completed";

    pub fn is_completed(&self) -> bool {
        self.outcome == Self::COMPLETED
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// All idempotency keys already ingested for a source.
    async fn load_keys(&self, source_id: &str) -> Result<HashSet<String>, StoreError>;

    async fn find_by_key(
        &self,
        source_id: &str,
        key: &str,
    ) -> Result<Option<IngestedRecord>, StoreError>;

    /// Inserts one record; a key conflict is reported as [`StoreError::Duplicate`].
    async fn create_record(&self, record: &IngestedRecord) -> Result<(), StoreError>;

    /// Inserts many records, returning the number actually inserted.
    async fn bulk_create(
        &self,
        records: &[IngestedRecord],
        ignore_duplicates: bool,
    ) -> Result<u64, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<IngestedRecord>, StoreError>;

    async fn query(&self, query: &RecordQuery) -> Result<Vec<IngestedRecord>, StoreError>;

    /// Review-workflow status change. Returns false when no record has `id`.
    async fn update_status(&self, id: Uuid, status: &str) -> Result<bool, StoreError>;

    async fn delete_by_date(&self, source_id: &str, date: NaiveDate) -> Result<u64, StoreError>;

    async fn record_run(&self, run: &SyncRunRow) -> Result<(), StoreError>;

    /// Most recent completed run, optionally restricted to one source.
    async fn last_completed_run(
        &self,
        source_id: Option<&str>,
    ) -> Result<Option<SyncRunRow>, StoreError>;

    async fn count_ingested_since(
        &self,
        source_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError>;
}

const CREATE_RECORDS: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    id TEXT PRIMARY KEY,
    source_id TEXT NOT NULL,
    record_key TEXT NOT NULL,
    date TEXT NOT NULL,
    time TEXT NOT NULL,
    phone_number TEXT,
    direction TEXT NOT NULL,
    channel TEXT,
    transcript_text TEXT NOT NULL DEFAULT '',
    summary TEXT NOT NULL DEFAULT '',
    politeness REAL NOT NULL DEFAULT 0,
    friendliness REAL NOT NULL DEFAULT 0,
    rudeness REAL NOT NULL DEFAULT 0,
    manipulativeness REAL NOT NULL DEFAULT 0,
    said_hello INTEGER NOT NULL DEFAULT 1,
    duration_secs REAL,
    quality TEXT,
    sale_occurred INTEGER,
    status TEXT NOT NULL,
    violations TEXT NOT NULL DEFAULT '',
    audio_reference TEXT,
    source_path TEXT NOT NULL,
    ingested_at INTEGER NOT NULL,
    UNIQUE(source_id, record_key)
)
"#;

const CREATE_SYNC_RUNS: &str = r#"
CREATE TABLE IF NOT EXISTS sync_runs (
    run_id TEXT NOT NULL,
    source_id TEXT NOT NULL,
    started_at INTEGER NOT NULL,
    finished_at INTEGER NOT NULL,
    outcome TEXT NOT NULL,
    candidates_seen INTEGER NOT NULL DEFAULT 0,
    written INTEGER NOT NULL DEFAULT 0,
    skipped INTEGER NOT NULL DEFAULT 0,
    rejected INTEGER NOT NULL DEFAULT 0,
    failed INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (run_id, source_id)
)
"#;

const INSERT_RECORD: &str = r#"
INSERT INTO records (
    id, source_id, record_key, date, time, phone_number, direction, channel,
    transcript_text, summary, politeness, friendliness, rudeness, manipulativeness,
    said_hello, duration_secs, quality, sale_occurred, status, violations,
    audio_reference, source_path, ingested_at
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
"#;

const INSERT_RECORD_IGNORE: &str = r#"
INSERT OR IGNORE INTO records (
    id, source_id, record_key, date, time, phone_number, direction, channel,
    transcript_text, summary, politeness, friendliness, rudeness, manipulativeness,
    said_hello, duration_secs, quality, sale_occurred, status, violations,
    audio_reference, source_path, ingested_at
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
"#;

const DATE_FMT: &str = "%Y-%m-%d";
const TIME_FMT: &str = "%H:%M:%S";

/// SQLite-backed record store.
#[derive(Debug, Clone)]
pub struct SqliteRecordStore {
    pool: SqlitePool,
}

impl SqliteRecordStore {
    /// Opens (creating if missing) the database at `database_url`.
    ///
    /// In-memory URLs get a single pinned connection so every query sees the
    /// same database.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        if !in_memory {
            if let Some(parent) = sqlite_file_path(database_url).and_then(|p| p.parent()) {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
        }

        let mut options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            options = options.journal_mode(SqliteJournalMode::Wal);
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options.connect_with(options).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Creates tables and indexes; idempotent.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_RECORDS).execute(&self.pool).await?;
        sqlx::query(CREATE_SYNC_RUNS).execute(&self.pool).await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_date ON records(date)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_status ON records(status)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_sync_runs_finished ON sync_runs(finished_at DESC)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn sqlite_file_path(database_url: &str) -> Option<&Path> {
    let rest = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))?;
    let path = rest.split('?').next().unwrap_or(rest);
    (!path.is_empty()).then(|| Path::new(path))
}

fn bind_record<'q>(
    query: sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    record: &'q IngestedRecord,
) -> sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    query
        .bind(record.id.to_string())
        .bind(&record.source_id)
        .bind(&record.key)
        .bind(record.date.format(DATE_FMT).to_string())
        .bind(record.time.format(TIME_FMT).to_string())
        .bind(&record.phone_number)
        .bind(record.direction.as_str())
        .bind(&record.channel)
        .bind(&record.transcript_text)
        .bind(&record.summary)
        .bind(record.metrics.politeness)
        .bind(record.metrics.friendliness)
        .bind(record.metrics.rudeness)
        .bind(record.metrics.manipulativeness)
        .bind(record.metrics.said_hello)
        .bind(record.metrics.duration_secs)
        .bind(&record.metrics.quality)
        .bind(record.metrics.sale_occurred)
        .bind(&record.status)
        .bind(join_violations(&record.violations))
        .bind(&record.audio_reference)
        .bind(&record.source_path)
        .bind(record.ingested_at.timestamp_millis())
}

fn corrupt(id: &str, message: impl Into<String>) -> StoreError {
    StoreError::CorruptRow {
        id: id.to_string(),
        message: message.into(),
    }
}

fn millis_to_utc(id: &str, millis: i64) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| corrupt(id, format!("bad timestamp {millis}")))
}

fn record_from_row(row: &SqliteRow) -> Result<IngestedRecord, StoreError> {
    let id_text: String = row.try_get("id")?;
    let id = Uuid::parse_str(&id_text).map_err(|e| corrupt(&id_text, e.to_string()))?;
    let date_text: String = row.try_get("date")?;
    let date = NaiveDate::parse_from_str(&date_text, DATE_FMT)
        .map_err(|e| corrupt(&id_text, format!("date `{date_text}`: {e}")))?;
    let time_text: String = row.try_get("time")?;
    let time = NaiveTime::parse_from_str(&time_text, TIME_FMT).unwrap_or(NaiveTime::MIN);
    let direction_text: String = row.try_get("direction")?;
    let violations_text: String = row.try_get("violations")?;
    let ingested_at: i64 = row.try_get("ingested_at")?;

    Ok(IngestedRecord {
        id,
        source_id: row.try_get("source_id")?,
        key: row.try_get("record_key")?,
        date,
        time,
        phone_number: row.try_get("phone_number")?,
        direction: direction_text.parse().unwrap_or(Direction::Unknown),
        channel: row.try_get("channel")?,
        transcript_text: row.try_get("transcript_text")?,
        summary: row.try_get("summary")?,
        metrics: Metrics {
            politeness: row.try_get("politeness")?,
            friendliness: row.try_get("friendliness")?,
            rudeness: row.try_get("rudeness")?,
            manipulativeness: row.try_get("manipulativeness")?,
            said_hello: row.try_get("said_hello")?,
            duration_secs: row.try_get("duration_secs")?,
            quality: row.try_get("quality")?,
            sale_occurred: row.try_get("sale_occurred")?,
        },
        status: row.try_get("status")?,
        violations: split_violations(&violations_text),
        audio_reference: row.try_get("audio_reference")?,
        source_path: row.try_get("source_path")?,
        ingested_at: millis_to_utc(&id_text, ingested_at)?,
    })
}

fn run_from_row(row: &SqliteRow) -> Result<SyncRunRow, StoreError> {
    let run_text: String = row.try_get("run_id")?;
    let run_id = Uuid::parse_str(&run_text).map_err(|e| corrupt(&run_text, e.to_string()))?;
    let count = |column: &str| -> Result<u64, StoreError> {
        let v: i64 = row.try_get(column)?;
        Ok(v.max(0) as u64)
    };
    Ok(SyncRunRow {
        run_id,
        source_id: row.try_get("source_id")?,
        started_at: millis_to_utc(&run_text, row.try_get("started_at")?)?,
        finished_at: millis_to_utc(&run_text, row.try_get("finished_at")?)?,
        outcome: row.try_get("outcome")?,
        candidates_seen: count("candidates_seen")?,
        written: count("written")?,
        skipped: count("skipped")?,
        rejected: count("rejected")?,
        failed: count("failed")?,
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn load_keys(&self, source_id: &str) -> Result<HashSet<String>, StoreError> {
        let keys: Vec<String> =
            sqlx::query_scalar("SELECT record_key FROM records WHERE source_id = ?")
                .bind(source_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(keys.into_iter().collect())
    }

    async fn find_by_key(
        &self,
        source_id: &str,
        key: &str,
    ) -> Result<Option<IngestedRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM records WHERE source_id = ? AND record_key = ?")
            .bind(source_id)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn create_record(&self, record: &IngestedRecord) -> Result<(), StoreError> {
        match bind_record(sqlx::query(INSERT_RECORD), record)
            .execute(&self.pool)
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(StoreError::Duplicate {
                source_id: record.source_id.clone(),
                key: record.key.clone(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    async fn bulk_create(
        &self,
        records: &[IngestedRecord],
        ignore_duplicates: bool,
    ) -> Result<u64, StoreError> {
        let sql = if ignore_duplicates {
            INSERT_RECORD_IGNORE
        } else {
            INSERT_RECORD
        };
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for record in records {
            match bind_record(sqlx::query(sql), record).execute(&mut *tx).await {
                Ok(done) => inserted += done.rows_affected(),
                Err(err) if is_unique_violation(&err) => {
                    return Err(StoreError::Duplicate {
                        source_id: record.source_id.clone(),
                        key: record.key.clone(),
                    })
                }
                Err(err) => return Err(err.into()),
            }
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn get(&self, id: Uuid) -> Result<Option<IngestedRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM records WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn query(&self, query: &RecordQuery) -> Result<Vec<IngestedRecord>, StoreError> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT * FROM records WHERE 1 = 1");
        if let Some(source_id) = &query.source_id {
            builder.push(" AND source_id = ").push_bind(source_id.clone());
        }
        if let Some(from) = query.from {
            builder
                .push(" AND date >= ")
                .push_bind(from.format(DATE_FMT).to_string());
        }
        if let Some(to) = query.to {
            builder
                .push(" AND date <= ")
                .push_bind(to.format(DATE_FMT).to_string());
        }
        if let Some(status) = &query.status {
            builder.push(" AND status = ").push_bind(status.clone());
        }
        if let Some(violation) = query.violation {
            builder
                .push(" AND (',' || violations || ',') LIKE ")
                .push_bind(format!("%,{},%", violation.as_str()));
        }
        if query.violations_only {
            builder.push(" AND violations <> ''");
        }
        builder.push(" ORDER BY date DESC, time DESC");
        if let Some(limit) = query.limit {
            builder.push(" LIMIT ").push_bind(i64::from(limit));
        }

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn update_status(&self, id: Uuid, status: &str) -> Result<bool, StoreError> {
        let done = sqlx::query("UPDATE records SET status = ? WHERE id = ?")
            .bind(status)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }

    async fn delete_by_date(&self, source_id: &str, date: NaiveDate) -> Result<u64, StoreError> {
        let done = sqlx::query("DELETE FROM records WHERE source_id = ? AND date = ?")
            .bind(source_id)
            .bind(date.format(DATE_FMT).to_string())
            .execute(&self.pool)
            .await?;
        debug!(source_id, %date, deleted = done.rows_affected(), "deleted records by date");
        Ok(done.rows_affected())
    }

    async fn record_run(&self, run: &SyncRunRow) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO sync_runs (
                run_id, source_id, started_at, finished_at, outcome,
                candidates_seen, written, skipped, rejected, failed
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(run.run_id.to_string())
        .bind(&run.source_id)
        .bind(run.started_at.timestamp_millis())
        .bind(run.finished_at.timestamp_millis())
        .bind(&run.outcome)
        .bind(run.candidates_seen as i64)
        .bind(run.written as i64)
        .bind(run.skipped as i64)
        .bind(run.rejected as i64)
        .bind(run.failed as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn last_completed_run(
        &self,
        source_id: Option<&str>,
    ) -> Result<Option<SyncRunRow>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM sync_runs
             WHERE outcome = ?
               AND (? IS NULL OR source_id = ?)
             ORDER BY finished_at DESC
             LIMIT 1
            "#,
        )
        .bind(SyncRunRow::COMPLETED)
        .bind(source_id)
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn count_ingested_since(
        &self,
        source_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM records WHERE ingested_at >= ? AND (? IS NULL OR source_id = ?)",
        )
        .bind(since.timestamp_millis())
        .bind(source_id)
        .bind(source_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }
}

/// In-memory store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: RwLock<Vec<IngestedRecord>>,
    runs: RwLock<Vec<SyncRunRow>>,
    rejected_keys: RwLock<HashSet<String>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every write of `key` fail with a non-duplicate error.
    pub fn reject_key(&self, key: impl Into<String>) {
        write_lock(&self.rejected_keys).insert(key.into());
    }

    pub fn len(&self) -> usize {
        read_lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<IngestedRecord> {
        read_lock(&self.records).clone()
    }

    pub fn runs(&self) -> Vec<SyncRunRow> {
        read_lock(&self.runs).clone()
    }

    fn insert(&self, record: &IngestedRecord) -> Result<bool, StoreError> {
        if read_lock(&self.rejected_keys).contains(&record.key) {
            return Err(StoreError::Rejected {
                key: record.key.clone(),
                message: "write rejected".to_string(),
            });
        }
        let mut records = write_lock(&self.records);
        if records
            .iter()
            .any(|r| r.source_id == record.source_id && r.key == record.key)
        {
            return Ok(false);
        }
        records.push(record.clone());
        Ok(true)
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn load_keys(&self, source_id: &str) -> Result<HashSet<String>, StoreError> {
        Ok(read_lock(&self.records)
            .iter()
            .filter(|r| r.source_id == source_id)
            .map(|r| r.key.clone())
            .collect())
    }

    async fn find_by_key(
        &self,
        source_id: &str,
        key: &str,
    ) -> Result<Option<IngestedRecord>, StoreError> {
        Ok(read_lock(&self.records)
            .iter()
            .find(|r| r.source_id == source_id && r.key == key)
            .cloned())
    }

    async fn create_record(&self, record: &IngestedRecord) -> Result<(), StoreError> {
        if self.insert(record)? {
            Ok(())
        } else {
            Err(StoreError::Duplicate {
                source_id: record.source_id.clone(),
                key: record.key.clone(),
            })
        }
    }

    async fn bulk_create(
        &self,
        records: &[IngestedRecord],
        ignore_duplicates: bool,
    ) -> Result<u64, StoreError> {
        let mut inserted = 0;
        for record in records {
            match self.create_record(record).await {
                Ok(()) => inserted += 1,
                Err(err) if err.is_duplicate() && ignore_duplicates => {}
                Err(err) => return Err(err),
            }
        }
        Ok(inserted)
    }

    async fn get(&self, id: Uuid) -> Result<Option<IngestedRecord>, StoreError> {
        Ok(read_lock(&self.records).iter().find(|r| r.id == id).cloned())
    }

    async fn query(&self, query: &RecordQuery) -> Result<Vec<IngestedRecord>, StoreError> {
        let mut rows = read_lock(&self.records)
            .iter()
            .filter(|r| query.matches(r))
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| (b.date, b.time).cmp(&(a.date, a.time)));
        if let Some(limit) = query.limit {
            rows.truncate(limit as usize);
        }
        Ok(rows)
    }

    async fn update_status(&self, id: Uuid, status: &str) -> Result<bool, StoreError> {
        let mut records = write_lock(&self.records);
        match records.iter_mut().find(|r| r.id == id) {
            Some(record) => {
                record.status = status.to_string();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_by_date(&self, source_id: &str, date: NaiveDate) -> Result<u64, StoreError> {
        let mut records = write_lock(&self.records);
        let before = records.len();
        records.retain(|r| !(r.source_id == source_id && r.date == date));
        Ok((before - records.len()) as u64)
    }

    async fn record_run(&self, run: &SyncRunRow) -> Result<(), StoreError> {
        let mut runs = write_lock(&self.runs);
        runs.retain(|r| !(r.run_id == run.run_id && r.source_id == run.source_id));
        runs.push(run.clone());
        Ok(())
    }

    async fn last_completed_run(
        &self,
        source_id: Option<&str>,
    ) -> Result<Option<SyncRunRow>, StoreError> {
        Ok(read_lock(&self.runs)
            .iter()
            .filter(|r| r.is_completed())
            .filter(|r| source_id.map_or(true, |s| s == r.source_id))
            .max_by_key(|r| r.finished_at)
            .cloned())
    }

    async fn count_ingested_since(
        &self,
        source_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        Ok(read_lock(&self.records)
            .iter()
            .filter(|r| r.ingested_at >= since)
            .filter(|r| source_id.map_or(true, |s| s == r.source_id))
            .count() as u64)
    }
}
