use crate::db::SqlitePool;
use crate::error::SyncError;
use chrono::{DateTime, NaiveTime, TimeDelta, Utc};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use tracing::debug;

/// Per service x stream incremental-sync marker.
#[derive(Debug, Clone, Default)]
pub struct Watermark {
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_record_at: Option<DateTime<Utc>>,
    pub last_record_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Incremental,
    Full,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Incremental => "incremental",
            SyncMode::Full => "full",
        }
    }
}

/// The range a run should cover, derived from the stored watermark.
#[derive(Debug, Clone, Copy)]
pub struct SyncWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub mode: SyncMode,
    pub initial: bool,
}

/// Watermark-derivation knobs carried by each connector.
#[derive(Debug, Clone, Copy)]
pub struct WindowOptions {
    /// Days fetched on first sync or forced full refresh.
    pub default_days: i64,
    /// Overlap re-fetched behind the watermark; upserts make it harmless.
    pub margin_days: i64,
}

impl Default for WindowOptions {
    fn default() -> Self {
        Self {
            default_days: 7,
            margin_days: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    Partial,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
        }
    }
}

/// One `sync_log` row.
#[derive(Debug, Clone)]
pub struct SyncLogEntry {
    pub service: String,
    pub stream: String,
    pub mode: SyncMode,
    pub query_from: Option<DateTime<Utc>>,
    pub query_to: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub records_fetched: u64,
    pub records_upserted: u64,
    pub api_calls: u64,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: i64,
}

/// Watermark and run-log persistence. Watermarks never regress and are
/// advanced only after the covering data is durably committed.
#[derive(Clone)]
pub struct SyncStateStore {
    pool: SqlitePool,
}

impl SyncStateStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, service: &str, stream: &str) -> Result<Option<Watermark>, SyncError> {
        let row = sqlx::query(
            r#"SELECT last_synced_at, last_record_at, last_record_id
               FROM sync_state WHERE service = ? AND stream = ?"#,
        )
        .bind(service)
        .bind(stream)
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_watermark).transpose()
    }

    /// Derive the query window for the next run. Incremental mode starts
    /// `margin_days` behind the watermark; first syncs and forced refreshes
    /// reach `default_days` back. The end is tomorrow's midnight so that
    /// date-granular providers include today.
    pub async fn next_window(
        &self,
        service: &str,
        stream: &str,
        opts: WindowOptions,
        force_full: bool,
    ) -> Result<SyncWindow, SyncError> {
        let state = self.get(service, stream).await?;
        let last_record_at = state.as_ref().and_then(|s| s.last_record_at);

        let now = Utc::now();
        let end = floor_to_day(now + TimeDelta::days(1));

        let (start, mode, initial) = match (last_record_at, force_full) {
            (Some(mark), false) => (
                floor_to_day(mark - TimeDelta::days(opts.margin_days.max(0))),
                SyncMode::Incremental,
                false,
            ),
            (mark, _) => (
                floor_to_day(now - TimeDelta::days(opts.default_days.max(1))),
                SyncMode::Full,
                mark.is_none(),
            ),
        };

        Ok(SyncWindow {
            start,
            end,
            mode,
            initial,
        })
    }

    /// Persist `max(previous, observed)`; the record id is only replaced
    /// when the mark actually moves forward.
    pub async fn advance(
        &self,
        service: &str,
        stream: &str,
        observed: DateTime<Utc>,
        record_id: Option<&str>,
    ) -> Result<(), SyncError> {
        let current = self.get(service, stream).await?;
        let previous = current.as_ref().and_then(|c| c.last_record_at);

        let (mark, id) = match previous {
            Some(prev) if prev >= observed => (
                prev,
                current.as_ref().and_then(|c| c.last_record_id.clone()),
            ),
            _ => (observed, record_id.map(str::to_string)),
        };

        sqlx::query(
            r#"
            INSERT INTO sync_state (service, stream, last_synced_at, last_record_at, last_record_id)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(service, stream) DO UPDATE SET
                last_synced_at=excluded.last_synced_at,
                last_record_at=excluded.last_record_at,
                last_record_id=excluded.last_record_id
            "#,
        )
        .bind(service)
        .bind(stream)
        .bind(Utc::now().to_rfc3339())
        .bind(mark.to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        debug!(service = %service, stream = %stream, mark = %mark, "watermark advanced");
        Ok(())
    }

    /// Record that a run happened without moving the record watermark (a run
    /// that fetched nothing new).
    pub async fn touch(&self, service: &str, stream: &str) -> Result<(), SyncError> {
        sqlx::query(
            r#"
            INSERT INTO sync_state (service, stream, last_synced_at)
            VALUES (?, ?, ?)
            ON CONFLICT(service, stream) DO UPDATE SET
                last_synced_at=excluded.last_synced_at
            "#,
        )
        .bind(service)
        .bind(stream)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn log_run(&self, entry: &SyncLogEntry) -> Result<i64, SyncError> {
        let result = sqlx::query(
            r#"
            INSERT INTO sync_log (
                service, stream, mode, query_from, query_to, status,
                records_fetched, records_upserted, api_calls,
                error_message, started_at, elapsed_ms
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.service)
        .bind(&entry.stream)
        .bind(entry.mode.as_str())
        .bind(entry.query_from.map(|t| t.to_rfc3339()))
        .bind(entry.query_to.map(|t| t.to_rfc3339()))
        .bind(entry.status.as_str())
        .bind(entry.records_fetched as i64)
        .bind(entry.records_upserted as i64)
        .bind(entry.api_calls as i64)
        .bind(&entry.error_message)
        .bind(entry.started_at.to_rfc3339())
        .bind(entry.elapsed_ms)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }
}

fn floor_to_day(t: DateTime<Utc>) -> DateTime<Utc> {
    t.date_naive().and_time(NaiveTime::MIN).and_utc()
}

fn row_to_watermark(row: SqliteRow) -> Result<Watermark, SyncError> {
    let last_synced: Option<String> = row.try_get("last_synced_at")?;
    let last_record: Option<String> = row.try_get("last_record_at")?;
    let last_record_id: Option<String> = row.try_get("last_record_id")?;
    Ok(Watermark {
        last_synced_at: last_synced.map(|s| parse_rfc3339(&s)).transpose()?,
        last_record_at: last_record.map(|s| parse_rfc3339(&s)).transpose()?,
        last_record_id,
    })
}

fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>, SyncError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| SyncError::Database(sqlx::Error::Decode(Box::new(e))))
}
