use crate::connector::NormalizedRecord;
use crate::db::SqlitePool;
use crate::error::SyncError;
use chrono::Utc;
use tracing::debug;

/// Idempotent persistence of normalized records: full-payload replace on
/// conflict-key collision, in bounded ordered batches with one transaction
/// per batch. There is deliberately no transaction across batches; a failed
/// batch aborts the rest of the call but never unwinds committed ones.
#[derive(Clone)]
pub struct UpsertSink {
    pool: SqlitePool,
    batch_size: usize,
}

impl UpsertSink {
    pub fn new(pool: SqlitePool, batch_size: usize) -> Self {
        Self {
            pool,
            batch_size: batch_size.max(1),
        }
    }

    /// Destination tables hold the conflict key, the opaque payload, and the
    /// sync timestamp; provider adapters needing typed columns migrate their
    /// own tables and skip this helper.
    pub async fn ensure_table(&self, table: &str, conflict_key: &str) -> Result<(), SyncError> {
        validate_identifier(table)?;
        validate_identifier(conflict_key)?;
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {table} (\
             {conflict_key} TEXT PRIMARY KEY, \
             payload TEXT NOT NULL, \
             synced_at TEXT NOT NULL)"
        );
        sqlx::query(&ddl).execute(&self.pool).await?;
        Ok(())
    }

    /// Returns the number of rows written. Empty input performs no I/O.
    pub async fn upsert(
        &self,
        table: &str,
        records: &[NormalizedRecord],
        conflict_key: &str,
    ) -> Result<u64, SyncError> {
        if records.is_empty() {
            return Ok(0);
        }
        validate_identifier(table)?;
        validate_identifier(conflict_key)?;

        let sql = format!(
            "INSERT INTO {table} ({conflict_key}, payload, synced_at) \
             VALUES (?, ?, ?) \
             ON CONFLICT({conflict_key}) DO UPDATE SET \
             payload = excluded.payload, \
             synced_at = excluded.synced_at"
        );

        let mut committed: u64 = 0;
        for batch in records.chunks(self.batch_size) {
            let synced_at = Utc::now().to_rfc3339();
            let mut tx = self.pool.begin().await?;
            for record in batch {
                sqlx::query(&sql)
                    .bind(&record.natural_id)
                    .bind(record.payload.to_string())
                    .bind(&synced_at)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| SyncError::UpsertFailed {
                        table: table.to_string(),
                        committed,
                        source: e,
                    })?;
            }
            tx.commit().await.map_err(|e| SyncError::UpsertFailed {
                table: table.to_string(),
                committed,
                source: e,
            })?;
            committed += batch.len() as u64;
            debug!(table = %table, committed, "batch committed");
        }
        Ok(committed)
    }

    pub async fn count(&self, table: &str) -> Result<i64, SyncError> {
        validate_identifier(table)?;
        let row: (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }
}

/// Table and column names are interpolated into SQL, so anything beyond
/// `[A-Za-z_][A-Za-z0-9_]*` is rejected outright.
fn validate_identifier(name: &str) -> Result<(), SyncError> {
    let mut chars = name.chars();
    let head_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if head_ok && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(SyncError::InvalidIdentifier(name.to_string()))
    }
}
