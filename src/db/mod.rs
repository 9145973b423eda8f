pub mod schema;

use crate::error::SyncError;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;

pub type SqlitePool = Pool<Sqlite>;

/// Open (creating if missing) the engine database and apply the bundled DDL.
/// An in-memory database is pinned to a single pooled connection, otherwise
/// every checkout would see a fresh empty database.
pub async fn connect(database_url: &str) -> Result<SqlitePool, SyncError> {
    let connect_opts = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(connect_opts)
        .await?;
    init_schema(&pool).await?;
    Ok(pool)
}

/// Execute the DDL statement by statement (SQLite accepts multi-command
/// scripts but sqlx::query does not).
pub async fn init_schema(pool: &SqlitePool) -> Result<(), SyncError> {
    for stmt in schema::SQLITE_INIT.split(';') {
        let s = stmt.trim();
        if s.is_empty() {
            continue;
        }
        sqlx::query(s).execute(pool).await?;
    }
    Ok(())
}
