//! SQL DDL for the engine's own tables.
//! SQLite-first design; can be adapted for other RDBMS.

/// Engine schema:
/// - `service_credentials`: one encrypted bundle per service, merged on
///   refresh (never auto-deleted).
/// - `sync_state`: per service x stream watermark, advanced monotonically.
/// - `sync_log`: one row per run for observability.
///
/// Destination tables for synced records are created on demand by the sink.
pub const SQLITE_INIT: &str = r#"
CREATE TABLE IF NOT EXISTS service_credentials (
    service TEXT PRIMARY KEY,
    scheme TEXT NOT NULL,
    secret BLOB NOT NULL, -- 12-byte nonce then AES-256-GCM ciphertext of the JSON field map
    expires_at TEXT NULL, -- RFC3339
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sync_state (
    service TEXT NOT NULL,
    stream TEXT NOT NULL,
    last_synced_at TEXT NULL,
    last_record_at TEXT NULL,
    last_record_id TEXT NULL,
    PRIMARY KEY (service, stream)
);

CREATE TABLE IF NOT EXISTS sync_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    service TEXT NOT NULL,
    stream TEXT NOT NULL,
    mode TEXT NOT NULL,
    query_from TEXT NULL,
    query_to TEXT NULL,
    status TEXT NOT NULL,
    records_fetched INTEGER NOT NULL DEFAULT 0,
    records_upserted INTEGER NOT NULL DEFAULT 0,
    api_calls INTEGER NOT NULL DEFAULT 0,
    error_message TEXT NULL,
    started_at TEXT NOT NULL,
    elapsed_ms INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_sync_log_service ON sync_log(service, stream)
"#;
