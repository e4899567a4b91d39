//! Versioned, idempotent schema migrations (§4.1).
//!
//! Each entry is applied at most once, tracked in `schema_migrations`.
//! Migrations never run backwards — a stored version higher than the
//! binary knows about is a `StorageCorrupt` regression, not silently ignored.

use rusqlite::Connection;

const MIGRATIONS: &[(i64, &str)] = &[
    (
        1,
        "CREATE TABLE IF NOT EXISTS kv_store (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
         );",
    ),
    (
        2,
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            execution_id TEXT NOT NULL,
            session_id TEXT NOT NULL,
            stream_event_type TEXT NOT NULL,
            payload_json TEXT NOT NULL,
            timestamp_ms INTEGER NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_events_execution_id ON events(execution_id);
         CREATE INDEX IF NOT EXISTS idx_events_id_execution_id ON events(id, execution_id);
         CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp_ms);",
    ),
    (
        3,
        "CREATE TABLE IF NOT EXISTS execution_leases (
            execution_id TEXT PRIMARY KEY,
            lease_id TEXT NOT NULL,
            expires_at_ms INTEGER NOT NULL,
            message_id TEXT
         );
         CREATE INDEX IF NOT EXISTS idx_execution_leases_expiry ON execution_leases(expires_at_ms);",
    ),
    (
        4,
        "CREATE TABLE IF NOT EXISTS command_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL,
            execution_id TEXT NOT NULL,
            message_json TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_command_queue_session_id ON command_queue(session_id);",
    ),
    (
        5,
        "CREATE TABLE IF NOT EXISTS executions (
            execution_id TEXT PRIMARY KEY,
            mode TEXT NOT NULL,
            status TEXT NOT NULL,
            started_at_ms INTEGER NOT NULL,
            last_heartbeat_ms INTEGER,
            completed_at_ms INTEGER,
            error TEXT,
            ingest_token TEXT NOT NULL,
            process_id TEXT
         );",
    ),
];

pub fn run_migrations(conn: &mut Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (version INTEGER PRIMARY KEY);",
    )?;

    let current: i64 = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get(0)
        })
        .unwrap_or(0);

    let tx = conn.transaction()?;
    for (version, sql) in MIGRATIONS {
        if *version <= current {
            continue;
        }
        tx.execute_batch(sql)?;
        tx.execute("INSERT INTO schema_migrations (version) VALUES (?1)", [version])?;
    }
    tx.commit()
}
