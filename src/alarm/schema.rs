//! SQLite DDL for the alarm store.

use rusqlite::{Connection, OptionalExtension};

/// Current schema version stamped into `schema_meta`.
pub(crate) const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Complete DDL for the alarm database.
///
/// Uses `IF NOT EXISTS` throughout so `apply_schema` is idempotent.
pub(crate) const SCHEMA_SQL: &str = r#"
-- Enable WAL mode for concurrent reads during writes.
PRAGMA journal_mode = WAL;

-- Every committed put must survive power loss.
PRAGMA synchronous = FULL;

-- Schema version, bootstrap token and boot epoch.
CREATE TABLE IF NOT EXISTS schema_meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- One row per live alarm id.
CREATE TABLE IF NOT EXISTS alarms (
    id                   INTEGER PRIMARY KEY,
    policy               TEXT NOT NULL,      -- JSON FiringPolicy
    handler              TEXT NOT NULL,      -- hex HandlerToken
    args                 TEXT NOT NULL DEFAULT '[]',
    revision             TEXT NOT NULL,
    armed_epoch          INTEGER,
    last_fired_at        INTEGER,
    reschedule_on_reboot INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_alarms_reboot ON alarms(reschedule_on_reboot);
"#;

/// Apply the full schema to an open connection.
///
/// Seeds the schema version on a fresh database.
pub(crate) fn apply_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', ?1)",
        rusqlite::params![CURRENT_SCHEMA_VERSION.to_string()],
    )?;
    Ok(())
}

/// Read a `schema_meta` value.
pub(crate) fn read_meta(conn: &Connection, key: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM schema_meta WHERE key = ?1",
        rusqlite::params![key],
        |row| row.get(0),
    )
    .optional()
}

/// Upsert a `schema_meta` value.
pub(crate) fn write_meta(conn: &Connection, key: &str, value: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO schema_meta (key, value) VALUES (?1, ?2) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        rusqlite::params![key, value],
    )?;
    Ok(())
}
