//! Durable alarm store.
//!
//! [`AlarmStore`] is the narrow interface the service and dispatcher use.
//! Every mutating call is write-through: when it returns `Ok`, the change
//! is committed and visible after a restart.
//!
//! Backends:
//! - [`SqliteAlarmStore`]: one SQLite database (`alarms.db`), WAL mode with
//!   full sync.
//! - [`MemoryAlarmStore`]: process-local map, for embedding and tests.

use crate::alarm::registry::HandlerToken;
use crate::alarm::schema::{apply_schema, read_meta, write_meta};
use crate::alarm::types::{AlarmArg, AlarmId, AlarmRecord, FiringPolicy};
use crate::error::{AlarmError, Result};
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Database filename within the store directory.
pub const DB_FILENAME: &str = "alarms.db";

const META_BOOTSTRAP_TOKEN: &str = "bootstrap_token";
const META_BOOT_EPOCH: &str = "boot_epoch";

/// Durable id → record mapping plus the small amount of service metadata
/// that must survive restarts.
pub trait AlarmStore: Send + Sync {
    /// Insert or overwrite the record for `record.id`.
    fn put(&self, record: &AlarmRecord) -> Result<()>;

    fn get(&self, id: AlarmId) -> Result<Option<AlarmRecord>>;

    /// Delete the record for `id`. No-op if absent.
    fn remove(&self, id: AlarmId) -> Result<()>;

    /// Delete the record for `id` only if its revision matches.
    /// Returns `true` when a row was removed.
    fn remove_revision(&self, id: AlarmId, revision: &str) -> Result<bool>;

    fn list_all(&self) -> Result<Vec<AlarmRecord>>;

    /// Records whose wake request must be re-armed after a reboot.
    fn list_reschedule_on_reboot(&self) -> Result<Vec<AlarmRecord>> {
        Ok(self
            .list_all()?
            .into_iter()
            .filter(|record| record.policy.reschedule_on_reboot())
            .collect())
    }

    /// Stamp the boot epoch in which the record's wake was armed.
    fn mark_armed(&self, id: AlarmId, epoch: u64) -> Result<()>;

    /// Record a delivered firing, only if `revision` is still stored.
    /// Returns `true` when the record was updated.
    fn mark_fired(&self, id: AlarmId, revision: &str, fired_at_millis: i64) -> Result<bool>;

    fn bootstrap_token(&self) -> Result<Option<HandlerToken>>;

    fn set_bootstrap_token(&self, token: HandlerToken) -> Result<()>;

    /// Last boot epoch recorded by reboot recovery (0 on a fresh store).
    fn boot_epoch(&self) -> Result<u64>;

    fn set_boot_epoch(&self, epoch: u64) -> Result<()>;
}

/// SQLite-backed alarm store.
///
/// Thread-safe via an internal `Mutex<Connection>`. Each call is a single
/// statement, so readers never observe a partially written record.
pub struct SqliteAlarmStore {
    path: Option<PathBuf>,
    conn: Mutex<Connection>,
}

impl SqliteAlarmStore {
    /// Open (or create) `{dir}/alarms.db`.
    pub fn open_in_dir(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Self::open(&dir.join(DB_FILENAME))
    }

    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        apply_schema(&conn)?;
        tracing::debug!("opened alarm store at {}", path.display());
        Ok(Self {
            path: Some(path.to_path_buf()),
            conn: Mutex::new(conn),
        })
    }

    /// Non-durable database, for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        apply_schema(&conn)?;
        Ok(Self {
            path: None,
            conn: Mutex::new(conn),
        })
    }

    /// Database file path, if file-backed.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| AlarmError::PersistenceFailure(format!("store lock poisoned: {e}")))
    }
}

impl AlarmStore for SqliteAlarmStore {
    fn put(&self, record: &AlarmRecord) -> Result<()> {
        let policy = serde_json::to_string(&record.policy)?;
        let args = serde_json::to_string(&record.args)?;
        let armed_epoch = record.armed_epoch.map(epoch_to_sql).transpose()?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO alarms \
             (id, policy, handler, args, revision, armed_epoch, last_fired_at, \
              reschedule_on_reboot) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
             ON CONFLICT(id) DO UPDATE SET \
             policy = excluded.policy, handler = excluded.handler, args = excluded.args, \
             revision = excluded.revision, armed_epoch = excluded.armed_epoch, \
             last_fired_at = excluded.last_fired_at, \
             reschedule_on_reboot = excluded.reschedule_on_reboot",
            params![
                record.id.0,
                policy,
                record.handler.to_string(),
                args,
                record.revision,
                armed_epoch,
                record.last_fired_at_millis,
                record.policy.reschedule_on_reboot(),
            ],
        )?;
        Ok(())
    }

    fn get(&self, id: AlarmId) -> Result<Option<AlarmRecord>> {
        let raw = {
            let conn = self.lock()?;
            conn.query_row(
                "SELECT id, policy, handler, args, revision, armed_epoch, last_fired_at \
                 FROM alarms WHERE id = ?1",
                params![id.0],
                row_to_raw,
            )
            .optional()?
        };
        raw.map(RawAlarmRow::into_record).transpose()
    }

    fn remove(&self, id: AlarmId) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM alarms WHERE id = ?1", params![id.0])?;
        Ok(())
    }

    fn remove_revision(&self, id: AlarmId, revision: &str) -> Result<bool> {
        let conn = self.lock()?;
        let rows = conn.execute(
            "DELETE FROM alarms WHERE id = ?1 AND revision = ?2",
            params![id.0, revision],
        )?;
        Ok(rows > 0)
    }

    fn list_all(&self) -> Result<Vec<AlarmRecord>> {
        self.query_records(
            "SELECT id, policy, handler, args, revision, armed_epoch, last_fired_at FROM alarms ORDER BY id",
        )
    }

    fn list_reschedule_on_reboot(&self) -> Result<Vec<AlarmRecord>> {
        self.query_records(
            "SELECT id, policy, handler, args, revision, armed_epoch, last_fired_at FROM alarms \
             WHERE reschedule_on_reboot = 1 ORDER BY id",
        )
    }

    fn mark_armed(&self, id: AlarmId, epoch: u64) -> Result<()> {
        let epoch = epoch_to_sql(epoch)?;
        let conn = self.lock()?;
        conn.execute(
            "UPDATE alarms SET armed_epoch = ?1 WHERE id = ?2",
            params![epoch, id.0],
        )?;
        Ok(())
    }

    fn mark_fired(&self, id: AlarmId, revision: &str, fired_at_millis: i64) -> Result<bool> {
        let conn = self.lock()?;
        let rows = conn.execute(
            "UPDATE alarms SET last_fired_at = ?1 WHERE id = ?2 AND revision = ?3",
            params![fired_at_millis, id.0, revision],
        )?;
        Ok(rows > 0)
    }

    fn bootstrap_token(&self) -> Result<Option<HandlerToken>> {
        let raw = {
            let conn = self.lock()?;
            read_meta(&conn, META_BOOTSTRAP_TOKEN)?
        };
        raw.map(|hex| HandlerToken::from_hex(&hex)).transpose()
    }

    fn set_bootstrap_token(&self, token: HandlerToken) -> Result<()> {
        let conn = self.lock()?;
        write_meta(&conn, META_BOOTSTRAP_TOKEN, &token.to_string())?;
        Ok(())
    }

    fn boot_epoch(&self) -> Result<u64> {
        let raw = {
            let conn = self.lock()?;
            read_meta(&conn, META_BOOT_EPOCH)?
        };
        match raw {
            Some(value) => value.parse::<u64>().map_err(|e| {
                AlarmError::PersistenceFailure(format!("corrupt boot epoch '{value}': {e}"))
            }),
            None => Ok(0),
        }
    }

    fn set_boot_epoch(&self, epoch: u64) -> Result<()> {
        let conn = self.lock()?;
        write_meta(&conn, META_BOOT_EPOCH, &epoch.to_string())?;
        Ok(())
    }
}

impl SqliteAlarmStore {
    fn query_records(&self, sql: &str) -> Result<Vec<AlarmRecord>> {
        let raws = {
            let conn = self.lock()?;
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map([], row_to_raw)?;
            let mut raws = Vec::new();
            for row in rows {
                raws.push(row?);
            }
            raws
        };
        raws.into_iter().map(RawAlarmRow::into_record).collect()
    }
}

// ---------------------------------------------------------------------------
// Row conversion helpers
// ---------------------------------------------------------------------------

struct RawAlarmRow {
    id: i64,
    policy: String,
    handler: String,
    args: String,
    revision: String,
    armed_epoch: Option<i64>,
    last_fired_at: Option<i64>,
}

impl RawAlarmRow {
    fn into_record(self) -> Result<AlarmRecord> {
        let policy: FiringPolicy = serde_json::from_str(&self.policy).map_err(|e| {
            AlarmError::PersistenceFailure(format!("corrupt policy for alarm {}: {e}", self.id))
        })?;
        let args: Vec<AlarmArg> = serde_json::from_str(&self.args).map_err(|e| {
            AlarmError::PersistenceFailure(format!("corrupt args for alarm {}: {e}", self.id))
        })?;
        let armed_epoch = self
            .armed_epoch
            .map(|epoch| {
                u64::try_from(epoch).map_err(|e| {
                    AlarmError::PersistenceFailure(format!(
                        "corrupt armed epoch for alarm {}: {e}",
                        self.id
                    ))
                })
            })
            .transpose()?;
        Ok(AlarmRecord {
            id: AlarmId(self.id),
            policy,
            handler: HandlerToken::from_hex(&self.handler)?,
            args,
            revision: self.revision,
            armed_epoch,
            last_fired_at_millis: self.last_fired_at,
        })
    }
}

fn row_to_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawAlarmRow> {
    Ok(RawAlarmRow {
        id: row.get(0)?,
        policy: row.get(1)?,
        handler: row.get(2)?,
        args: row.get(3)?,
        revision: row.get(4)?,
        armed_epoch: row.get(5)?,
        last_fired_at: row.get(6)?,
    })
}

fn epoch_to_sql(epoch: u64) -> Result<i64> {
    i64::try_from(epoch)
        .map_err(|e| AlarmError::PersistenceFailure(format!("boot epoch out of range: {e}")))
}

/// In-process alarm store. Not durable across restarts.
#[derive(Default)]
pub struct MemoryAlarmStore {
    inner: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    records: HashMap<AlarmId, AlarmRecord>,
    bootstrap_token: Option<HandlerToken>,
    boot_epoch: u64,
}

impl MemoryAlarmStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>> {
        self.inner
            .lock()
            .map_err(|e| AlarmError::PersistenceFailure(format!("store lock poisoned: {e}")))
    }
}

impl AlarmStore for MemoryAlarmStore {
    fn put(&self, record: &AlarmRecord) -> Result<()> {
        self.lock()?.records.insert(record.id, record.clone());
        Ok(())
    }

    fn get(&self, id: AlarmId) -> Result<Option<AlarmRecord>> {
        Ok(self.lock()?.records.get(&id).cloned())
    }

    fn remove(&self, id: AlarmId) -> Result<()> {
        self.lock()?.records.remove(&id);
        Ok(())
    }

    fn remove_revision(&self, id: AlarmId, revision: &str) -> Result<bool> {
        let mut state = self.lock()?;
        let matches = state
            .records
            .get(&id)
            .is_some_and(|record| record.revision == revision);
        if matches {
            state.records.remove(&id);
        }
        Ok(matches)
    }

    fn list_all(&self) -> Result<Vec<AlarmRecord>> {
        let mut records: Vec<AlarmRecord> = self.lock()?.records.values().cloned().collect();
        records.sort_by_key(|record| record.id);
        Ok(records)
    }

    fn mark_armed(&self, id: AlarmId, epoch: u64) -> Result<()> {
        if let Some(record) = self.lock()?.records.get_mut(&id) {
            record.armed_epoch = Some(epoch);
        }
        Ok(())
    }

    fn mark_fired(&self, id: AlarmId, revision: &str, fired_at_millis: i64) -> Result<bool> {
        let mut state = self.lock()?;
        match state.records.get_mut(&id) {
            Some(record) if record.revision == revision => {
                record.last_fired_at_millis = Some(fired_at_millis);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn bootstrap_token(&self) -> Result<Option<HandlerToken>> {
        Ok(self.lock()?.bootstrap_token)
    }

    fn set_bootstrap_token(&self, token: HandlerToken) -> Result<()> {
        self.lock()?.bootstrap_token = Some(token);
        Ok(())
    }

    fn boot_epoch(&self) -> Result<u64> {
        Ok(self.lock()?.boot_epoch)
    }

    fn set_boot_epoch(&self, epoch: u64) -> Result<()> {
        self.lock()?.boot_epoch = epoch;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::alarm::types::AlarmModifiers;

    fn one_shot(id: i64, at: i64) -> AlarmRecord {
        AlarmRecord::new(
            AlarmId(id),
            FiringPolicy::OneShot {
                fire_at_millis: at,
                modifiers: AlarmModifiers::default().exact(true),
            },
            HandlerToken::derive("test", "h"),
            vec![AlarmArg::Int(id), AlarmArg::Str("x".to_owned())],
        )
    }

    fn periodic(id: i64, reboot: bool) -> AlarmRecord {
        AlarmRecord::new(
            AlarmId(id),
            FiringPolicy::Periodic {
                first_fire_at_millis: 60_000,
                period_millis: 60_000,
                modifiers: AlarmModifiers::default().reschedule_on_reboot(reboot),
            },
            HandlerToken::derive("test", "h"),
            Vec::new(),
        )
    }

    fn exercise_store(store: &dyn AlarmStore) {
        let first = one_shot(5, 1_000);
        store.put(&first).expect("put");
        assert_eq!(store.get(AlarmId(5)).expect("get"), Some(first.clone()));

        // Upsert keeps exactly one record for the id.
        let second = periodic(5, false);
        store.put(&second).expect("overwrite");
        let all = store.list_all().expect("list");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0], second);

        // Stale revision does not delete the replacement.
        assert!(!store.remove_revision(AlarmId(5), &first.revision).expect("cas"));
        assert!(store.remove_revision(AlarmId(5), &second.revision).expect("cas"));
        assert!(store.get(AlarmId(5)).expect("get").is_none());

        // Removing a missing id is a no-op.
        store.remove(AlarmId(99)).expect("remove missing");

        store.put(&periodic(1, true)).expect("put");
        store.put(&periodic(2, false)).expect("put");
        store.put(&one_shot(3, 5)).expect("put");
        let reboot: Vec<AlarmId> = store
            .list_reschedule_on_reboot()
            .expect("reboot list")
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(reboot, vec![AlarmId(1)]);

        let durable = store.get(AlarmId(1)).expect("get").expect("present");
        assert!(store.mark_fired(AlarmId(1), &durable.revision, 120_000).expect("fired"));
        assert!(!store.mark_fired(AlarmId(1), "replaced", 180_000).expect("fired"));
        assert_eq!(
            store.get(AlarmId(1)).expect("get").expect("present").last_fired_at_millis,
            Some(120_000)
        );

        store.mark_armed(AlarmId(1), 7).expect("mark");
        assert_eq!(
            store.get(AlarmId(1)).expect("get").expect("present").armed_epoch,
            Some(7)
        );

        assert!(store.bootstrap_token().expect("token").is_none());
        let token = HandlerToken::derive("test", "boot");
        store.set_bootstrap_token(token).expect("set token");
        assert_eq!(store.bootstrap_token().expect("token"), Some(token));

        assert_eq!(store.boot_epoch().expect("epoch"), 0);
        store.set_boot_epoch(3).expect("set epoch");
        assert_eq!(store.boot_epoch().expect("epoch"), 3);
    }

    #[test]
    fn sqlite_store_contract() {
        let store = SqliteAlarmStore::open_in_memory().expect("open");
        exercise_store(&store);
    }

    #[test]
    fn memory_store_contract() {
        let store = MemoryAlarmStore::new();
        exercise_store(&store);
    }

    #[test]
    fn sqlite_records_survive_reopen() {
        let temp = tempfile::tempdir().expect("tempdir");
        let record = one_shot(1, 1_005_000);
        let token = HandlerToken::derive("test", "boot");
        {
            let store = SqliteAlarmStore::open_in_dir(temp.path()).expect("open");
            store.put(&record).expect("put");
            store.set_bootstrap_token(token).expect("token");
        }

        let reopened = SqliteAlarmStore::open_in_dir(temp.path()).expect("reopen");
        assert_eq!(reopened.get(AlarmId(1)).expect("get"), Some(record));
        assert_eq!(reopened.bootstrap_token().expect("token"), Some(token));
        assert_eq!(
            reopened.path(),
            Some(temp.path().join(DB_FILENAME).as_path())
        );
    }
}
