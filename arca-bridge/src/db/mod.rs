//! Persistent state store.
//!
//! One SQLite database holds the durable catalog: containers, networks,
//! attachments, volumes, volume mounts, and the subnet allocator cursor.
//! The connection is owned exclusively by [`StateStore`]; access is
//! serialized behind a mutex and every multi-row operation runs in a
//! transaction. Foreign keys are enforced, so deleting a container or a
//! network cascades to its attachments and mounts.

mod containers;
mod networks;
mod volumes;

pub use containers::ContainerRecord;
pub use networks::{AttachmentRecord, NetworkDriverKind, NetworkRecord};
pub use volumes::{VolumeMountRecord, VolumeRecord};

use arca_shared::constants::subnet;
use arca_shared::{ArcaError, ArcaResult};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::Path;

/// Current schema version. Bump together with a migration arm in
/// `migrate`.
const SCHEMA_VERSION: i64 = 1;

const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS containers (
    id               TEXT PRIMARY KEY,
    name             TEXT NOT NULL UNIQUE,
    image            TEXT NOT NULL,
    image_id         TEXT NOT NULL,
    created_at       TEXT NOT NULL,
    status           TEXT NOT NULL,
    running          INTEGER NOT NULL DEFAULT 0,
    paused           INTEGER NOT NULL DEFAULT 0,
    restarting       INTEGER NOT NULL DEFAULT 0,
    pid              INTEGER,
    exit_code        INTEGER,
    started_at       TEXT,
    finished_at      TEXT,
    stopped_by_user  INTEGER NOT NULL DEFAULT 0,
    config_json      TEXT NOT NULL,
    host_config_json TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_containers_name    ON containers(name);
CREATE INDEX IF NOT EXISTS idx_containers_status  ON containers(status);
CREATE INDEX IF NOT EXISTS idx_containers_image   ON containers(image_id);
CREATE INDEX IF NOT EXISTS idx_containers_running ON containers(running);

CREATE TABLE IF NOT EXISTS networks (
    id           TEXT PRIMARY KEY,
    name         TEXT NOT NULL UNIQUE,
    driver       TEXT NOT NULL,
    scope        TEXT NOT NULL,
    created_at   TEXT NOT NULL,
    subnet       TEXT NOT NULL,
    gateway      TEXT NOT NULL,
    ip_range     TEXT,
    options_json TEXT NOT NULL,
    labels_json  TEXT NOT NULL,
    is_default   INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_networks_name   ON networks(name);
CREATE INDEX IF NOT EXISTS idx_networks_driver ON networks(driver);

CREATE TABLE IF NOT EXISTS network_attachments (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    container_id TEXT NOT NULL REFERENCES containers(id) ON DELETE CASCADE,
    network_id   TEXT NOT NULL REFERENCES networks(id) ON DELETE CASCADE,
    ip           TEXT NOT NULL,
    mac          TEXT NOT NULL,
    aliases_json TEXT NOT NULL,
    attached_at  TEXT NOT NULL,
    UNIQUE(container_id, network_id)
);
CREATE INDEX IF NOT EXISTS idx_attachments_container ON network_attachments(container_id);
CREATE INDEX IF NOT EXISTS idx_attachments_network   ON network_attachments(network_id);

CREATE TABLE IF NOT EXISTS volumes (
    name         TEXT PRIMARY KEY,
    driver       TEXT NOT NULL,
    format       TEXT NOT NULL,
    mountpoint   TEXT NOT NULL,
    created_at   TEXT NOT NULL,
    labels_json  TEXT NOT NULL,
    options_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS volume_mounts (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    container_id   TEXT NOT NULL REFERENCES containers(id) ON DELETE CASCADE,
    volume_name    TEXT NOT NULL REFERENCES volumes(name) ON DELETE CASCADE,
    container_path TEXT NOT NULL,
    is_anonymous   INTEGER NOT NULL DEFAULT 0,
    mounted_at     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS subnet_allocation (
    id               INTEGER PRIMARY KEY CHECK (id = 1),
    next_subnet_byte INTEGER NOT NULL CHECK (next_subnet_byte BETWEEN 18 AND 31)
);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

/// Serialized-access SQLite catalog.
pub struct StateStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore").finish()
    }
}

impl StateStore {
    /// Open (creating if needed) the database at `path` and apply pending
    /// migrations.
    pub fn open(path: &Path) -> ArcaResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ArcaError::Database(format!("failed to create {}: {e}", parent.display()))
            })?;
        }
        let conn = Connection::open(path).map_err(map_sql)?;
        Self::init(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> ArcaResult<Self> {
        let conn = Connection::open_in_memory().map_err(map_sql)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> ArcaResult<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(map_sql)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> ArcaResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(map_sql)?;

        tx.execute_batch(SCHEMA_V1).map_err(map_sql)?;

        let version: Option<i64> = tx
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(map_sql(other)),
            })?;

        match version {
            None => {
                tx.execute(
                    "INSERT INTO schema_version (version) VALUES (?1)",
                    [SCHEMA_VERSION],
                )
                .map_err(map_sql)?;
                tracing::info!(version = SCHEMA_VERSION, "initialized state store schema");
            }
            Some(v) if v == SCHEMA_VERSION => {}
            Some(v) if v < SCHEMA_VERSION => {
                // Future migrations key off `v` here.
                tx.execute("UPDATE schema_version SET version = ?1", [SCHEMA_VERSION])
                    .map_err(map_sql)?;
                tracing::info!(from = v, to = SCHEMA_VERSION, "migrated state store schema");
            }
            Some(v) => {
                return Err(ArcaError::Database(format!(
                    "database schema version {v} is newer than supported {SCHEMA_VERSION}"
                )));
            }
        }

        tx.commit().map_err(map_sql)
    }

    /// Run `f` inside BEGIN/COMMIT, rolling back on error.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> ArcaResult<T>,
    ) -> ArcaResult<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(map_sql)?;
        let value = f(&tx)?;
        tx.commit().map_err(map_sql)?;
        Ok(value)
    }

    /// Run `f` with the raw connection. Internal building block for the
    /// per-table impls.
    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> ArcaResult<T>,
    ) -> ArcaResult<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    // ------------------------------------------------------------------
    // Subnet allocator cursor
    // ------------------------------------------------------------------

    /// Current cursor into the `172.<X>.0.0/16` band, creating the row at
    /// its lower bound on first use.
    pub fn next_subnet_byte(&self) -> ArcaResult<u8> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO subnet_allocation (id, next_subnet_byte) VALUES (1, ?1)",
                [subnet::FIRST_BYTE],
            )
            .map_err(map_sql)?;
            conn.query_row(
                "SELECT next_subnet_byte FROM subnet_allocation WHERE id = 1",
                [],
                |row| row.get::<_, u8>(0),
            )
            .map_err(map_sql)
        })
    }

    /// Persist a new cursor value.
    pub fn set_next_subnet_byte(&self, value: u8) -> ArcaResult<()> {
        if !(subnet::FIRST_BYTE..=subnet::LAST_BYTE).contains(&value) {
            return Err(ArcaError::InvalidArgument(format!(
                "subnet byte {value} outside {}..={}",
                subnet::FIRST_BYTE,
                subnet::LAST_BYTE
            )));
        }
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO subnet_allocation (id, next_subnet_byte) VALUES (1, ?1)
                 ON CONFLICT(id) DO UPDATE SET next_subnet_byte = excluded.next_subnet_byte",
                [value],
            )
            .map_err(map_sql)?;
            Ok(())
        })
    }
}

// ----------------------------------------------------------------------
// Shared helpers for the per-table impls
// ----------------------------------------------------------------------

pub(crate) fn map_sql(e: rusqlite::Error) -> ArcaError {
    ArcaError::Database(e.to_string())
}

pub(crate) fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

pub(crate) fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

pub(crate) fn parse_ts(s: &str) -> ArcaResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| ArcaError::Database(format!("bad timestamp {s:?}: {e}")))
}

pub(crate) fn to_json<T: serde::Serialize>(value: &T) -> ArcaResult<String> {
    serde_json::to_string(value).map_err(|e| ArcaError::Database(format!("encode failed: {e}")))
}

pub(crate) fn from_json<T: serde::de::DeserializeOwned>(s: &str) -> ArcaResult<T> {
    serde_json::from_str(s).map_err(|e| ArcaError::Database(format!("decode failed: {e}")))
}
