//! ==============================================================================
//! store.rs - persistence for the singleton reading
//! ==============================================================================
//!
//! purpose:
//!     keeps the one record the hub knows about, addressed by a fixed key.
//!     every write is a single upsert: it creates the row when absent and
//!     otherwise touches only its own field group.
//!
//! field groups:
//!     - measurement: count + distance (POST /sensor-data)
//!     - lid:         lidOpen          (POST /estado-tapa)
//!     both set lastUpdated. the groups are not written together, so a
//!     concurrent measurement and lid update interleave (last write wins
//!     per group).
//!
//! backends:
//!     - SqliteStore: on-disk (or in-memory) SQLite via rusqlite
//!     - MemoryStore: process-local, lost on restart
//!     both key records by id, so they agree for any id they are given.
//!
//! calls are blocking; the api layer runs them on the blocking pool.
//! a lock poisoned by a panicking caller is recovered: every write is a
//! single statement or field assignment, so no half-written state survives.
//!
//! ==============================================================================

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::config::{StorageBackend, StorageConfig};
use crate::domain::Reading;

pub trait ReadingStore: Send + Sync {
    /// stored record, or None before the first write
    fn fetch(&self, id: &str) -> Result<Option<Reading>>;
    /// set count, distance and lastUpdated; lidOpen defaults to false on create
    fn upsert_measurement(&self, id: &str, count: i64, distance: f64, at: DateTime<Utc>) -> Result<Reading>;
    /// set lidOpen and lastUpdated; count and distance default to 0 on create
    fn upsert_lid(&self, id: &str, lid_open: bool, at: DateTime<Utc>) -> Result<Reading>;
}

/// open the backend named in config. failure here is fatal for the process.
pub fn open_store(config: &StorageConfig) -> Result<Arc<dyn ReadingStore>> {
    match config.backend {
        StorageBackend::Sqlite => {
            let store = SqliteStore::open(&config.database_path)?;
            tracing::info!(path = %config.database_path.display(), "sqlite store ready");
            Ok(Arc::new(store))
        }
        StorageBackend::Memory => {
            tracing::warn!("using in-memory store, state is lost on restart");
            Ok(Arc::new(MemoryStore::default()))
        }
    }
}

// ==============================================================================
// SQLITE
// ==============================================================================

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS readings (
        id           TEXT PRIMARY KEY NOT NULL,
        count        INTEGER NOT NULL DEFAULT 0,
        distance     REAL    NOT NULL DEFAULT 0,
        lid_open     INTEGER NOT NULL DEFAULT 0,
        last_updated TEXT    NOT NULL
    );
";

const UPSERT_MEASUREMENT: &str = "
    INSERT INTO readings (id, count, distance, last_updated)
    VALUES (?1, ?2, ?3, ?4)
    ON CONFLICT(id) DO UPDATE SET
        count = excluded.count,
        distance = excluded.distance,
        last_updated = excluded.last_updated
    RETURNING id, count, distance, lid_open, last_updated
";

const UPSERT_LID: &str = "
    INSERT INTO readings (id, lid_open, last_updated)
    VALUES (?1, ?2, ?3)
    ON CONFLICT(id) DO UPDATE SET
        lid_open = excluded.lid_open,
        last_updated = excluded.last_updated
    RETURNING id, count, distance, lid_open, last_updated
";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// open (creating parent directories) and migrate
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open SQLite database {}", path.display()))?;
        if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
            tracing::warn!("failed to enable WAL mode: {err}");
        }
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory SQLite database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA).context("failed to run database migrations")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("recovering poisoned database connection lock");
            poisoned.into_inner()
        })
    }
}

fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn row_to_reading(row: &Row) -> Result<Reading, rusqlite::Error> {
    let last_updated: String = row.get("last_updated")?;
    let last_updated = DateTime::parse_from_rfc3339(&last_updated)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(Reading {
        id: row.get("id")?,
        count: row.get("count")?,
        distance: row.get("distance")?,
        lid_open: row.get("lid_open")?,
        last_updated,
    })
}

impl ReadingStore for SqliteStore {
    fn fetch(&self, id: &str) -> Result<Option<Reading>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, count, distance, lid_open, last_updated FROM readings WHERE id = ?1",
            params![id],
            row_to_reading,
        )
        .optional()
        .context("failed to read current reading")
    }

    fn upsert_measurement(&self, id: &str, count: i64, distance: f64, at: DateTime<Utc>) -> Result<Reading> {
        let conn = self.lock();
        conn.query_row(UPSERT_MEASUREMENT, params![id, count, distance, format_timestamp(at)], row_to_reading)
            .context("failed to upsert sensor reading")
    }

    fn upsert_lid(&self, id: &str, lid_open: bool, at: DateTime<Utc>) -> Result<Reading> {
        let conn = self.lock();
        conn.query_row(UPSERT_LID, params![id, lid_open, format_timestamp(at)], row_to_reading)
            .context("failed to upsert lid state")
    }
}

// ==============================================================================
// MEMORY
// ==============================================================================

#[derive(Default)]
pub struct MemoryStore {
    readings: Mutex<HashMap<String, Reading>>,
}

impl MemoryStore {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Reading>> {
        self.readings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn upsert(&self, id: &str, at: DateTime<Utc>, apply: impl FnOnce(&mut Reading)) -> Result<Reading> {
        let mut readings = self.lock();
        let reading = readings
            .entry(id.to_string())
            .or_insert_with(|| Reading::placeholder(id, at));
        apply(reading);
        reading.last_updated = at;
        Ok(reading.clone())
    }
}

impl ReadingStore for MemoryStore {
    fn fetch(&self, id: &str) -> Result<Option<Reading>> {
        Ok(self.lock().get(id).cloned())
    }

    fn upsert_measurement(&self, id: &str, count: i64, distance: f64, at: DateTime<Utc>) -> Result<Reading> {
        self.upsert(id, at, |r| {
            r.count = count;
            r.distance = distance;
        })
    }

    fn upsert_lid(&self, id: &str, lid_open: bool, at: DateTime<Utc>) -> Result<Reading> {
        self.upsert(id, at, |r| r.lid_open = lid_open)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    const ID: &str = "basura_principal";

    fn backends() -> Vec<(&'static str, Box<dyn ReadingStore>)> {
        vec![
            ("sqlite", Box::new(SqliteStore::open_in_memory().unwrap()) as Box<dyn ReadingStore>),
            ("memory", Box::new(MemoryStore::default()) as Box<dyn ReadingStore>),
        ]
    }

    #[test]
    fn fetch_before_first_write_is_none() {
        for (name, store) in backends() {
            assert!(store.fetch(ID).unwrap().is_none(), "{name}");
        }
    }

    #[test]
    fn measurement_creates_record_with_closed_lid() {
        for (name, store) in backends() {
            let at = Utc::now();
            let reading = store.upsert_measurement(ID, 5, 42.5, at).unwrap();
            assert_eq!(reading, Reading { id: ID.into(), count: 5, distance: 42.5, lid_open: false, last_updated: at }, "{name}");
            assert_eq!(store.fetch(ID).unwrap(), Some(reading), "{name}");
        }
    }

    #[test]
    fn lid_update_creates_record_with_zero_measurement() {
        for (name, store) in backends() {
            let reading = store.upsert_lid(ID, true, Utc::now()).unwrap();
            assert_eq!((reading.count, reading.distance, reading.lid_open), (0, 0.0, true), "{name}");
        }
    }

    #[test]
    fn field_groups_do_not_clobber_each_other() {
        for (name, store) in backends() {
            let t0 = Utc::now();
            store.upsert_measurement(ID, 3, 10.0, t0).unwrap();
            let t1 = t0 + Duration::seconds(1);
            let after_lid = store.upsert_lid(ID, true, t1).unwrap();
            assert_eq!((after_lid.count, after_lid.distance), (3, 10.0), "{name}");
            assert_eq!(after_lid.last_updated, t1, "{name}");

            let t2 = t1 + Duration::seconds(1);
            let after_measure = store.upsert_measurement(ID, -1, 0.5, t2).unwrap();
            assert!(after_measure.lid_open, "{name}");
            assert_eq!((after_measure.count, after_measure.distance), (-1, 0.5), "{name}");
        }
    }

    #[test]
    fn records_are_keyed_by_id() {
        for (name, store) in backends() {
            store.upsert_measurement("bin-a", 1, 1.0, Utc::now()).unwrap();
            let b = store.upsert_lid("bin-b", true, Utc::now()).unwrap();
            assert_eq!((b.id.as_str(), b.count, b.lid_open), ("bin-b", 0, true), "{name}");

            let a = store.fetch("bin-a").unwrap().unwrap();
            assert_eq!((a.id.as_str(), a.count, a.lid_open), ("bin-a", 1, false), "{name}");
            assert!(store.fetch(ID).unwrap().is_none(), "{name}");
        }
    }

    #[test]
    fn sqlite_recovers_from_poisoned_lock() {
        let store = SqliteStore::open_in_memory().unwrap();
        let poisoner = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _conn = store.conn.lock().unwrap();
            panic!("caller died holding the connection");
        }));
        assert!(poisoner.is_err());
        assert!(store.conn.is_poisoned());

        let reading = store.upsert_measurement(ID, 2, 3.0, Utc::now()).unwrap();
        assert_eq!(store.fetch(ID).unwrap(), Some(reading));
    }

    #[test]
    fn memory_recovers_from_poisoned_lock() {
        let store = MemoryStore::default();
        let poisoner = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _readings = store.readings.lock().unwrap();
            panic!("caller died holding the map");
        }));
        assert!(poisoner.is_err());
        assert!(store.readings.is_poisoned());

        store.upsert_lid(ID, true, Utc::now()).unwrap();
        assert!(store.fetch(ID).unwrap().unwrap().lid_open);
    }

    #[test]
    fn sqlite_keeps_a_single_row() {
        let store = SqliteStore::open_in_memory().unwrap();
        for i in 0..5 {
            store.upsert_measurement(ID, i, i as f64, Utc::now()).unwrap();
            store.upsert_lid(ID, i % 2 == 0, Utc::now()).unwrap();
        }
        let rows: i64 = store
            .lock()
            .query_row("SELECT COUNT(*) FROM readings", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn sqlite_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("hub.db");
        let at = Utc::now();
        {
            let store = SqliteStore::open(&path).unwrap();
            store.upsert_measurement(ID, 9, 1.25, at).unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        let reading = store.fetch(ID).unwrap().unwrap();
        assert_eq!((reading.count, reading.distance, reading.last_updated), (9, 1.25, at));
    }

    #[test]
    fn open_store_honours_backend() {
        let config = StorageConfig { backend: StorageBackend::Memory, ..StorageConfig::default() };
        let store = open_store(&config).unwrap();
        assert!(store.fetch(&config.record_id).unwrap().is_none());
    }
}
