//! Persisted volume catalog (SPEC_FULL.md §A.4).
//!
//! spec §6 leaves the catalog format unspecified beyond "the handle->path
//! mapping may be reconstructed from a sidecar". This is that sidecar: a
//! SQLite database storing exactly the Volume record fields from spec §3,
//! written database-first the same way the teacher persists box records.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::errors::VolmanResult;
use crate::model::{Flavor, Status, Strategy, Volume};

const SCHEMA_VERSION: i32 = 1;

macro_rules! db_err {
    ($result:expr) => {
        $result.map_err(crate::errors::VolmanError::from)
    };
}

/// SQLite-backed catalog handle. Thread-safe via `parking_lot::Mutex`.
#[derive(Clone)]
pub struct Catalog {
    conn: Arc<Mutex<Connection>>,
}

impl Catalog {
    pub fn open(db_path: &Path) -> VolmanResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = db_err!(Connection::open(db_path))?;

        db_err!(conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=FULL;
            PRAGMA foreign_keys=ON;
            PRAGMA busy_timeout=100000;
            "
        ))?;

        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory catalog, for tests and the CLI's ephemeral `--no-persist` mode.
    pub fn in_memory() -> VolmanResult<Self> {
        let conn = db_err!(Connection::open_in_memory())?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> VolmanResult<()> {
        db_err!(conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS schema_version (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS volumes (
                handle TEXT PRIMARY KEY,
                path TEXT NOT NULL,
                flavor TEXT NOT NULL,
                parent TEXT,
                strategy TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            "
        ))?;

        let existing: Option<i32> = db_err!(conn
            .query_row(
                "SELECT version FROM schema_version WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional())?;

        if existing.is_none() {
            db_err!(conn.execute(
                "INSERT INTO schema_version (id, version) VALUES (1, ?1)",
                params![SCHEMA_VERSION],
            ))?;
            tracing::info!("Initialized volume catalog schema version {SCHEMA_VERSION}");
        }

        Ok(())
    }

    pub fn insert(&self, volume: &Volume) -> VolmanResult<()> {
        let conn = self.conn.lock();
        db_err!(conn.execute(
            "INSERT INTO volumes (handle, path, flavor, parent, strategy, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                volume.handle,
                volume.path.to_string_lossy(),
                flavor_str(volume.flavor),
                volume.parent,
                serde_json::to_string(&volume.strategy).unwrap_or_default(),
                status_str(volume.status),
                volume.created_at.to_rfc3339(),
            ],
        ))?;
        Ok(())
    }

    pub fn update_status(&self, handle: &str, status: Status) -> VolmanResult<()> {
        let conn = self.conn.lock();
        db_err!(conn.execute(
            "UPDATE volumes SET status = ?1 WHERE handle = ?2",
            params![status_str(status), handle],
        ))?;
        Ok(())
    }

    pub fn update_flavor(&self, handle: &str, flavor: Flavor) -> VolmanResult<()> {
        let conn = self.conn.lock();
        db_err!(conn.execute(
            "UPDATE volumes SET flavor = ?1 WHERE handle = ?2",
            params![flavor_str(flavor), handle],
        ))?;
        Ok(())
    }

    pub fn delete(&self, handle: &str) -> VolmanResult<()> {
        let conn = self.conn.lock();
        db_err!(conn.execute("DELETE FROM volumes WHERE handle = ?1", params![handle]))?;
        Ok(())
    }

    pub fn list_all(&self) -> VolmanResult<Vec<Volume>> {
        let conn = self.conn.lock();
        let mut stmt = db_err!(conn.prepare(
            "SELECT handle, path, flavor, parent, strategy, status, created_at FROM volumes"
        ))?;
        let rows = db_err!(stmt.query_map([], |row| {
            let strategy_json: String = row.get(4)?;
            let created_at_str: String = row.get(6)?;
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                strategy_json,
                row.get::<_, String>(5)?,
                created_at_str,
            ))
        }))?;

        let mut volumes = Vec::new();
        for row in rows {
            let (handle, path, flavor, parent, strategy_json, status, created_at_str) =
                db_err!(row)?;
            let strategy: Strategy = serde_json::from_str(&strategy_json).map_err(|e| {
                crate::errors::VolmanError::Internal(format!(
                    "corrupt catalog strategy for {handle}: {e}"
                ))
            })?;
            let created_at = chrono::DateTime::parse_from_rfc3339(&created_at_str)
                .map(|dt| dt.with_timezone(&chrono::Utc))
                .map_err(|e| {
                    crate::errors::VolmanError::Internal(format!(
                        "corrupt catalog timestamp for {handle}: {e}"
                    ))
                })?;

            volumes.push(Volume {
                handle,
                path: path.into(),
                flavor: parse_flavor(&flavor)?,
                parent,
                strategy,
                status: parse_status(&status)?,
                created_at,
            });
        }

        Ok(volumes)
    }
}

fn flavor_str(flavor: Flavor) -> &'static str {
    match flavor {
        Flavor::Privileged => "privileged",
        Flavor::Unprivileged => "unprivileged",
    }
}

fn parse_flavor(s: &str) -> VolmanResult<Flavor> {
    match s {
        "privileged" => Ok(Flavor::Privileged),
        "unprivileged" => Ok(Flavor::Unprivileged),
        other => Err(crate::errors::VolmanError::Internal(format!(
            "corrupt catalog flavor: {other}"
        ))),
    }
}

fn status_str(status: Status) -> &'static str {
    match status {
        Status::Active => "active",
        Status::Poisoned => "poisoned",
    }
}

fn parse_status(s: &str) -> VolmanResult<Status> {
    match s {
        "active" => Ok(Status::Active),
        "poisoned" => Ok(Status::Poisoned),
        other => Err(crate::errors::VolmanError::Internal(format!(
            "corrupt catalog status: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Volume;

    #[test]
    fn insert_and_list_round_trips() {
        let catalog = Catalog::in_memory().unwrap();
        let vol = Volume::new_empty("h1".into(), "/tmp/h1".into(), Flavor::Privileged);
        catalog.insert(&vol).unwrap();

        let all = catalog.list_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].handle, "h1");
        assert_eq!(all[0].flavor, Flavor::Privileged);
    }

    #[test]
    fn update_status_persists() {
        let catalog = Catalog::in_memory().unwrap();
        let vol = Volume::new_empty("h1".into(), "/tmp/h1".into(), Flavor::Privileged);
        catalog.insert(&vol).unwrap();
        catalog.update_status("h1", Status::Poisoned).unwrap();

        let all = catalog.list_all().unwrap();
        assert_eq!(all[0].status, Status::Poisoned);
    }

    #[test]
    fn delete_removes_row() {
        let catalog = Catalog::in_memory().unwrap();
        let vol = Volume::new_empty("h1".into(), "/tmp/h1".into(), Flavor::Privileged);
        catalog.insert(&vol).unwrap();
        catalog.delete("h1").unwrap();
        assert!(catalog.list_all().unwrap().is_empty());
    }
}
