// ABOUTME: SQLite-backed watermark store
// ABOUTME: Conditional UPDATE on the version column gives an atomic compare-and-set

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::state::WatermarkState;
use super::store::{StoreError, WatermarkStore};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS watermarks (
    unit            TEXT PRIMARY KEY,
    value           TEXT NOT NULL,
    boundary_hashes TEXT NOT NULL DEFAULT '[]',
    version         INTEGER NOT NULL,
    last_row_count  INTEGER NOT NULL DEFAULT 0,
    updated_at      TEXT NOT NULL
);
"#;

pub struct SqliteWatermarkStore {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl SqliteWatermarkStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create state directory {}", parent.display())
                })?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open watermark database {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "wal")
            .context("failed to enable WAL for watermark database")?;
        conn.execute_batch(SCHEMA)
            .context("failed to initialize watermark schema")?;
        Ok(Self {
            path: path.to_path_buf(),
            conn: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("watermark database mutex poisoned"))?;
        f(&conn)
    }
}

fn read_state(conn: &Connection, unit: &str) -> Result<Option<WatermarkState>> {
    let row = conn
        .prepare(
            "SELECT unit, value, boundary_hashes, version, last_row_count, updated_at
             FROM watermarks WHERE unit = ?1",
        )?
        .query_row([unit], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, String>(5)?,
            ))
        })
        .optional()?;

    row.map(
        |(unit, value, hashes, version, last_row_count, updated_at)| -> Result<WatermarkState> {
            Ok(WatermarkState {
                value: serde_json::from_str(&value)
                    .with_context(|| format!("corrupt watermark value for unit '{}'", unit))?,
                boundary_hashes: serde_json::from_str(&hashes)
                    .with_context(|| format!("corrupt boundary hashes for unit '{}'", unit))?,
                version: version as u64,
                last_row_count: last_row_count as u64,
                updated_at: DateTime::parse_from_rfc3339(&updated_at)
                    .map(|ts| ts.with_timezone(&Utc))
                    .with_context(|| format!("corrupt updated_at for unit '{}'", unit))?,
                unit,
            })
        },
    )
    .transpose()
}

fn current_version(conn: &Connection, unit: &str) -> Result<u64> {
    let version: Option<i64> = conn
        .query_row(
            "SELECT version FROM watermarks WHERE unit = ?1",
            [unit],
            |row| row.get(0),
        )
        .optional()?;
    Ok(version.unwrap_or(0) as u64)
}

impl WatermarkStore for SqliteWatermarkStore {
    async fn get(&self, unit: &str) -> Result<Option<WatermarkState>> {
        self.with_conn(|conn| read_state(conn, unit))
    }

    async fn set(&self, state: &WatermarkState, expected_version: u64) -> Result<(), StoreError> {
        let value = serde_json::to_string(&state.value).context("serialize watermark value")?;
        let hashes =
            serde_json::to_string(&state.boundary_hashes).context("serialize boundary hashes")?;
        let updated_at = state.updated_at.to_rfc3339();

        let outcome = self.with_conn(|conn| {
            let changed = if expected_version == 0 {
                conn.execute(
                    "INSERT INTO watermarks(unit, value, boundary_hashes, version, last_row_count, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(unit) DO NOTHING",
                    params![
                        state.unit,
                        value,
                        hashes,
                        state.version as i64,
                        state.last_row_count as i64,
                        updated_at,
                    ],
                )?
            } else {
                conn.execute(
                    "UPDATE watermarks
                     SET value = ?2, boundary_hashes = ?3, version = ?4, last_row_count = ?5, updated_at = ?6
                     WHERE unit = ?1 AND version = ?7",
                    params![
                        state.unit,
                        value,
                        hashes,
                        state.version as i64,
                        state.last_row_count as i64,
                        updated_at,
                        expected_version as i64,
                    ],
                )?
            };
            if changed == 1 {
                Ok(None)
            } else {
                Ok(Some(current_version(conn, &state.unit)?))
            }
        })?;

        match outcome {
            None => Ok(()),
            Some(found) => Err(StoreError::Conflict {
                expected: expected_version,
                found,
            }),
        }
    }

    async fn remove(&self, unit: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let deleted = conn.execute("DELETE FROM watermarks WHERE unit = ?1", [unit])?;
            Ok(deleted > 0)
        })
    }

    async fn list(&self) -> Result<Vec<WatermarkState>> {
        self.with_conn(|conn| {
            let units: Vec<String> = conn
                .prepare("SELECT unit FROM watermarks ORDER BY unit")?
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<_>>()?;
            let mut states = Vec::with_capacity(units.len());
            for unit in units {
                if let Some(state) = read_state(conn, &unit)? {
                    states.push(state);
                }
            }
            Ok(states)
        })
    }
}
