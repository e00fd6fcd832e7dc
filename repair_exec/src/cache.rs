//! # Local Cache
//!
//! Per-side snapshot of the spindle distances and break values taken when a side is loaded.
//! The repair of a side reads its distances from here rather than from the backend, so the
//! carriage positions stay consistent for the whole side even if the backend changes meanwhile.
//!
//! A side's snapshot is always replaced as a whole: readers never see a mix of old and new rows.
//!
//! The switch point of each side and the wait point of each machine are kept here as well, as
//! last looked up from the backend.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use rusqlite::{params, Connection, OptionalExtension};
use std::{
    collections::HashMap,
    path::Path,
    sync::{Mutex, MutexGuard},
};

// ------------------------------------------------------------------------------------------------
// TRAITS
// ------------------------------------------------------------------------------------------------

pub trait SpindleCache: Send + Sync {
    /// Replace every distance cached for a side.
    fn replace_distance_values(&self, side_number: u32, values: &[f32]) -> Result<(), CacheError>;

    /// Distance of a 1-based spindle of a side, if cached.
    fn distance_value(&self, side_number: u32, spindle: u32) -> Result<Option<f32>, CacheError>;

    /// Replace every break value cached for a side.
    fn replace_side_break_values(&self, side_number: u32, values: &[i32])
        -> Result<(), CacheError>;

    /// Break values cached for a side.
    fn side_break_values(&self, side_number: u32) -> Result<Vec<i32>, CacheError>;

    /// Replace the switch point cached for a side.
    fn replace_switch_point_id(&self, side_number: u32, point_id: u32) -> Result<(), CacheError>;

    fn switch_point_id(&self, side_number: u32) -> Result<Option<u32>, CacheError>;

    /// Replace the wait point cached for a machine.
    fn replace_wait_point_id(&self, machine_id: &str, point_id: u32) -> Result<(), CacheError>;

    fn wait_point_id(&self, machine_id: &str) -> Result<Option<u32>, CacheError>;
}

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Cache held in process memory.
#[derive(Default)]
pub struct MemoryCache {
    inner: Mutex<MemoryCacheInner>,
}

#[derive(Default)]
struct MemoryCacheInner {
    distances: HashMap<u32, Vec<f32>>,
    break_values: HashMap<u32, Vec<i32>>,
    switch_points: HashMap<u32, u32>,
    wait_points: HashMap<String, u32>,
}

/// Cache persisted to an SQLite database.
pub struct SqliteCache {
    conn: Mutex<Connection>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    #[error("Cache database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS side_value (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    side_number INTEGER NOT NULL,
    value INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS spindle_distance_cache (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    side_number INTEGER NOT NULL,
    distance_value REAL
);
CREATE TABLE IF NOT EXISTS switch_point_cache (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    side_number INTEGER NOT NULL,
    switch_point_id INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS wait_point_cache (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    machine_id TEXT NOT NULL,
    wait_point_id INTEGER NOT NULL
);
"#;

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, MemoryCacheInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SpindleCache for MemoryCache {
    fn replace_distance_values(&self, side_number: u32, values: &[f32]) -> Result<(), CacheError> {
        self.inner().distances.insert(side_number, values.to_vec());
        Ok(())
    }

    fn distance_value(&self, side_number: u32, spindle: u32) -> Result<Option<f32>, CacheError> {
        let index = match spindle_index(spindle) {
            Some(i) => i,
            None => return Ok(None),
        };

        Ok(self
            .inner()
            .distances
            .get(&side_number)
            .and_then(|d| d.get(index))
            .copied())
    }

    fn replace_side_break_values(
        &self,
        side_number: u32,
        values: &[i32],
    ) -> Result<(), CacheError> {
        self.inner().break_values.insert(side_number, values.to_vec());
        Ok(())
    }

    fn side_break_values(&self, side_number: u32) -> Result<Vec<i32>, CacheError> {
        Ok(self
            .inner()
            .break_values
            .get(&side_number)
            .cloned()
            .unwrap_or_default())
    }

    fn replace_switch_point_id(&self, side_number: u32, point_id: u32) -> Result<(), CacheError> {
        self.inner().switch_points.insert(side_number, point_id);
        Ok(())
    }

    fn switch_point_id(&self, side_number: u32) -> Result<Option<u32>, CacheError> {
        Ok(self.inner().switch_points.get(&side_number).copied())
    }

    fn replace_wait_point_id(&self, machine_id: &str, point_id: u32) -> Result<(), CacheError> {
        self.inner()
            .wait_points
            .insert(machine_id.to_string(), point_id);
        Ok(())
    }

    fn wait_point_id(&self, machine_id: &str) -> Result<Option<u32>, CacheError> {
        Ok(self.inner().wait_points.get(machine_id).copied())
    }
}

impl SqliteCache {
    /// Open (creating if needed) the cache database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, CacheError> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, CacheError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, CacheError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SpindleCache for SqliteCache {
    fn replace_distance_values(&self, side_number: u32, values: &[f32]) -> Result<(), CacheError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        tx.execute(
            "DELETE FROM spindle_distance_cache WHERE side_number = ?1",
            params![side_number],
        )?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO spindle_distance_cache (side_number, distance_value) VALUES (?1, ?2)",
            )?;
            for v in values {
                insert.execute(params![side_number, *v as f64])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn distance_value(&self, side_number: u32, spindle: u32) -> Result<Option<f32>, CacheError> {
        let index = match spindle_index(spindle) {
            Some(i) => i as i64,
            None => return Ok(None),
        };

        // Rows are inserted in spindle order, so insertion order gives the position
        let value: Option<f64> = self
            .conn()
            .query_row(
                "SELECT distance_value FROM spindle_distance_cache WHERE side_number = ?1 \
                 ORDER BY id LIMIT 1 OFFSET ?2",
                params![side_number, index],
                |row| row.get(0),
            )
            .optional()?;

        Ok(value.map(|v| v as f32))
    }

    fn replace_side_break_values(
        &self,
        side_number: u32,
        values: &[i32],
    ) -> Result<(), CacheError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        tx.execute(
            "DELETE FROM side_value WHERE side_number = ?1",
            params![side_number],
        )?;
        {
            let mut insert =
                tx.prepare("INSERT INTO side_value (side_number, value) VALUES (?1, ?2)")?;
            for v in values {
                insert.execute(params![side_number, v])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn side_break_values(&self, side_number: u32) -> Result<Vec<i32>, CacheError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT value FROM side_value WHERE side_number = ?1 ORDER BY id")?;
        let values = stmt
            .query_map(params![side_number], |row| row.get(0))?
            .collect::<Result<Vec<i32>, _>>()?;
        Ok(values)
    }

    fn replace_switch_point_id(&self, side_number: u32, point_id: u32) -> Result<(), CacheError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM switch_point_cache WHERE side_number = ?1",
            params![side_number],
        )?;
        tx.execute(
            "INSERT INTO switch_point_cache (side_number, switch_point_id) VALUES (?1, ?2)",
            params![side_number, point_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn switch_point_id(&self, side_number: u32) -> Result<Option<u32>, CacheError> {
        Ok(self
            .conn()
            .query_row(
                "SELECT switch_point_id FROM switch_point_cache WHERE side_number = ?1",
                params![side_number],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn replace_wait_point_id(&self, machine_id: &str, point_id: u32) -> Result<(), CacheError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM wait_point_cache WHERE machine_id = ?1",
            params![machine_id],
        )?;
        tx.execute(
            "INSERT INTO wait_point_cache (machine_id, wait_point_id) VALUES (?1, ?2)",
            params![machine_id, point_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn wait_point_id(&self, machine_id: &str) -> Result<Option<u32>, CacheError> {
        Ok(self
            .conn()
            .query_row(
                "SELECT wait_point_id FROM wait_point_cache WHERE machine_id = ?1",
                params![machine_id],
                |row| row.get(0),
            )
            .optional()?)
    }
}

// ------------------------------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Position of a 1-based spindle in its side's distance sequence.
fn spindle_index(spindle: u32) -> Option<usize> {
    (spindle as usize).checked_sub(1)
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------
