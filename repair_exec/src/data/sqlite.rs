//! SQLite implementation of the data source.
//!
//! Expected schema:
//!
//! ```sql
//! CREATE TABLE switch_points (side_number, switch_point_id);
//! CREATE TABLE agv_wait_points (machine_id, wait_point_id);
//! CREATE TABLE spindle_distances (side_number, spindle, distance_value);
//! -- one per machine, numbered from 1
//! CREATE TABLE data1_update (deviceId, value);
//! ```

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use comms_if::msg::SideLocation;
use log::{debug, warn};
use rusqlite::{params, types::Value, Connection, OpenFlags, OptionalExtension};
use std::{
    convert::TryFrom,
    path::Path,
    sync::{Mutex, MutexGuard},
};

use super::{DataError, DataSource};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Data source reading the backend tables from an SQLite database.
pub struct SqliteDataSource {
    conn: Mutex<Connection>,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl SqliteDataSource {
    /// Open an existing database read-only.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DataError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run a single-value point id lookup.
    fn point_id(&self, sql: &str, key: &dyn rusqlite::ToSql) -> Result<Option<u32>, DataError> {
        let value: Option<Value> = self
            .conn()
            .query_row(sql, params![key], |row| row.get(0))
            .optional()?;

        let text = match value {
            None | Some(Value::Null) => return Ok(None),
            Some(Value::Integer(i)) => i.to_string(),
            Some(Value::Text(s)) => s,
            Some(other) => format!("{:?}", other),
        };

        // The backend stores an empty string for unassigned points
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }

        trimmed
            .parse()
            .map(Some)
            .map_err(|_| DataError::InvalidPointId(text.clone()))
    }
}

impl DataSource for SqliteDataSource {
    fn switch_point_id(&self, side_number: u32) -> Result<Option<u32>, DataError> {
        self.point_id(
            "SELECT switch_point_id FROM switch_points WHERE side_number = ?1 LIMIT 1",
            &side_number,
        )
    }

    fn wait_point_id(&self, machine_id: &str) -> Result<Option<u32>, DataError> {
        self.point_id(
            "SELECT wait_point_id FROM agv_wait_points WHERE machine_id = ?1 LIMIT 1",
            &machine_id,
        )
    }

    fn non_zero_break_values(&self, side_number: u32) -> Result<Vec<i32>, DataError> {
        let loc = SideLocation::from_side(side_number).ok_or(DataError::InvalidSide(side_number))?;

        // Table names cannot be bound, the machine number is an integer so this is safe
        let sql = format!(
            "SELECT value FROM data{}_update WHERE deviceId = ?1 AND value != '0'",
            loc.machine_number
        );

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![loc.device.as_str()], |row| row.get::<_, Value>(0))?;

        let mut values = Vec::new();
        for row in rows {
            let value = match row? {
                Value::Integer(i) => match i32::try_from(i) {
                    Ok(v) => v,
                    Err(_) => {
                        warn!("Ignoring out of range break value {}", i);
                        continue;
                    }
                },
                Value::Text(s) => match s.trim().parse() {
                    Ok(v) => v,
                    Err(_) => {
                        warn!("Ignoring non-numeric break value \"{}\"", s);
                        continue;
                    }
                },
                other => {
                    warn!("Ignoring break value of unexpected type {:?}", other);
                    continue;
                }
            };
            values.push(value);
        }

        debug!(
            "Side {} (machine {} {}): {} break values",
            side_number,
            loc.machine_number,
            loc.device.as_str(),
            values.len()
        );

        Ok(values)
    }

    fn distance_values(&self, side_number: u32) -> Result<Vec<f32>, DataError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT distance_value FROM spindle_distances WHERE side_number = ?1 ORDER BY spindle",
        )?;

        let values = stmt
            .query_map(params![side_number], |row| row.get::<_, f64>(0))?
            .map(|r| r.map(|v| v as f32))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(values)
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    fn backend() -> SqliteDataSource {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE switch_points (side_number TEXT, switch_point_id TEXT);
            CREATE TABLE agv_wait_points (machine_id TEXT, wait_point_id TEXT);
            CREATE TABLE spindle_distances (side_number INTEGER, spindle INTEGER, distance_value REAL);
            CREATE TABLE data2_update (deviceId TEXT, value TEXT);

            INSERT INTO switch_points VALUES ('3', '101'), ('4', ''), ('5', 'P7');
            INSERT INTO agv_wait_points VALUES ('MACHINE001', '900');
            INSERT INTO spindle_distances VALUES (3, 2, 20.5), (3, 1, 10.0), (3, 3, 31.25);
            INSERT INTO data2_update VALUES
                ('right', '5'), ('right', '0'), ('right', '1'), ('left', '9'), ('right', '3');
            "#,
        )
        .unwrap();
        SqliteDataSource::from_connection(conn)
    }

    #[test]
    fn test_point_lookups() {
        let ds = backend();

        assert_eq!(ds.switch_point_id(3).unwrap(), Some(101));
        assert_eq!(ds.switch_point_id(4).unwrap(), None);
        assert_eq!(ds.switch_point_id(8).unwrap(), None);
        assert!(matches!(
            ds.switch_point_id(5),
            Err(DataError::InvalidPointId(_))
        ));

        assert_eq!(ds.wait_point_id("MACHINE001").unwrap(), Some(900));
        assert_eq!(ds.wait_point_id("MACHINE404").unwrap(), None);
    }

    #[test]
    fn test_break_values_by_side() {
        let ds = backend();

        // Side 3 is the right device of machine 2, side 4 the left
        assert_eq!(ds.non_zero_break_values(3).unwrap(), vec![5, 1, 3]);
        assert_eq!(ds.non_zero_break_values(4).unwrap(), vec![9]);

        // Machine 1 has no table
        assert!(ds.non_zero_break_values(1).is_err());
        assert!(matches!(
            ds.non_zero_break_values(0),
            Err(DataError::InvalidSide(0))
        ));
    }

    #[test]
    fn test_unusable_break_values_skipped() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE data1_update (deviceId TEXT, value);
            INSERT INTO data1_update VALUES
                ('right', 4), ('right', 4294967297), ('right', 'x'), ('right', 2.5), ('right', 6);
            "#,
        )
        .unwrap();
        let ds = SqliteDataSource::from_connection(conn);

        // 4294967297 would wrap to 1 if truncated
        assert_eq!(ds.non_zero_break_values(1).unwrap(), vec![4, 6]);
    }

    #[test]
    fn test_distances_ordered_by_spindle() {
        let ds = backend();
        assert_eq!(ds.distance_values(3).unwrap(), vec![10.0, 20.5, 31.25]);
        assert!(ds.distance_values(4).unwrap().is_empty());
    }
}
