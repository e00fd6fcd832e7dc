//! # Break-point Data Source
//!
//! Read access to the backend tables describing the spinning machines: the AGV points serving
//! each side and machine, the yarn break values reported per spindle, and the carriage distance
//! of every spindle.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

mod sqlite;

pub use sqlite::SqliteDataSource;

// ------------------------------------------------------------------------------------------------
// TRAITS
// ------------------------------------------------------------------------------------------------

/// Source of the break-point data used by the repair workflow.
pub trait DataSource: Send + Sync {
    /// AGV point id of the switch point serving a side, if one is configured.
    fn switch_point_id(&self, side_number: u32) -> Result<Option<u32>, DataError>;

    /// AGV point id where the robot waits for the given machine, if one is configured.
    fn wait_point_id(&self, machine_id: &str) -> Result<Option<u32>, DataError>;

    /// Non-zero break values of a side, in the order the backend stores them.
    ///
    /// Each value is the 1-based index of a spindle with a yarn break.
    fn non_zero_break_values(&self, side_number: u32) -> Result<Vec<i32>, DataError>;

    /// Carriage distance of every spindle of a side, ordered by spindle.
    fn distance_values(&self, side_number: u32) -> Result<Vec<f32>, DataError>;
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(thiserror::Error, Debug)]
pub enum DataError {
    #[error("Data source query failed: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Point id \"{0}\" is not numeric")]
    InvalidPointId(String),

    #[error("Side {0} does not exist")]
    InvalidSide(u32),
}
