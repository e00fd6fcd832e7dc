//! # Repair Executable Parameters
//!
//! Parameters for the repair executable, loaded from `params/repair_exec.toml`. Every field has a
//! default so a partial file is enough.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairExecParams {
    /// Id this robot reports itself as
    pub robot_id: String,

    /// Machine whose wait point the AGV returns to after a task
    pub machine_id: String,

    pub agv: AgvParams,

    pub plc: PlcParams,

    pub broker: BrokerParams,

    pub workflow: WorkflowParams,

    pub status: StatusParams,

    pub storage: StorageParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgvParams {
    pub ip: String,

    pub port: u16,

    /// How long to wait for a status reply
    pub recv_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlcParams {
    pub ip: String,

    pub port: u16,

    /// Modbus unit identifier of the PLC
    pub slave_id: u8,

    pub connect_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerParams {
    /// Backend endpoint the DEALER socket connects to
    pub endpoint: String,

    /// Delay between reconnection attempts
    pub reconnect_ivl_ms: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowParams {
    pub odd_side_sort: SortOrder,

    pub even_side_sort: SortOrder,

    /// Value written to the roller trigger coil on odd sides
    pub odd_side_roller: bool,

    /// Value written to the roller trigger coil on even sides
    pub even_side_roller: bool,

    pub poll_interval_ms: u64,

    /// Polls of a single condition before the workflow gives up
    pub max_poll_attempts: u32,

    /// Spindle whose distance parks the carriage at the end of a task
    pub park_spindle: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusParams {
    pub interval_ms: u64,

    /// Start periodic reporting when the executive starts
    pub report_on_start: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageParams {
    /// Backend database holding break values, points and spindle distances
    pub data_source_path: PathBuf,

    /// Local cache database
    pub cache_path: PathBuf,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// Order in which the spindles of a side are visited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    Asc,
    Desc,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl WorkflowParams {
    pub fn sort_for_side(&self, side_number: u32) -> SortOrder {
        if side_number % 2 == 1 {
            self.odd_side_sort
        } else {
            self.even_side_sort
        }
    }

    pub fn roller_for_side(&self, side_number: u32) -> bool {
        if side_number % 2 == 1 {
            self.odd_side_roller
        } else {
            self.even_side_roller
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for RepairExecParams {
    fn default() -> Self {
        Self {
            robot_id: "AGV001".into(),
            machine_id: "MACHINE001".into(),
            agv: AgvParams::default(),
            plc: PlcParams::default(),
            broker: BrokerParams::default(),
            workflow: WorkflowParams::default(),
            status: StatusParams::default(),
            storage: StorageParams::default(),
        }
    }
}

impl Default for AgvParams {
    fn default() -> Self {
        Self {
            ip: "192.168.100.178".into(),
            port: 17804,
            recv_timeout_ms: 3000,
        }
    }
}

impl Default for PlcParams {
    fn default() -> Self {
        Self {
            ip: "192.168.0.1".into(),
            port: 502,
            slave_id: 17,
            connect_timeout_ms: 3000,
        }
    }
}

impl Default for BrokerParams {
    fn default() -> Self {
        Self {
            endpoint: "tcp://localhost:5555".into(),
            reconnect_ivl_ms: 1000,
        }
    }
}

impl Default for WorkflowParams {
    fn default() -> Self {
        Self {
            odd_side_sort: SortOrder::Asc,
            even_side_sort: SortOrder::Desc,
            odd_side_roller: true,
            even_side_roller: false,
            poll_interval_ms: 2000,
            max_poll_attempts: 900,
            park_spindle: 1,
        }
    }
}

impl Default for StatusParams {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            report_on_start: true,
        }
    }
}

impl Default for StorageParams {
    fn default() -> Self {
        Self {
            data_source_path: PathBuf::from("data/backend.db"),
            cache_path: PathBuf::from("data/yarn_guardian.db"),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------
