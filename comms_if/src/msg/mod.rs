//! # Broker Messages
//!
//! JSON envelopes exchanged with the backend over the message broker, and the typed commands
//! decoded from them.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::{convert::TryFrom, fmt};

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Modules whose envelopes are handled by the repair executive.
pub const MODULE_SCHEDULE: &str = "schedule";
pub const MODULE_AGV: &str = "agv";

/// Service names carried in the envelope's `Service` field.
pub mod service {
    pub const GET_SCHEDULE: &str = "get_schedule";
    pub const START_REPAIR_TASK: &str = "start_repair_task";
    pub const STATUS_REPORT: &str = "status_report";
    pub const START: &str = "start";
}

/// `Code` of an envelope reporting success.
pub const CODE_SUCCESS: i32 = 1;

/// `Code` of an envelope reporting failure.
pub const CODE_FAILURE: i32 = 0;

/// `Type` field of every status record.
pub const STATUS_RECORD_TYPE: &str = "status_report";

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// The message envelope carried on the broker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Envelope {
    #[serde(default)]
    pub client_id: u32,

    #[serde(default)]
    pub module: String,

    #[serde(default)]
    pub service: String,

    #[serde(default)]
    pub msg: String,

    #[serde(default)]
    pub code: i32,

    #[serde(default)]
    pub content: Value,
}

/// Where a request came from, so replies can be addressed back to it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageOrigin {
    pub client_id: u32,
    pub module: String,
    pub service: String,
}

/// A repair task as assigned by the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct RepairTaskDescriptor {
    /// 1-based side number of the spinning machine row
    pub side_number: u32,

    pub task_id: TaskId,

    pub origin: MessageOrigin,
}

/// Content of a `start_repair_task` envelope.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RepairTaskContent {
    #[serde(alias = "sideNumber", alias = "spinningMachineId")]
    #[serde(deserialize_with = "number_or_numeric_text")]
    side_number: u32,

    #[serde(alias = "taskId")]
    task_id: TaskId,
}

/// Physical location of a side: the machine it belongs to and which of its two devices serves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SideLocation {
    pub machine_number: u32,
    pub device: Device,
}

/// Periodic status sample published to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatusRecord {
    #[serde(rename = "Type")]
    pub record_type: String,

    pub robot_id: String,

    pub time_stamp: DateTime<Utc>,

    pub status: String,

    /// Battery state of charge in percent
    pub power: f32,

    /// Side currently being worked, 0 when idle
    pub current_lane_id: u32,

    /// Carriage spindle distance, empty when unavailable
    pub current_position: String,

    pub direction: String,

    /// Forward velocity of the AGV
    pub speed: f32,
}

/// Local result of handling an inbound envelope.
///
/// `code` is 0 on success and 1 on error, which is the inverse of the envelope `Code` convention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferResult {
    pub code: i32,
    pub message: String,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// Task identifiers arrive as either text or numbers depending on the backend version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskId {
    Number(i64),
    Text(String),
}

/// Which device of a machine serves a side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    /// Odd sides
    Right,

    /// Even sides
    Left,
}

/// A command decoded from an inbound envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Stop periodic status reporting
    GetSchedule,

    /// Run a repair task
    StartRepairTask(RepairTaskDescriptor),

    /// Sample and send the status once
    StatusReport,
}

#[derive(thiserror::Error, Debug)]
pub enum CommandError {
    #[error("Unexpected Service! [{0}]")]
    UnexpectedService(String),

    #[error("Module \"{0}\" is not handled")]
    UnhandledModule(String),

    #[error("Invalid content for service {service}: {source}")]
    InvalidContent {
        service: String,
        source: serde_json::Error,
    },

    #[error("Side number {0} is out of range")]
    InvalidSide(u32),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Envelope {
    /// Create an empty envelope for the given module and service.
    pub fn new(module: &str, service: &str) -> Self {
        Self {
            module: module.to_string(),
            service: service.to_string(),
            ..Default::default()
        }
    }

    /// Create an envelope addressed back to the origin of a request.
    pub fn reply_to(origin: &MessageOrigin) -> Self {
        Self {
            client_id: origin.client_id,
            module: origin.module.clone(),
            service: origin.service.clone(),
            ..Default::default()
        }
    }

    pub fn origin(&self) -> MessageOrigin {
        MessageOrigin {
            client_id: self.client_id,
            module: self.module.clone(),
            service: self.service.clone(),
        }
    }

    /// Set the content by serialising the given value.
    pub fn with_content<T: Serialize>(mut self, content: &T) -> Result<Self, serde_json::Error> {
        self.content = serde_json::to_value(content)?;
        Ok(self)
    }

    pub fn success(mut self, msg: &str) -> Self {
        self.code = CODE_SUCCESS;
        self.msg = msg.to_string();
        self
    }

    pub fn failure(mut self, msg: &str) -> Self {
        self.code = CODE_FAILURE;
        self.msg = msg.to_string();
        self
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

impl Command {
    /// Classify an inbound envelope.
    ///
    /// Only the `schedule` and `agv` modules are routed here, other modules fail with
    /// `UnhandledModule`. A service this executive does not provide fails with
    /// `UnexpectedService`.
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, CommandError> {
        match envelope.module.as_str() {
            MODULE_SCHEDULE | MODULE_AGV => (),
            other => return Err(CommandError::UnhandledModule(other.to_string())),
        }

        match envelope.service.as_str() {
            service::GET_SCHEDULE => Ok(Command::GetSchedule),
            service::STATUS_REPORT => Ok(Command::StatusReport),
            service::START_REPAIR_TASK => {
                let content: RepairTaskContent = serde_json::from_value(envelope.content.clone())
                    .map_err(|e| CommandError::InvalidContent {
                        service: envelope.service.clone(),
                        source: e,
                    })?;

                // A task covers the side and the one after it
                if content.side_number == 0 || content.side_number == u32::MAX {
                    return Err(CommandError::InvalidSide(content.side_number));
                }

                Ok(Command::StartRepairTask(RepairTaskDescriptor {
                    side_number: content.side_number,
                    task_id: content.task_id,
                    origin: envelope.origin(),
                }))
            }
            other => Err(CommandError::UnexpectedService(other.to_string())),
        }
    }
}

impl RepairTaskDescriptor {
    pub fn location(&self) -> Option<SideLocation> {
        SideLocation::from_side(self.side_number)
    }
}

impl SideLocation {
    /// Locate a 1-based side.
    ///
    /// Odd sides are the right device of machine `(side + 1) / 2`, even sides the left device of
    /// machine `side / 2`. Side 0 does not exist.
    pub fn from_side(side_number: u32) -> Option<Self> {
        if side_number == 0 {
            return None;
        }

        Some(if side_number % 2 == 1 {
            Self {
                machine_number: side_number / 2 + 1,
                device: Device::Right,
            }
        } else {
            Self {
                machine_number: side_number / 2,
                device: Device::Left,
            }
        })
    }
}

impl Device {
    /// The device id used by the backend tables.
    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Right => "right",
            Device::Left => "left",
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskId::Number(n) => write!(f, "{}", n),
            TaskId::Text(s) => write!(f, "{}", s),
        }
    }
}

impl TransferResult {
    pub fn ok() -> Self {
        Self {
            code: 0,
            message: String::new(),
        }
    }

    pub fn error<S: ToString>(message: S) -> Self {
        Self {
            code: 1,
            message: message.to_string(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == 0
    }
}

impl From<&CommandError> for TransferResult {
    fn from(e: &CommandError) -> Self {
        TransferResult::error(e)
    }
}

// ------------------------------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Accept a side number given as a JSON number or as numeric text.
fn number_or_numeric_text<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| de::Error::custom(format!("side number {} out of range", n))),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| de::Error::custom(format!("side number \"{}\" is not numeric", s))),
        other => Err(de::Error::custom(format!(
            "expected a side number, found {}",
            other
        ))),
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------
