//! # PLC Register Codec
//!
//! Resolves the symbolic coil and register addresses used by the repair cell PLC program and
//! converts floats to and from the pair of 16-bit holding registers they occupy.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::{fmt, str::FromStr};

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Highest coil or register index addressable on the PLC.
pub const MAX_ADDRESS_INDEX: u16 = 7999;

/// Symbolic addresses shared with the PLC program.
pub mod addresses {
    /// Set when the AGV has parked at the switch point.
    pub const SWITCH_POINT_ARRIVED: &str = "M500";

    /// Fire the repair rollers on the current spindle.
    pub const TRIGGER_ROLLERS: &str = "M501";

    /// Move the carriage to the distance held in `SPINDLE_POSITION`.
    pub const MOVE_TO_SPINDLE: &str = "M502";

    /// Request the carriage turn back to the other side of the machine.
    pub const TURN_BACK: &str = "M503";

    /// Raised by the PLC once the carriage reaches the commanded spindle.
    pub const SPINDLE_ARRIVAL: &str = "M600";

    /// Raised by the PLC once the rollers finish the repair.
    pub const REPAIR_DONE: &str = "M601";

    /// Raised by the PLC once the turn back completes.
    pub const TURN_BACK_FEEDBACK: &str = "M602";

    /// Raised by the PLC once it has acknowledged the switch point arrival.
    pub const SWITCH_POINT_ARRIVED_FEEDBACK: &str = "M603";

    /// Carriage target distance, a float over two registers.
    pub const SPINDLE_POSITION: &str = "D500";
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// A resolved PLC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlcAddress {
    /// Internal relay (`M` prefix), accessed as a Modbus coil
    Coil(u16),

    /// Data register (`D` prefix), accessed as a Modbus holding register
    Register(u16),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PlcAddressError {
    #[error("Invalid PLC address \"{0}\"")]
    InvalidAddress(String),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl PlcAddress {
    pub fn index(&self) -> u16 {
        match self {
            PlcAddress::Coil(i) | PlcAddress::Register(i) => *i,
        }
    }
}

impl FromStr for PlcAddress {
    type Err = PlcAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || PlcAddressError::InvalidAddress(s.to_string());

        let mut chars = s.chars();
        let prefix = chars.next().ok_or_else(invalid)?;
        let digits = chars.as_str();

        // Only plain decimal digits, which rules out signs and whitespace
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }

        let index: u16 = digits.parse().map_err(|_| invalid())?;
        if index > MAX_ADDRESS_INDEX {
            return Err(invalid());
        }

        match prefix.to_ascii_uppercase() {
            'M' => Ok(PlcAddress::Coil(index)),
            'D' => Ok(PlcAddress::Register(index)),
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for PlcAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlcAddress::Coil(i) => write!(f, "M{}", i),
            PlcAddress::Register(i) => write!(f, "D{}", i),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Parse a coil address such as `M500` into its coil index.
pub fn parse_coil_address(text: &str) -> Result<u16, PlcAddressError> {
    match text.parse()? {
        PlcAddress::Coil(i) => Ok(i),
        PlcAddress::Register(_) => Err(PlcAddressError::InvalidAddress(text.to_string())),
    }
}

/// Parse a register address such as `D500` into its register index.
pub fn parse_register_address(text: &str) -> Result<u16, PlcAddressError> {
    match text.parse()? {
        PlcAddress::Register(i) => Ok(i),
        PlcAddress::Coil(_) => Err(PlcAddressError::InvalidAddress(text.to_string())),
    }
}

/// Assemble a float from the two registers holding it.
///
/// `word_high` is the register at the lower address. The value's little-endian bytes are the low
/// word's bytes followed by the high word's bytes, each word low byte first.
pub fn decode_float(word_high: u16, word_low: u16) -> f32 {
    let lo = word_low.to_le_bytes();
    let hi = word_high.to_le_bytes();
    f32::from_le_bytes([lo[0], lo[1], hi[0], hi[1]])
}

/// Split a float into `(word_high, word_low)`, the inverse of [`decode_float`].
pub fn encode_float(value: f32) -> (u16, u16) {
    let b = value.to_le_bytes();
    let word_low = u16::from_le_bytes([b[0], b[1]]);
    let word_high = u16::from_le_bytes([b[2], b[3]]);
    (word_high, word_low)
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------
