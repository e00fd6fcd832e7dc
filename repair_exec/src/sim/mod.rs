//! # Simulators
//!
//! Stand-ins for the repair cell equipment, for bench runs and tests:
//!
//! - [`SimAgv`] answers the AGV link protocol on a local UDP port,
//! - [`SimPlc`] is an in-process PLC reached through the normal [`PlcClient`](crate::plc_client::PlcClient),
//! - [`SimBackend`] is an in-memory break-point data source.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

mod agv;
mod backend;
mod plc;

pub use agv::{SimAgv, SimAgvError};
pub use backend::SimBackend;
pub use plc::{PlcEvent, SimPlc};
