//! # Communications interface crate.
//!
//! Wire formats shared by the repair executive and its tooling: the AGV link, the PLC register
//! map and the broker envelopes.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

/// AGV UDP frame codec
pub mod agv;

/// Broker message envelopes and commands
pub mod msg;

/// Network module
pub mod net;

pub mod plc;
