//! # Repair library.
//!
//! This library allows the executable and the integration tests to access the items defined inside
//! the repair crate.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

/// AGV client - navigation commands and status queries over UDP
pub mod agv_client;

/// Broker client - envelopes to and from the backend over ZMQ
pub mod broker_client;

/// Local cache of per-side spindle distances and break values
pub mod cache;

/// Break-point data source
pub mod data;

/// Dispatcher - routes inbound envelopes and owns the task worker
pub mod dispatcher;

/// Repair orchestrator - the repair workflow
pub mod orchestrator;

pub mod params;

/// PLC client - coils and registers over Modbus TCP
pub mod plc_client;

/// Simulated equipment for bench runs and tests
pub mod sim;

/// Status reporter - periodic status records for the backend
pub mod status_reporter;
