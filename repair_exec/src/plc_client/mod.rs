//! # PLC Client
//!
//! Persistent connection to the repair cell PLC. Symbolic addresses are resolved with the
//! register codec from `comms_if::plc` and every call on the wire is serialised through a single
//! lock.
//!
//! The physical link sits behind [`PlcLink`] so the client can run against the Modbus TCP
//! implementation in [`modbus`] or the in-process simulator in `crate::sim`.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

pub mod modbus;

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use comms_if::plc::{
    self, addresses, parse_coil_address, parse_register_address, PlcAddressError,
};
use log::{debug, info, trace, warn};
use std::{
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use crate::params::PlcParams;

pub use modbus::ModbusConnector;

// ------------------------------------------------------------------------------------------------
// TRAITS
// ------------------------------------------------------------------------------------------------

/// An open link to a PLC, addressed by raw coil and register indices.
pub trait PlcLink: Send {
    fn read_coils(&mut self, index: u16, count: u16) -> Result<Vec<bool>, PlcClientError>;

    fn write_coil(&mut self, index: u16, value: bool) -> Result<(), PlcClientError>;

    fn read_holding_registers(&mut self, index: u16, count: u16)
        -> Result<Vec<u16>, PlcClientError>;

    fn write_register(&mut self, index: u16, value: u16) -> Result<(), PlcClientError>;

    fn write_registers(&mut self, index: u16, values: &[u16]) -> Result<(), PlcClientError>;
}

/// Opens links to a PLC.
pub trait PlcConnector: Send + Sync {
    fn connect(&self, endpoint: &PlcEndpoint) -> Result<Box<dyn PlcLink>, PlcClientError>;
}

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Where and how to reach the PLC.
#[derive(Debug, Clone, PartialEq)]
pub struct PlcEndpoint {
    pub ip: String,
    pub port: u16,
    pub slave_id: u8,
    pub connect_timeout: Duration,
}

/// Client for the repair cell PLC.
pub struct PlcClient {
    endpoint: PlcEndpoint,
    connector: Box<dyn PlcConnector>,
    link: Mutex<Option<Box<dyn PlcLink>>>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(thiserror::Error, Debug)]
pub enum PlcClientError {
    #[error("The PLC is not connected")]
    NotConnected,

    #[error(transparent)]
    InvalidAddress(#[from] PlcAddressError),

    #[error("Could not connect to the PLC at {0}: {1}")]
    ConnectFailed(String, String),

    #[error("PLC transport error: {0}")]
    Transport(String),

    #[error("The PLC rejected the request: {0}")]
    Exception(String),

    #[error("Expected {expected} values from the PLC but got {found}")]
    ShortRead { expected: usize, found: usize },
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl From<&PlcParams> for PlcEndpoint {
    fn from(params: &PlcParams) -> Self {
        Self {
            ip: params.ip.clone(),
            port: params.port,
            slave_id: params.slave_id,
            connect_timeout: Duration::from_millis(params.connect_timeout_ms),
        }
    }
}

impl PlcClient {
    /// Create a client which reaches the PLC over Modbus TCP.
    pub fn new(params: &PlcParams) -> Self {
        Self::with_connector(params, Box::new(ModbusConnector))
    }

    /// Create a client using the given connector for the physical link.
    pub fn with_connector(params: &PlcParams, connector: Box<dyn PlcConnector>) -> Self {
        Self {
            endpoint: PlcEndpoint::from(params),
            connector,
            link: Mutex::new(None),
        }
    }

    /// Connect to the PLC. Connecting while connected does nothing.
    pub fn connect(&self) -> bool {
        let mut link = self.link();
        if link.is_some() {
            return true;
        }

        match self.connector.connect(&self.endpoint) {
            Ok(l) => {
                *link = Some(l);
                info!(
                    "Connected to PLC at {}:{} (slave {})",
                    self.endpoint.ip, self.endpoint.port, self.endpoint.slave_id
                );
                true
            }
            Err(e) => {
                warn!("PLC connection failed: {}", e);
                false
            }
        }
    }

    /// Drop the connection. Disconnecting while disconnected does nothing.
    pub fn disconnect(&self) {
        if self.link().take().is_some() {
            info!("Disconnected from PLC");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.link().is_some()
    }

    pub fn read_coil(&self, address: &str) -> Result<bool, PlcClientError> {
        self.with_link(|link| {
            let index = parse_coil_address(address)?;
            let values = link.read_coils(index, 1)?;
            let value = first(&values)?;
            trace!("{} -> {}", address, value);
            Ok(value)
        })
    }

    pub fn write_coil(&self, address: &str, value: bool) -> Result<(), PlcClientError> {
        self.with_link(|link| {
            let index = parse_coil_address(address)?;
            debug!("{} <- {}", address, value);
            link.write_coil(index, value)
        })
    }

    pub fn read_register(&self, address: &str) -> Result<i16, PlcClientError> {
        self.with_link(|link| {
            let index = parse_register_address(address)?;
            let words = link.read_holding_registers(index, 1)?;
            Ok(first(&words)? as i16)
        })
    }

    pub fn write_register(&self, address: &str, value: i16) -> Result<(), PlcClientError> {
        self.with_link(|link| {
            let index = parse_register_address(address)?;
            debug!("{} <- {}", address, value);
            link.write_register(index, value as u16)
        })
    }

    /// Read a float from the register at `address` and the one after it.
    pub fn read_register_float(&self, address: &str) -> Result<f32, PlcClientError> {
        self.with_link(|link| {
            let index = parse_register_address(address)?;
            let words = link.read_holding_registers(index, 2)?;
            if words.len() < 2 {
                return Err(PlcClientError::ShortRead {
                    expected: 2,
                    found: words.len(),
                });
            }
            Ok(plc::decode_float(words[0], words[1]))
        })
    }

    /// Write a float to the register at `address` and the one after it.
    pub fn write_register_float(&self, address: &str, value: f32) -> Result<(), PlcClientError> {
        self.with_link(|link| {
            let index = parse_register_address(address)?;
            let (high, low) = plc::encode_float(value);
            debug!("{} <- {}", address, value);
            link.write_registers(index, &[high, low])
        })
    }

    /// Current carriage target distance.
    pub fn get_spindle_position(&self) -> Result<f32, PlcClientError> {
        self.read_register_float(addresses::SPINDLE_POSITION)
    }

    fn link(&self) -> MutexGuard<'_, Option<Box<dyn PlcLink>>> {
        self.link.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` on the open link, holding the lock for the whole call.
    ///
    /// A transport failure drops the link, so the next [`PlcClient::connect`] opens a new one.
    fn with_link<T, F>(&self, f: F) -> Result<T, PlcClientError>
    where
        F: FnOnce(&mut dyn PlcLink) -> Result<T, PlcClientError>,
    {
        let mut guard = self.link();
        let result = match guard.as_mut() {
            Some(link) => f(link.as_mut()),
            None => return Err(PlcClientError::NotConnected),
        };

        if let Err(PlcClientError::Transport(ref e)) = result {
            warn!("PLC link lost ({}), it will be reopened on the next connect", e);
            *guard = None;
        }

        result
    }
}

// ------------------------------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ------------------------------------------------------------------------------------------------

fn first<T: Copy>(values: &[T]) -> Result<T, PlcClientError> {
    values.first().copied().ok_or(PlcClientError::ShortRead {
        expected: 1,
        found: 0,
    })
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------
