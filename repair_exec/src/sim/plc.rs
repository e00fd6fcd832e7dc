//! Simulated PLC.
//!
//! Holds coils and registers in memory. Reactions model the PLC program's handshakes: writing a
//! trigger coil clears every feedback coil and raises the one paired with the trigger.

use comms_if::plc::{addresses, parse_coil_address, PlcAddressError};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use crate::plc_client::{PlcClientError, PlcConnector, PlcEndpoint, PlcLink};

/// A write seen by the simulated PLC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlcEvent {
    CoilWritten(u16, bool),
    RegistersWritten(u16, Vec<u16>),
}

/// Simulated PLC. Clones share the same memory.
#[derive(Clone, Default)]
pub struct SimPlc {
    state: Arc<Mutex<SimPlcState>>,
}

#[derive(Default)]
struct SimPlcState {
    coils: HashMap<u16, bool>,
    registers: HashMap<u16, u16>,
    events: Vec<PlcEvent>,

    /// Trigger coil to feedback coil
    reactions: HashMap<u16, u16>,

    refuse_connections: bool,
    connections: usize,
}

struct SimPlcLink {
    state: Arc<Mutex<SimPlcState>>,
}

impl SimPlc {
    /// A PLC with no reactions.
    pub fn new() -> Self {
        Self::default()
    }

    /// A PLC answering every handshake of the repair cell immediately.
    pub fn repair_cell() -> Result<Self, PlcAddressError> {
        let sim = Self::new();
        sim.react(
            addresses::SWITCH_POINT_ARRIVED,
            addresses::SWITCH_POINT_ARRIVED_FEEDBACK,
        )?;
        sim.react(addresses::MOVE_TO_SPINDLE, addresses::SPINDLE_ARRIVAL)?;
        sim.react(addresses::TRIGGER_ROLLERS, addresses::REPAIR_DONE)?;
        sim.react(addresses::TURN_BACK, addresses::TURN_BACK_FEEDBACK)?;
        Ok(sim)
    }

    /// Raise `feedback` whenever `trigger` is written. Both are coil addresses.
    pub fn react(&self, trigger: &str, feedback: &str) -> Result<(), PlcAddressError> {
        let trigger = parse_coil_address(trigger)?;
        let feedback = parse_coil_address(feedback)?;
        self.lock().reactions.insert(trigger, feedback);
        Ok(())
    }

    /// Make future connection attempts fail.
    pub fn refuse_connections(&self, refuse: bool) {
        self.lock().refuse_connections = refuse;
    }

    pub fn connection_count(&self) -> usize {
        self.lock().connections
    }

    pub fn coil(&self, index: u16) -> bool {
        self.lock().coils.get(&index).copied().unwrap_or(false)
    }

    pub fn set_coil(&self, index: u16, value: bool) {
        self.lock().coils.insert(index, value);
    }

    pub fn register(&self, index: u16) -> u16 {
        self.lock().registers.get(&index).copied().unwrap_or(0)
    }

    /// Every write received, in order.
    pub fn events(&self) -> Vec<PlcEvent> {
        self.lock().events.clone()
    }

    fn lock(&self) -> MutexGuard<'_, SimPlcState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl PlcConnector for SimPlc {
    fn connect(&self, endpoint: &PlcEndpoint) -> Result<Box<dyn PlcLink>, PlcClientError> {
        let mut state = self.lock();
        if state.refuse_connections {
            return Err(PlcClientError::ConnectFailed(
                format!("{}:{}", endpoint.ip, endpoint.port),
                "connection refused".into(),
            ));
        }
        state.connections += 1;

        Ok(Box::new(SimPlcLink {
            state: self.state.clone(),
        }))
    }
}

impl SimPlcLink {
    fn lock(&self) -> MutexGuard<'_, SimPlcState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl PlcLink for SimPlcLink {
    fn read_coils(&mut self, index: u16, count: u16) -> Result<Vec<bool>, PlcClientError> {
        let state = self.lock();
        Ok((index..index + count)
            .map(|i| state.coils.get(&i).copied().unwrap_or(false))
            .collect())
    }

    fn write_coil(&mut self, index: u16, value: bool) -> Result<(), PlcClientError> {
        let mut state = self.lock();
        state.events.push(PlcEvent::CoilWritten(index, value));
        state.coils.insert(index, value);

        if let Some(feedback) = state.reactions.get(&index).copied() {
            let all_feedback: Vec<u16> = state.reactions.values().copied().collect();
            for f in all_feedback {
                state.coils.insert(f, false);
            }
            state.coils.insert(feedback, true);
        }

        Ok(())
    }

    fn read_holding_registers(
        &mut self,
        index: u16,
        count: u16,
    ) -> Result<Vec<u16>, PlcClientError> {
        let state = self.lock();
        Ok((index..index + count)
            .map(|i| state.registers.get(&i).copied().unwrap_or(0))
            .collect())
    }

    fn write_register(&mut self, index: u16, value: u16) -> Result<(), PlcClientError> {
        self.write_registers(index, &[value])
    }

    fn write_registers(&mut self, index: u16, values: &[u16]) -> Result<(), PlcClientError> {
        let mut state = self.lock();
        state
            .events
            .push(PlcEvent::RegistersWritten(index, values.to_vec()));
        for (i, v) in values.iter().enumerate() {
            state.registers.insert(index + i as u16, *v);
        }
        Ok(())
    }
}
