//! # Repair Orchestrator
//!
//! Sequences AGV navigation, PLC handshakes and break-point data into a complete repair cycle.
//!
//! A task for side `n` repairs both sides of the aisle the AGV parks in:
//!
//! 1. Navigate to the switch point of side `n` and wait for arrival
//! 2. Signal arrival to the PLC and wait for its feedback
//! 3. Repair every break point of side `n`
//! 4. Turn the carriage back and wait for the feedback
//! 5. Repair every break point of side `n + 1`
//! 6. Park the carriage at the switch-point spindle of side `n + 1`
//! 7. Navigate to the machine's wait point and wait for arrival
//!
//! Every step runs to completion before the next starts. Waits are polls bounded by
//! `max_poll_attempts`. Any error aborts the task: nothing is rolled back, the equipment stays
//! where it stopped.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

mod break_points;

pub use break_points::BreakPointSet;

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use comms_if::{msg::RepairTaskDescriptor, plc::addresses};
use log::{debug, error, info, warn};
use std::{
    sync::{Arc, Mutex},
    thread,
};

use crate::{
    agv_client::AgvClient,
    cache::{CacheError, SpindleCache},
    data::{DataError, DataSource},
    params::WorkflowParams,
    plc_client::{PlcClient, PlcClientError},
};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// The workflow engine.
pub struct RepairOrchestrator {
    agv: Arc<AgvClient>,
    plc: Arc<PlcClient>,
    data: Arc<dyn DataSource>,
    cache: Arc<dyn SpindleCache>,

    params: WorkflowParams,

    /// Machine whose wait point ends every task
    machine_id: String,

    state: WorkflowMonitor,
}

/// Read-only view of an orchestrator's state, shareable with other threads.
#[derive(Debug, Clone, Default)]
pub struct WorkflowMonitor {
    state: Arc<Mutex<WorkflowState>>,
}

/// Spindles handled while processing one side.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SideSummary {
    pub side_number: u32,
    pub repaired: Vec<u32>,
    pub missed: Vec<u32>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowState {
    Idle,
    NavigatingToSwitchPoint,
    AwaitingSwitchPointFeedback,
    ProcessingSide(u32),
    TurningBack,
    AwaitingTurnBackFeedback,
    NavigatingToWaitSwitchValue(u32),
    NavigatingToWaitPoint,
    AwaitingWaitPointArrival,
    Failed,
}

/// Result of handling a single spindle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpindleOutcome {
    Repaired,

    /// No cached distance for the spindle, nothing was sent to the PLC
    Missed,
}

#[derive(thiserror::Error, Debug)]
pub enum WorkflowError {
    #[error("The AGV could not be sent to point {0}")]
    NavigationFailed(u32),

    #[error("Side {0} has no opposite side")]
    NoOppositeSide(u32),

    #[error("No switch point is known for side {0}")]
    NoSwitchPoint(u32),

    #[error("No wait point is known for machine {0}")]
    NoWaitPoint(String),

    #[error("PLC error: {0}")]
    Plc(#[from] PlcClientError),

    #[error("Data source error: {0}")]
    Data(#[from] DataError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Timed out waiting for {condition} after {attempts} polls")]
    Timeout { condition: String, attempts: u32 },
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl RepairOrchestrator {
    pub fn new(
        agv: Arc<AgvClient>,
        plc: Arc<PlcClient>,
        data: Arc<dyn DataSource>,
        cache: Arc<dyn SpindleCache>,
        params: WorkflowParams,
        machine_id: &str,
    ) -> Self {
        Self {
            agv,
            plc,
            data,
            cache,
            params,
            machine_id: machine_id.to_string(),
            state: WorkflowMonitor::default(),
        }
    }

    /// Get a handle which follows the state of this orchestrator.
    pub fn monitor(&self) -> WorkflowMonitor {
        self.state.clone()
    }

    pub fn state(&self) -> WorkflowState {
        self.state.get()
    }

    /// Run a complete repair task.
    ///
    /// Returns to `Idle` on success. On error the state is left `Failed` and the error returned.
    pub fn execute_repair_task(&self, task: &RepairTaskDescriptor) -> Result<(), WorkflowError> {
        info!(
            "Starting repair task {} for side {}",
            task.task_id, task.side_number
        );

        match self.run_task(task.side_number) {
            Ok(()) => {
                self.state.set(WorkflowState::Idle);
                info!("Repair task {} complete", task.task_id);
                Ok(())
            }
            Err(e) => {
                self.state.set(WorkflowState::Failed);
                error!("Repair task {} aborted: {}", task.task_id, e);
                Err(e)
            }
        }
    }

    /// Repair every break point of a side.
    ///
    /// The side's distances and break values are loaded into the cache first. A side without
    /// break points is skipped.
    pub fn process_all_break_points(&self, side_number: u32) -> Result<SideSummary, WorkflowError> {
        self.state.set(WorkflowState::ProcessingSide(side_number));

        let mut break_points = self.load_break_points(side_number)?;
        let mut summary = SideSummary {
            side_number,
            ..Default::default()
        };

        if break_points.is_empty() {
            info!("No break points on side {}", side_number);
            return Ok(summary);
        }

        info!(
            "Side {} has {} break points: {:?}",
            side_number,
            break_points.len(),
            break_points.spindles()
        );

        while let Some(spindle) = break_points.pop_first() {
            match self.process_single_break_point(side_number, spindle)? {
                SpindleOutcome::Repaired => summary.repaired.push(spindle),
                SpindleOutcome::Missed => summary.missed.push(spindle),
            }
        }

        info!(
            "Side {} done, repaired {:?}, missed {:?}",
            side_number, summary.repaired, summary.missed
        );

        Ok(summary)
    }

    /// Move the carriage to a spindle and run the rollers over it.
    pub fn process_single_break_point(
        &self,
        side_number: u32,
        spindle: u32,
    ) -> Result<SpindleOutcome, WorkflowError> {
        if !self.move_to_spindle(side_number, spindle)? {
            return Ok(SpindleOutcome::Missed);
        }

        let roller = self.params.roller_for_side(side_number);
        debug!("Triggering rollers ({}) at spindle {}", roller, spindle);
        self.plc.write_coil(addresses::TRIGGER_ROLLERS, roller)?;
        self.poll_coil(addresses::REPAIR_DONE, "repair done")?;

        info!("Spindle {} on side {} repaired", spindle, side_number);
        Ok(SpindleOutcome::Repaired)
    }

    /// Move the carriage to a spindle without repairing it.
    pub fn write_switch_point_value(
        &self,
        side_number: u32,
        spindle: u32,
    ) -> Result<SpindleOutcome, WorkflowError> {
        if self.move_to_spindle(side_number, spindle)? {
            Ok(SpindleOutcome::Repaired)
        } else {
            Ok(SpindleOutcome::Missed)
        }
    }

    /// Load a side's break points, refreshing its cache snapshot.
    pub fn load_break_points(&self, side_number: u32) -> Result<BreakPointSet, WorkflowError> {
        let values = self.data.non_zero_break_values(side_number)?;
        let distances = self.data.distance_values(side_number)?;

        self.cache.replace_distance_values(side_number, &distances)?;
        self.cache.replace_side_break_values(side_number, &values)?;
        debug!(
            "Cached {} distances and {} break values for side {}",
            distances.len(),
            values.len(),
            side_number
        );

        Ok(BreakPointSet::new(
            side_number,
            &values,
            self.params.sort_for_side(side_number),
        ))
    }

    fn run_task(&self, side_number: u32) -> Result<(), WorkflowError> {
        let next_side = side_number
            .checked_add(1)
            .ok_or(WorkflowError::NoOppositeSide(side_number))?;

        // Reconnects if the PLC dropped since the last task
        if !self.plc.connect() {
            return Err(PlcClientError::NotConnected.into());
        }

        // Switch point of the side
        self.state.set(WorkflowState::NavigatingToSwitchPoint);
        let switch_point = self
            .data
            .switch_point_id(side_number)?
            .ok_or(WorkflowError::NoSwitchPoint(side_number))?;
        self.cache.replace_switch_point_id(side_number, switch_point)?;
        self.navigate_and_wait(
            switch_point,
            WorkflowState::NavigatingToSwitchPoint,
            "arrival at the switch point",
        )?;

        self.state.set(WorkflowState::AwaitingSwitchPointFeedback);
        self.plc.write_coil(addresses::SWITCH_POINT_ARRIVED, true)?;
        self.poll_coil(
            addresses::SWITCH_POINT_ARRIVED_FEEDBACK,
            "switch point feedback",
        )?;

        self.process_all_break_points(side_number)?;

        self.state.set(WorkflowState::TurningBack);
        self.plc.write_coil(addresses::TURN_BACK, true)?;
        self.state.set(WorkflowState::AwaitingTurnBackFeedback);
        self.poll_coil(addresses::TURN_BACK_FEEDBACK, "turn back feedback")?;

        // The opposite side of the aisle
        self.process_all_break_points(next_side)?;

        self.state
            .set(WorkflowState::NavigatingToWaitSwitchValue(next_side));
        if self.write_switch_point_value(next_side, self.params.park_spindle)?
            == SpindleOutcome::Missed
        {
            warn!("Carriage not parked, no distance for side {}", next_side);
        }

        self.state.set(WorkflowState::NavigatingToWaitPoint);
        let wait_point = self
            .data
            .wait_point_id(&self.machine_id)?
            .ok_or_else(|| WorkflowError::NoWaitPoint(self.machine_id.clone()))?;
        self.cache
            .replace_wait_point_id(&self.machine_id, wait_point)?;
        self.navigate_and_wait(
            wait_point,
            WorkflowState::AwaitingWaitPointArrival,
            "arrival at the wait point",
        )?;

        Ok(())
    }

    /// Write the spindle's distance and wait for the carriage to arrive there.
    ///
    /// Returns false if the spindle has no cached distance.
    fn move_to_spindle(&self, side_number: u32, spindle: u32) -> Result<bool, WorkflowError> {
        let distance = match self.cache.distance_value(side_number, spindle)? {
            Some(d) => d,
            None => {
                warn!(
                    "No distance cached for spindle {} on side {}, skipping it",
                    spindle, side_number
                );
                return Ok(false);
            }
        };

        debug!(
            "Moving carriage to spindle {} of side {} ({})",
            spindle, side_number, distance
        );
        self.plc
            .write_register_float(addresses::SPINDLE_POSITION, distance)?;
        self.plc.write_coil(addresses::MOVE_TO_SPINDLE, true)?;
        self.poll_coil(addresses::SPINDLE_ARRIVAL, "spindle arrival")?;

        Ok(true)
    }

    /// Send the AGV to a point, then enter `awaiting` and poll until it arrives.
    fn navigate_and_wait(
        &self,
        point_id: u32,
        awaiting: WorkflowState,
        condition: &str,
    ) -> Result<(), WorkflowError> {
        if !self.agv.navigate_to_point(point_id) {
            return Err(WorkflowError::NavigationFailed(point_id));
        }
        self.state.set(awaiting);

        let agv = &self.agv;
        self.poll_until(condition, || Ok(agv.has_reached_target()))
    }

    fn poll_coil(&self, address: &str, condition: &str) -> Result<(), WorkflowError> {
        let plc = &self.plc;
        self.poll_until(condition, || Ok(plc.read_coil(address)?))
    }

    /// Evaluate `check` until it holds, sleeping the poll interval between attempts.
    fn poll_until<F>(&self, condition: &str, mut check: F) -> Result<(), WorkflowError>
    where
        F: FnMut() -> Result<bool, WorkflowError>,
    {
        let attempts = self.params.max_poll_attempts.max(1);

        for attempt in 1..=attempts {
            if check()? {
                debug!("Got {} after {} polls", condition, attempt);
                return Ok(());
            }

            if attempt < attempts {
                thread::sleep(self.params.poll_interval());
            }
        }

        Err(WorkflowError::Timeout {
            condition: condition.to_string(),
            attempts,
        })
    }
}

impl WorkflowMonitor {
    pub fn get(&self) -> WorkflowState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Side currently being worked, 0 when idle.
    pub fn current_side(&self) -> u32 {
        match self.get() {
            WorkflowState::ProcessingSide(n) | WorkflowState::NavigatingToWaitSwitchValue(n) => n,
            _ => 0,
        }
    }

    fn set(&self, state: WorkflowState) {
        let mut current = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *current != state {
            debug!("Workflow state {:?} -> {:?}", *current, state);
            *current = state;
        }
    }
}

impl Default for WorkflowState {
    fn default() -> Self {
        WorkflowState::Idle
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        cache::MemoryCache,
        params::{AgvParams, PlcParams},
        sim::{PlcEvent, SimBackend, SimPlc},
    };
    use comms_if::plc::{encode_float, parse_coil_address};

    fn coil(address: &str) -> u16 {
        parse_coil_address(address).unwrap()
    }

    fn orchestrator(sim: &SimPlc, backend: SimBackend) -> RepairOrchestrator {
        let plc = PlcClient::with_connector(&PlcParams::default(), Box::new(sim.clone()));
        assert!(plc.connect());

        RepairOrchestrator::new(
            Arc::new(AgvClient::new(&AgvParams::default())),
            Arc::new(plc),
            Arc::new(backend),
            Arc::new(MemoryCache::new()),
            WorkflowParams {
                poll_interval_ms: 1,
                max_poll_attempts: 5,
                ..Default::default()
            },
            "MACHINE001",
        )
    }

    #[test]
    fn test_single_break_point_sequence() {
        let sim = SimPlc::repair_cell().unwrap();
        let orch = orchestrator(
            &sim,
            SimBackend::new().with_distances(3, &[100.0, 200.0, 300.0]),
        );
        orch.load_break_points(3).unwrap();

        assert_eq!(
            orch.process_single_break_point(3, 2).unwrap(),
            SpindleOutcome::Repaired
        );

        let (high, low) = encode_float(200.0);
        assert_eq!(
            sim.events(),
            vec![
                PlcEvent::RegistersWritten(500, vec![high, low]),
                PlcEvent::CoilWritten(coil(addresses::MOVE_TO_SPINDLE), true),
                // Odd side rollers
                PlcEvent::CoilWritten(coil(addresses::TRIGGER_ROLLERS), true),
            ]
        );
    }

    #[test]
    fn test_even_side_roller_value() {
        let sim = SimPlc::repair_cell().unwrap();
        let orch = orchestrator(&sim, SimBackend::new().with_distances(4, &[10.0]));
        orch.load_break_points(4).unwrap();

        orch.process_single_break_point(4, 1).unwrap();
        assert!(sim
            .events()
            .contains(&PlcEvent::CoilWritten(coil(addresses::TRIGGER_ROLLERS), false)));
    }

    #[test]
    fn test_missing_distance_is_spindle_local() {
        let sim = SimPlc::repair_cell().unwrap();
        let orch = orchestrator(
            &sim,
            SimBackend::new()
                .with_break_values(3, &[5, 1])
                .with_distances(3, &[10.0, 20.0]),
        );

        let summary = orch.process_all_break_points(3).unwrap();
        assert_eq!(summary.repaired, vec![1]);
        assert_eq!(summary.missed, vec![5]);

        // Nothing was sent for the missed spindle
        let moves = sim
            .events()
            .into_iter()
            .filter(|e| *e == PlcEvent::CoilWritten(coil(addresses::MOVE_TO_SPINDLE), true))
            .count();
        assert_eq!(moves, 1);
    }

    #[test]
    fn test_empty_side_is_skipped() {
        let sim = SimPlc::repair_cell().unwrap();
        let orch = orchestrator(&sim, SimBackend::new().with_break_values(5, &[0, 0]));

        let summary = orch.process_all_break_points(5).unwrap();
        assert!(summary.repaired.is_empty());
        assert!(summary.missed.is_empty());
        assert!(sim.events().is_empty());
    }

    #[test]
    fn test_poll_timeout() {
        // No reactions, the arrival coil never rises
        let sim = SimPlc::new();
        let orch = orchestrator(&sim, SimBackend::new().with_distances(1, &[10.0]));
        orch.load_break_points(1).unwrap();

        match orch.process_single_break_point(1, 1) {
            Err(WorkflowError::Timeout { attempts, .. }) => assert_eq!(attempts, 5),
            r => panic!("Expected a timeout, got {:?}", r),
        }
    }

    #[test]
    fn test_load_replaces_cache() {
        let sim = SimPlc::repair_cell().unwrap();
        let backend = SimBackend::new()
            .with_break_values(3, &[5, 0, 1, 3])
            .with_distances(3, &[1.0, 2.0]);
        let cache = Arc::new(MemoryCache::new());

        let plc = PlcClient::with_connector(&PlcParams::default(), Box::new(sim));
        let orch = RepairOrchestrator::new(
            Arc::new(AgvClient::new(&AgvParams::default())),
            Arc::new(plc),
            Arc::new(backend),
            cache.clone(),
            WorkflowParams::default(),
            "MACHINE001",
        );

        let set = orch.load_break_points(3).unwrap();
        assert_eq!(set.spindles(), vec![1, 3, 5]);
        assert_eq!(cache.side_break_values(3).unwrap(), vec![5, 1, 3]);
        assert_eq!(cache.distance_value(3, 2).unwrap(), Some(2.0));
    }

    #[test]
    fn test_failed_task_state() {
        let sim = SimPlc::repair_cell().unwrap();
        // No switch point for side 7
        let orch = orchestrator(&sim, SimBackend::new());
        let monitor = orch.monitor();

        let task = RepairTaskDescriptor {
            side_number: 7,
            task_id: comms_if::msg::TaskId::Number(1),
            origin: Default::default(),
        };

        match orch.execute_repair_task(&task) {
            Err(WorkflowError::NoSwitchPoint(7)) => (),
            r => panic!("Expected NoSwitchPoint, got {:?}", r),
        }
        assert_eq!(monitor.get(), WorkflowState::Failed);
        assert_eq!(monitor.current_side(), 0);
    }

    #[test]
    fn test_last_side_has_no_opposite() {
        let sim = SimPlc::repair_cell().unwrap();
        let orch = orchestrator(&sim, SimBackend::new().with_switch_point(u32::MAX, 4));

        let task = RepairTaskDescriptor {
            side_number: u32::MAX,
            task_id: comms_if::msg::TaskId::Number(2),
            origin: Default::default(),
        };

        match orch.execute_repair_task(&task) {
            Err(WorkflowError::NoOppositeSide(u32::MAX)) => (),
            r => panic!("Expected NoOppositeSide, got {:?}", r),
        }
        assert!(sim.events().is_empty());
    }

    #[test]
    fn test_task_caches_points() {
        let sim = SimPlc::repair_cell().unwrap();
        let agv = crate::sim::SimAgv::spawn().unwrap();
        let plc = PlcClient::with_connector(&PlcParams::default(), Box::new(sim));
        let cache = Arc::new(MemoryCache::new());

        let orch = RepairOrchestrator::new(
            Arc::new(AgvClient::new(&AgvParams {
                ip: "127.0.0.1".into(),
                port: agv.port(),
                recv_timeout_ms: 200,
            })),
            Arc::new(plc),
            Arc::new(
                SimBackend::new()
                    .with_switch_point(1, 1001)
                    .with_wait_point("MACHINE001", 2001),
            ),
            cache.clone(),
            WorkflowParams {
                poll_interval_ms: 1,
                max_poll_attempts: 50,
                ..Default::default()
            },
            "MACHINE001",
        );

        let task = RepairTaskDescriptor {
            side_number: 1,
            task_id: comms_if::msg::TaskId::Number(3),
            origin: Default::default(),
        };
        orch.execute_repair_task(&task).unwrap();

        assert_eq!(cache.switch_point_id(1).unwrap(), Some(1001));
        assert_eq!(cache.wait_point_id("MACHINE001").unwrap(), Some(2001));
    }
}
