//! Complete repair tasks against the simulated AGV, PLC and backend.

use comms_if::{
    msg::{MessageOrigin, RepairTaskDescriptor, TaskId},
    plc::{addresses, encode_float, parse_coil_address},
};
use repair_lib::{
    agv_client::AgvClient,
    cache::{MemoryCache, SpindleCache, SqliteCache},
    orchestrator::{RepairOrchestrator, WorkflowError, WorkflowState},
    params::{AgvParams, PlcParams, WorkflowParams},
    plc_client::PlcClient,
    sim::{PlcEvent, SimAgv, SimBackend, SimPlc},
};
use std::sync::Arc;

const SWITCH_POINT: u32 = 1003;
const WAIT_POINT: u32 = 2001;
const MACHINE_ID: &str = "MACHINE002";

struct Cell {
    agv: SimAgv,
    plc: SimPlc,
    orchestrator: RepairOrchestrator,
}

fn backend() -> SimBackend {
    let side_3: Vec<f32> = (1..=10).map(|n| n as f32 * 10.0).collect();
    let side_4: Vec<f32> = (1..=10).map(|n| n as f32 * 100.0).collect();

    SimBackend::new()
        .with_switch_point(3, SWITCH_POINT)
        .with_wait_point(MACHINE_ID, WAIT_POINT)
        .with_break_values(3, &[7, 0, 2])
        .with_break_values(4, &[9])
        .with_distances(3, &side_3)
        .with_distances(4, &side_4)
}

fn cell(backend: SimBackend, cache: Arc<dyn SpindleCache>, max_poll_attempts: u32) -> Cell {
    let agv_sim = SimAgv::spawn().unwrap();
    agv_sim.set_travel_queries(2);
    let plc_sim = SimPlc::repair_cell().unwrap();

    let agv = AgvClient::new(&AgvParams {
        ip: "127.0.0.1".into(),
        port: agv_sim.port(),
        recv_timeout_ms: 100,
    });
    let plc = PlcClient::with_connector(&PlcParams::default(), Box::new(plc_sim.clone()));

    let orchestrator = RepairOrchestrator::new(
        Arc::new(agv),
        Arc::new(plc),
        Arc::new(backend),
        cache,
        WorkflowParams {
            poll_interval_ms: 5,
            max_poll_attempts,
            ..Default::default()
        },
        MACHINE_ID,
    );

    Cell {
        agv: agv_sim,
        plc: plc_sim,
        orchestrator,
    }
}

fn task(side_number: u32) -> RepairTaskDescriptor {
    RepairTaskDescriptor {
        side_number,
        task_id: TaskId::Text("T-1".into()),
        origin: MessageOrigin {
            client_id: 1,
            module: "schedule".into(),
            service: "start_repair_task".into(),
        },
    }
}

fn coil(address: &str, value: bool) -> PlcEvent {
    PlcEvent::CoilWritten(parse_coil_address(address).unwrap(), value)
}

fn position(distance: f32) -> PlcEvent {
    let (high, low) = encode_float(distance);
    PlcEvent::RegistersWritten(500, vec![high, low])
}

/// The writes made to visit and repair one spindle.
fn repair(distance: f32, roller: bool) -> Vec<PlcEvent> {
    vec![
        position(distance),
        coil(addresses::MOVE_TO_SPINDLE, true),
        coil(addresses::TRIGGER_ROLLERS, roller),
    ]
}

#[test]
fn test_full_task() {
    let cell = cell(backend(), Arc::new(MemoryCache::new()), 50);
    let monitor = cell.orchestrator.monitor();

    cell.orchestrator.execute_repair_task(&task(3)).unwrap();

    assert_eq!(cell.agv.navigations(), vec![SWITCH_POINT, WAIT_POINT]);

    let mut expected = vec![coil(addresses::SWITCH_POINT_ARRIVED, true)];
    // Side 3 ascending, odd side rollers
    expected.extend(repair(20.0, true));
    expected.extend(repair(70.0, true));
    expected.push(coil(addresses::TURN_BACK, true));
    // Side 4, even side rollers
    expected.extend(repair(900.0, false));
    // Parked at spindle 1 of side 4
    expected.push(position(100.0));
    expected.push(coil(addresses::MOVE_TO_SPINDLE, true));

    assert_eq!(cell.plc.events(), expected);
    assert_eq!(monitor.get(), WorkflowState::Idle);
    assert_eq!(monitor.current_side(), 0);
}

#[test]
fn test_full_task_with_sqlite_cache() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(SqliteCache::open(dir.path().join("cache.db")).unwrap());
    let cell = cell(backend(), cache.clone(), 50);

    cell.orchestrator.execute_repair_task(&task(3)).unwrap();

    // Both sides were snapshotted
    assert_eq!(cache.side_break_values(3).unwrap(), vec![7, 2]);
    assert_eq!(cache.side_break_values(4).unwrap(), vec![9]);
    assert_eq!(cache.distance_value(4, 9).unwrap(), Some(900.0));
}

#[test]
fn test_descending_even_side() {
    let backend = backend().with_break_values(4, &[2, 9, 5]);
    let cell = cell(backend, Arc::new(MemoryCache::new()), 50);

    cell.orchestrator.execute_repair_task(&task(3)).unwrap();

    let positions: Vec<PlcEvent> = cell
        .plc
        .events()
        .into_iter()
        .filter(|e| matches!(e, PlcEvent::RegistersWritten(..)))
        .collect();

    assert_eq!(
        positions,
        vec![
            position(20.0),
            position(70.0),
            position(900.0),
            position(500.0),
            position(200.0),
            position(100.0),
        ]
    );
}

#[test]
fn test_missing_wait_point_fails() {
    let side_3: Vec<f32> = vec![10.0, 20.0];
    let backend = SimBackend::new()
        .with_switch_point(3, SWITCH_POINT)
        .with_break_values(3, &[2])
        .with_distances(3, &side_3)
        .with_distances(4, &side_3);
    let cell = cell(backend, Arc::new(MemoryCache::new()), 50);

    match cell.orchestrator.execute_repair_task(&task(3)) {
        Err(WorkflowError::NoWaitPoint(m)) => assert_eq!(m, MACHINE_ID),
        r => panic!("Expected NoWaitPoint, got {:?}", r),
    }

    // The repair itself happened, only the return trip failed
    assert_eq!(cell.agv.navigations(), vec![SWITCH_POINT]);
    assert_eq!(cell.orchestrator.state(), WorkflowState::Failed);
}

#[test]
fn test_agv_never_arrives() {
    let cell = cell(backend(), Arc::new(MemoryCache::new()), 3);
    cell.agv.set_silent(true);

    match cell.orchestrator.execute_repair_task(&task(3)) {
        Err(WorkflowError::Timeout { attempts, .. }) => assert_eq!(attempts, 3),
        r => panic!("Expected a timeout, got {:?}", r),
    }

    // Nothing was signalled to the PLC
    assert!(cell.plc.events().is_empty());
}

#[test]
fn test_plc_unreachable() {
    let cell = cell(backend(), Arc::new(MemoryCache::new()), 50);
    cell.plc.refuse_connections(true);

    match cell.orchestrator.execute_repair_task(&task(3)) {
        Err(WorkflowError::Plc(_)) => (),
        r => panic!("Expected a PLC error, got {:?}", r),
    }
    assert!(cell.agv.navigations().is_empty());
}
