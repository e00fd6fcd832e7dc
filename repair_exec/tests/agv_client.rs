//! AGV client against the simulated AGV over localhost UDP.

use comms_if::agv::{AgvStatus, STATUS_IDLE};
use repair_lib::{agv_client::AgvClient, params::AgvParams, sim::SimAgv};

fn client_for(sim: &SimAgv, recv_timeout_ms: u64) -> AgvClient {
    AgvClient::new(&AgvParams {
        ip: "127.0.0.1".into(),
        port: sim.port(),
        recv_timeout_ms,
    })
}

#[test]
fn test_arrival_is_one_shot() {
    let sim = SimAgv::spawn().unwrap();
    let client = client_for(&sim, 1000);

    // Not tracking anything yet
    assert!(!client.has_reached_target());
    assert_eq!(sim.status_queries(), 0);

    assert!(client.navigate_to_point(42));
    assert_eq!(client.tracked_target(), Some(42));

    // The navigate acknowledgement is still waiting in the socket and must be skipped
    assert!(client.has_reached_target());
    assert_eq!(client.tracked_target(), None);
    assert_eq!(sim.navigations(), vec![42]);

    // Disarmed, and no further query sent
    let queries = sim.status_queries();
    assert!(!client.has_reached_target());
    assert_eq!(sim.status_queries(), queries);
}

#[test]
fn test_arrival_after_travel() {
    let sim = SimAgv::spawn().unwrap();
    sim.set_travel_queries(3);
    let client = client_for(&sim, 1000);

    assert!(client.navigate_to_point(1003));
    assert!(!client.has_reached_target());
    assert!(!client.has_reached_target());
    assert!(client.has_reached_target());
}

#[test]
fn test_idle_elsewhere_is_not_arrival() {
    let sim = SimAgv::spawn().unwrap();
    sim.set_travel_queries(1000);
    let client = client_for(&sim, 1000);

    assert!(client.navigate_to_point(5));

    // Idle, but at another point
    sim.set_status(AgvStatus {
        operational_status: Some(STATUS_IDLE),
        last_point_id: Some(4),
        ..sim.status()
    });
    assert!(!client.has_reached_target());
    assert_eq!(client.tracked_target(), Some(5));
}

#[test]
fn test_detailed_status() {
    let sim = SimAgv::spawn().unwrap();
    sim.set_status(AgvStatus {
        x: Some(12.5),
        y: Some(-3.25),
        vx: Some(0.75),
        battery_soc: Some(87.5),
        operational_status: Some(STATUS_IDLE),
        last_point_id: Some(77),
    });
    let client = client_for(&sim, 1000);

    let status = client.query_detailed_status();
    assert_eq!(status.x, Some(12.5));
    assert_eq!(status.y, Some(-3.25));
    assert_eq!(status.vx, Some(0.75));
    assert_eq!(status.battery_soc, Some(87.5));
    assert_eq!(status.last_point_id, Some(77));
    assert!(status.is_idle());
}

#[test]
fn test_silent_agv_gives_empty_status() {
    let sim = SimAgv::spawn().unwrap();
    sim.set_silent(true);
    let client = client_for(&sim, 100);

    assert_eq!(client.query_detailed_status(), AgvStatus::default());

    assert!(client.navigate_to_point(3));
    assert!(!client.has_reached_target());

    // Still tracking, a reply may come later
    assert_eq!(client.tracked_target(), Some(3));
}

#[test]
fn test_explicit_configure() {
    let sim = SimAgv::spawn().unwrap();

    // Defaults point nowhere useful
    let client = AgvClient::new(&AgvParams {
        ip: "127.0.0.1".into(),
        port: 1,
        recv_timeout_ms: 500,
    });
    assert!(client.configure("not an ip", 17804).is_err());

    client.configure("127.0.0.1", sim.port()).unwrap();
    assert!(client.navigate_to_point(8));
    assert_eq!(sim_navigations_eventually(&sim, 1), vec![8]);

    client.stop();
    assert_eq!(client.tracked_target(), None);

    // Reopened on the configured endpoint, not the default one
    assert!(client.navigate_to_point(9));
    assert_eq!(sim_navigations_eventually(&sim, 2), vec![8, 9]);
}

/// Navigations are recorded by the simulator thread, wait for them to show up.
fn sim_navigations_eventually(sim: &SimAgv, count: usize) -> Vec<u32> {
    for _ in 0..100 {
        let navs = sim.navigations();
        if navs.len() >= count {
            return navs;
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    sim.navigations()
}
