//! Envelope dispatch, from an inbound envelope to the replies sent back to the backend.

use comms_if::msg::{service, Envelope, StatusRecord, CODE_FAILURE, CODE_SUCCESS};
use repair_lib::{
    agv_client::AgvClient,
    broker_client::{ChannelSink, EnvelopeSink},
    cache::MemoryCache,
    dispatcher::{Dispatcher, TaskWorker, TASK_COMPLETE_MSG, TASK_RECEIVED_MSG},
    orchestrator::RepairOrchestrator,
    params::{AgvParams, PlcParams, WorkflowParams},
    plc_client::PlcClient,
    sim::{SimAgv, SimBackend, SimPlc},
    status_reporter::{StatusReporter, StatusSampler},
};
use serde_json::{json, Value};
use std::{
    sync::{mpsc::Receiver, Arc},
    time::Duration,
};

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

struct Harness {
    _agv: SimAgv,
    reporter: Arc<StatusReporter>,
    dispatcher: Dispatcher,
    replies: Receiver<Envelope>,
}

fn harness() -> Harness {
    let agv_sim = SimAgv::spawn().unwrap();
    let plc_sim = SimPlc::repair_cell().unwrap();

    let backend = SimBackend::new()
        .with_switch_point(1, 11)
        .with_wait_point("MACHINE001", 99)
        .with_break_values(1, &[3])
        .with_distances(1, &[1.0, 2.0, 3.0])
        .with_distances(2, &[4.0]);

    let agv = Arc::new(AgvClient::new(&AgvParams {
        ip: "127.0.0.1".into(),
        port: agv_sim.port(),
        recv_timeout_ms: 200,
    }));
    let plc = Arc::new(PlcClient::with_connector(
        &PlcParams::default(),
        Box::new(plc_sim),
    ));

    let orchestrator = RepairOrchestrator::new(
        agv.clone(),
        plc.clone(),
        Arc::new(backend),
        Arc::new(MemoryCache::new()),
        WorkflowParams {
            poll_interval_ms: 5,
            max_poll_attempts: 50,
            ..Default::default()
        },
        "MACHINE001",
    );

    let (sink, replies) = ChannelSink::new();
    let sink: Arc<dyn EnvelopeSink> = Arc::new(sink);

    let reporter = Arc::new(StatusReporter::new(
        StatusSampler::new("AGV001", agv, plc, orchestrator.monitor()),
        sink.clone(),
        Duration::from_millis(50),
    ));
    let worker = TaskWorker::spawn(orchestrator, sink.clone());

    Harness {
        _agv: agv_sim,
        reporter: reporter.clone(),
        dispatcher: Dispatcher::new(sink, reporter, worker),
        replies,
    }
}

fn envelope(module: &str, service: &str, content: Value) -> Envelope {
    Envelope {
        client_id: 12,
        module: module.into(),
        service: service.into(),
        content,
        ..Default::default()
    }
}

#[test]
fn test_repair_task_replies() {
    let h = harness();

    let result = h.dispatcher.dispatch(&envelope(
        "schedule",
        service::START_REPAIR_TASK,
        json!({"SideNumber": 1, "TaskId": "T-9"}),
    ));
    assert!(result.is_ok());

    // Acknowledged straight away
    let ack = h.replies.recv_timeout(REPLY_TIMEOUT).unwrap();
    assert_eq!(ack.client_id, 12);
    assert_eq!(ack.service, service::START_REPAIR_TASK);
    assert_eq!(ack.code, CODE_SUCCESS);
    assert_eq!(ack.msg, TASK_RECEIVED_MSG);

    // Then the outcome once the worker is done
    let done = h.replies.recv_timeout(REPLY_TIMEOUT).unwrap();
    assert_eq!(done.client_id, 12);
    assert_eq!(done.code, CODE_SUCCESS);
    assert_eq!(done.msg, TASK_COMPLETE_MSG);
    assert_eq!(done.content["TaskId"], "T-9");
    assert_eq!(done.content["SideNumber"], 1);
}

#[test]
fn test_failed_task_reply() {
    let h = harness();

    // No switch point is known for side 5
    let result = h.dispatcher.dispatch(&envelope(
        "agv",
        service::START_REPAIR_TASK,
        json!({"sideNumber": "5", "taskId": 40}),
    ));
    assert!(result.is_ok());

    let ack = h.replies.recv_timeout(REPLY_TIMEOUT).unwrap();
    assert_eq!(ack.msg, TASK_RECEIVED_MSG);

    let failed = h.replies.recv_timeout(REPLY_TIMEOUT).unwrap();
    assert_eq!(failed.code, CODE_FAILURE);
    assert!(failed.msg.contains("side 5"), "message was {}", failed.msg);
    assert_eq!(failed.content["TaskId"], 40);
}

#[test]
fn test_no_ack_without_worker() {
    let mut h = harness();
    h.dispatcher.shutdown();

    let result = h.dispatcher.dispatch(&envelope(
        "schedule",
        service::START_REPAIR_TASK,
        json!({"SideNumber": 1, "TaskId": "T-10"}),
    ));
    assert!(!result.is_ok());
    assert!(h.replies.try_recv().is_err());
}

#[test]
fn test_unknown_service() {
    let h = harness();

    let result = h
        .dispatcher
        .dispatch(&envelope("agv", "self_destruct", Value::Null));
    assert_eq!(result.code, 1);
    assert_eq!(result.message, "Unexpected Service! [self_destruct]");
    assert!(h.replies.try_recv().is_err());
}

#[test]
fn test_unhandled_module_and_bad_content() {
    let h = harness();

    let result = h
        .dispatcher
        .dispatch(&envelope("camera", service::STATUS_REPORT, Value::Null));
    assert!(!result.is_ok());

    let result = h.dispatcher.dispatch(&envelope(
        "schedule",
        service::START_REPAIR_TASK,
        json!({"SideNumber": "left"}),
    ));
    assert!(!result.is_ok());

    let result = h.dispatcher.dispatch(&envelope(
        "schedule",
        service::START_REPAIR_TASK,
        json!({"SideNumber": 0, "TaskId": 1}),
    ));
    assert!(!result.is_ok());

    // Rejected envelopes are never acknowledged
    assert!(h.replies.try_recv().is_err());
}

#[test]
fn test_status_report_on_request() {
    let h = harness();

    let result = h
        .dispatcher
        .dispatch(&envelope("agv", service::STATUS_REPORT, Value::Null));
    assert!(result.is_ok());

    let report = h.replies.recv_timeout(REPLY_TIMEOUT).unwrap();
    assert_eq!(report.service, service::STATUS_REPORT);

    let record: StatusRecord = serde_json::from_value(report.content).unwrap();
    assert_eq!(record.robot_id, "AGV001");
    // Simulated AGV starts with a full battery
    assert_eq!(record.power, 100.0);
}

#[test]
fn test_get_schedule_stops_reporting() {
    let h = harness();

    h.reporter.start();
    h.replies.recv_timeout(REPLY_TIMEOUT).unwrap();

    let result = h
        .dispatcher
        .dispatch(&envelope("schedule", service::GET_SCHEDULE, Value::Null));
    assert!(result.is_ok());
    assert!(!h.reporter.is_running());
}
