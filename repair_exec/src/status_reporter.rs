//! # Status Reporter
//!
//! Samples the AGV, the PLC and the workflow state and publishes a [`StatusRecord`] to the
//! backend, either once on request or periodically from a background thread.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use chrono::Utc;
use comms_if::msg::{
    service, Envelope, SideLocation, StatusRecord, MODULE_AGV, STATUS_RECORD_TYPE,
};
use log::{debug, info, warn};
use std::{
    sync::{
        mpsc::{self, RecvTimeoutError, Sender},
        Arc, Mutex, MutexGuard,
    },
    thread,
    time::Duration,
};

use crate::{
    agv_client::AgvClient,
    broker_client::{BrokerClientError, EnvelopeSink},
    orchestrator::WorkflowMonitor,
    plc_client::PlcClient,
};

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Status reported by a running robot.
pub const STATUS_WORKING: &str = "working";

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Builds status records from the current state of the equipment.
pub struct StatusSampler {
    robot_id: String,
    agv: Arc<AgvClient>,
    plc: Arc<PlcClient>,
    workflow: WorkflowMonitor,
}

/// Publishes status records.
pub struct StatusReporter {
    sampler: Arc<StatusSampler>,
    sink: Arc<dyn EnvelopeSink>,
    interval: Duration,
    thread: Mutex<Option<ReporterThread>>,
}

struct ReporterThread {
    stop_tx: Sender<()>,
    join_handle: thread::JoinHandle<()>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StatusReporterError {
    #[error("Could not serialize the status record: {0}")]
    SerializationError(serde_json::Error),

    #[error("Could not send the status record: {0}")]
    SendError(BrokerClientError),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl StatusSampler {
    pub fn new(
        robot_id: &str,
        agv: Arc<AgvClient>,
        plc: Arc<PlcClient>,
        workflow: WorkflowMonitor,
    ) -> Self {
        Self {
            robot_id: robot_id.to_string(),
            agv,
            plc,
            workflow,
        }
    }

    /// Take one sample.
    ///
    /// Values which cannot be read are reported as zero or empty.
    pub fn sample(&self) -> StatusRecord {
        let agv_status = self.agv.query_detailed_status();

        let current_position = match self.plc.get_spindle_position() {
            Ok(p) => p.to_string(),
            Err(e) => {
                debug!("Spindle position unavailable: {}", e);
                String::new()
            }
        };

        let side = self.workflow.current_side();
        let direction = SideLocation::from_side(side)
            .map(|l| l.device.as_str().to_string())
            .unwrap_or_default();

        StatusRecord {
            record_type: STATUS_RECORD_TYPE.to_string(),
            robot_id: self.robot_id.clone(),
            time_stamp: Utc::now(),
            status: STATUS_WORKING.to_string(),
            power: agv_status.battery_soc.unwrap_or(0.0),
            current_lane_id: side,
            current_position,
            direction,
            speed: agv_status.vx.unwrap_or(0.0),
        }
    }
}

impl StatusReporter {
    pub fn new(
        sampler: StatusSampler,
        sink: Arc<dyn EnvelopeSink>,
        interval: Duration,
    ) -> Self {
        Self {
            sampler: Arc::new(sampler),
            sink,
            interval,
            thread: Mutex::new(None),
        }
    }

    /// Sample and send a single status record.
    pub fn report_once(&self) -> Result<(), StatusReporterError> {
        report(&self.sampler, self.sink.as_ref())
    }

    /// Start periodic reporting. Does nothing if already running.
    pub fn start(&self) {
        let mut running = self.thread();
        if running.is_some() {
            return;
        }

        let (stop_tx, stop_rx) = mpsc::channel();
        let sampler = self.sampler.clone();
        let sink = self.sink.clone();
        let interval = self.interval;

        let join_handle = thread::spawn(move || loop {
            if let Err(e) = report(&sampler, sink.as_ref()) {
                warn!("Status report failed: {}", e);
            }

            // Either a stop request or the sender being dropped ends the loop
            match stop_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => continue,
                _ => break,
            }
        });

        *running = Some(ReporterThread {
            stop_tx,
            join_handle,
        });
        info!("Periodic status reporting started, every {:?}", self.interval);
    }

    /// Stop periodic reporting and wait for the thread to exit.
    pub fn stop(&self) {
        let reporter = self.thread().take();
        if let Some(r) = reporter {
            r.stop_tx.send(()).ok();
            r.join_handle.join().ok();
            info!("Periodic status reporting stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread().is_some()
    }

    fn thread(&self) -> MutexGuard<'_, Option<ReporterThread>> {
        self.thread.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for StatusReporter {
    fn drop(&mut self) {
        self.stop();
    }
}

// ------------------------------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ------------------------------------------------------------------------------------------------

fn report(sampler: &StatusSampler, sink: &dyn EnvelopeSink) -> Result<(), StatusReporterError> {
    let record = sampler.sample();

    let envelope = Envelope::new(MODULE_AGV, service::STATUS_REPORT)
        .with_content(&record)
        .map_err(StatusReporterError::SerializationError)?
        .success("");

    sink.send(envelope).map_err(StatusReporterError::SendError)
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------
