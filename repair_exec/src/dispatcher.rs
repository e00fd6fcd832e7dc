//! # Dispatcher
//!
//! Routes inbound envelopes to the part of the executive which handles them. Repair tasks run on
//! a dedicated worker thread, one at a time in arrival order, so the main loop keeps receiving
//! while a task is in progress.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use comms_if::msg::{Command, Envelope, RepairTaskDescriptor, TransferResult};
use log::{debug, info, warn};
use serde_json::json;
use std::{
    sync::{
        mpsc::{self, Receiver, Sender},
        Arc,
    },
    thread,
};

use crate::{
    broker_client::EnvelopeSink, orchestrator::RepairOrchestrator,
    status_reporter::StatusReporter,
};

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Acknowledgement sent as soon as a repair task is accepted.
pub const TASK_RECEIVED_MSG: &str = "Received";

pub const TASK_COMPLETE_MSG: &str = "Repair task complete";

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

pub struct Dispatcher {
    sink: Arc<dyn EnvelopeSink>,
    reporter: Arc<StatusReporter>,
    worker: TaskWorker,
}

/// Thread executing repair tasks.
pub struct TaskWorker {
    task_tx: Option<Sender<QueuedTask>>,
    join_handle: Option<thread::JoinHandle<()>>,
}

/// Hold on a queued task. The worker does not start the task until this is dropped.
pub struct TaskHold {
    _release: Sender<()>,
}

struct QueuedTask {
    task: RepairTaskDescriptor,
    hold: Receiver<()>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TaskWorkerError {
    #[error("The task worker is not running")]
    NotRunning,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Dispatcher {
    pub fn new(
        sink: Arc<dyn EnvelopeSink>,
        reporter: Arc<StatusReporter>,
        worker: TaskWorker,
    ) -> Self {
        Self {
            sink,
            reporter,
            worker,
        }
    }

    /// Handle one inbound envelope.
    ///
    /// The returned result says whether the envelope was accepted, not whether any task it
    /// started succeeded.
    pub fn dispatch(&self, envelope: &Envelope) -> TransferResult {
        let command = match Command::from_envelope(envelope) {
            Ok(c) => c,
            Err(e) => {
                warn!(
                    "Rejecting {}/{} envelope: {}",
                    envelope.module, envelope.service, e
                );
                return TransferResult::from(&e);
            }
        };

        debug!("Dispatching {:?}", command);

        match command {
            Command::GetSchedule => {
                self.reporter.stop();
                TransferResult::ok()
            }
            Command::StatusReport => match self.reporter.report_once() {
                Ok(()) => TransferResult::ok(),
                Err(e) => TransferResult::error(e),
            },
            Command::StartRepairTask(task) => {
                info!(
                    "Queueing repair task {} for side {}",
                    task.task_id, task.side_number
                );
                let ack = Envelope::reply_to(&task.origin).success(TASK_RECEIVED_MSG);
                let task_id = task.task_id.clone();

                // The hold keeps the outcome from overtaking the acknowledgement
                let hold = match self.worker.submit(task) {
                    Ok(h) => h,
                    Err(e) => {
                        warn!("Task {} not queued: {}", task_id, e);
                        return TransferResult::error(e);
                    }
                };

                if let Err(e) = self.sink.send(ack) {
                    warn!("Could not acknowledge task {}: {}", task_id, e);
                }
                drop(hold);

                TransferResult::ok()
            }
        }
    }

    /// Stop the task worker once its queued tasks are done.
    pub fn shutdown(&mut self) {
        self.worker.shutdown();
    }
}

impl TaskWorker {
    /// Start the worker. Outcomes of tasks are replied to their origin through `sink`.
    pub fn spawn(orchestrator: RepairOrchestrator, sink: Arc<dyn EnvelopeSink>) -> Self {
        let (task_tx, task_rx) = mpsc::channel::<QueuedTask>();

        let join_handle = thread::spawn(move || {
            for QueuedTask { task, hold } in task_rx {
                // Released by a drop, never by a message
                hold.recv().ok();

                let reply = match orchestrator.execute_repair_task(&task) {
                    Ok(()) => Envelope::reply_to(&task.origin).success(TASK_COMPLETE_MSG),
                    Err(e) => Envelope::reply_to(&task.origin).failure(&e.to_string()),
                };

                let content = json!({
                    "TaskId": task.task_id,
                    "SideNumber": task.side_number,
                });
                let reply = match reply.with_content(&content) {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("Could not attach the task to its reply: {}", e);
                        continue;
                    }
                };

                if let Err(e) = sink.send(reply) {
                    warn!("Could not report the outcome of task {}: {}", task.task_id, e);
                }
            }

            debug!("Task worker exiting");
        });

        Self {
            task_tx: Some(task_tx),
            join_handle: Some(join_handle),
        }
    }

    /// Queue a task for execution.
    ///
    /// The task starts once it reaches the front of the queue and the returned hold is dropped.
    pub fn submit(&self, task: RepairTaskDescriptor) -> Result<TaskHold, TaskWorkerError> {
        let tx = self.task_tx.as_ref().ok_or(TaskWorkerError::NotRunning)?;

        let (release, hold) = mpsc::channel();
        tx.send(QueuedTask { task, hold })
            .map_err(|_| TaskWorkerError::NotRunning)?;

        Ok(TaskHold { _release: release })
    }

    /// Close the queue and wait for the worker to finish the tasks already in it.
    pub fn shutdown(&mut self) {
        self.task_tx = None;
        if let Some(jh) = self.join_handle.take() {
            jh.join().ok();
        }
    }
}

impl Drop for TaskWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
