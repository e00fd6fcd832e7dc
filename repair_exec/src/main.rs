//! Main repair executable entry point.
//!
//! # Architecture
//!
//! The executable runs four threads:
//!
//!     - Main thread: receives envelopes from the broker and dispatches them
//!     - Broker I/O thread: owns the ZMQ socket
//!     - Task worker: runs repair tasks one at a time
//!     - Status reporter: publishes periodic status records
//!
//! The AGV and PLC clients are shared between the task worker and the status reporter, each
//! client serialises its own traffic.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use color_eyre::{eyre::WrapErr, Report};
use log::{error, info, warn};
use std::{fs, path::Path, sync::Arc, time::Duration};
use structopt::StructOpt;

// Internal
use comms_if::net::zmq;
use repair_lib::{
    agv_client::AgvClient,
    broker_client::{self, BrokerClient, EnvelopeSink},
    cache::SqliteCache,
    data::SqliteDataSource,
    dispatcher::{Dispatcher, TaskWorker},
    orchestrator::RepairOrchestrator,
    params::RepairExecParams,
    plc_client::PlcClient,
    status_reporter::{StatusReporter, StatusSampler},
};
use util::{
    host,
    logger::{logger_init, LevelFilter},
    session::Session,
};

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// How long the main loop waits for an inbound envelope before checking the broker again.
const RECV_PERIOD: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// STRUCTS
// ---------------------------------------------------------------------------

#[derive(Debug, StructOpt)]
#[structopt(name = "repair_exec", about = "Yarn-break repair executive")]
struct Opt {
    /// Parameter file, relative to the params directory of the software root
    #[structopt(short, long, default_value = "repair_exec.toml")]
    params: String,

    /// Minimum log level, at least `info`
    #[structopt(short, long, default_value = "debug")]
    log_level: LevelFilter,
}

// ---------------------------------------------------------------------------
// FUNCTIONS
// ---------------------------------------------------------------------------

/// Executable main function, entry point.
fn main() -> Result<(), Report> {
    color_eyre::install()?;

    let opt = Opt::from_args();

    // ---- EARLY INITIALISATION ----

    let session =
        Session::new("repair_exec", "sessions").wrap_err("Failed to create the session")?;

    logger_init(opt.log_level, &session).wrap_err("Failed to initialise logging")?;

    info!("YarnGuardian Repair Executable\n");
    info!("Session directory: {:?}\n", session.session_root);

    // ---- LOAD PARAMETERS ----

    let params: RepairExecParams = util::params::load(&opt.params)
        .wrap_err_with(|| format!("Could not load the parameter file {}", opt.params))?;

    info!(
        "Robot {} serving machine {}",
        params.robot_id, params.machine_id
    );

    // ---- INITIALISE STORAGE ----

    let sw_root = host::get_sw_root().wrap_err("Failed to get the software root")?;

    let data_source_path = sw_root.join(&params.storage.data_source_path);
    let data = SqliteDataSource::open(&data_source_path).wrap_err_with(|| {
        format!("Could not open the data source at {:?}", data_source_path)
    })?;
    info!("Data source opened at {:?}", data_source_path);

    let cache_path = sw_root.join(&params.storage.cache_path);
    create_parent_dir(&cache_path)?;
    let cache = SqliteCache::open(&cache_path)
        .wrap_err_with(|| format!("Could not open the cache at {:?}", cache_path))?;
    info!("Cache opened at {:?}", cache_path);

    // ---- INITIALISE EQUIPMENT ----

    let agv = Arc::new(AgvClient::new(&params.agv));
    agv.start().wrap_err("Failed to start the AGV client")?;

    let plc = Arc::new(PlcClient::new(&params.plc));
    if !plc.connect() {
        warn!("PLC not reachable yet, connection will be retried when a task starts");
    }

    let orchestrator = RepairOrchestrator::new(
        agv.clone(),
        plc.clone(),
        Arc::new(data),
        Arc::new(cache),
        params.workflow.clone(),
        &params.machine_id,
    );

    // ---- INITIALISE NETWORK ----

    let zmq_ctx = zmq::Context::new();

    let broker = Arc::new(
        BrokerClient::new(&zmq_ctx, &params.broker)
            .wrap_err("Failed to initialise the BrokerClient")?,
    );
    info!("BrokerClient initialised");

    broker
        .send(broker_client::start_envelope(&params.machine_id))
        .wrap_err("Could not send the start request")?;

    let sink: Arc<dyn EnvelopeSink> = broker.clone();

    let reporter = Arc::new(StatusReporter::new(
        StatusSampler::new(
            &params.robot_id,
            agv.clone(),
            plc.clone(),
            orchestrator.monitor(),
        ),
        sink.clone(),
        Duration::from_millis(params.status.interval_ms),
    ));
    if params.status.report_on_start {
        reporter.start();
    }

    let worker = TaskWorker::spawn(orchestrator, sink.clone());
    let mut dispatcher = Dispatcher::new(sink, reporter.clone(), worker);

    info!("Initialisation complete, waiting for tasks\n");

    // ---- MAIN LOOP ----

    loop {
        match broker.recv_timeout(RECV_PERIOD) {
            Ok(Some(envelope)) => {
                let result = dispatcher.dispatch(&envelope);
                if !result.is_ok() {
                    warn!(
                        "{}/{} not handled: {}",
                        envelope.module, envelope.service, result.message
                    );
                }
            }
            Ok(None) => (),
            Err(e) => {
                error!("Broker link lost: {}", e);
                break;
            }
        }
    }

    // ---- SHUTDOWN ----

    info!("Shutting down");

    reporter.stop();
    dispatcher.shutdown();
    broker.shutdown();
    agv.stop();
    plc.disconnect();

    info!("End of execution");

    Ok(())
}

fn create_parent_dir(path: &Path) -> Result<(), Report> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .wrap_err_with(|| format!("Could not create the directory {:?}", parent))?;
    }
    Ok(())
}
