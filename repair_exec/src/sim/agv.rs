//! Simulated AGV controller.
//!
//! Navigation takes a configurable number of status queries to complete, after which the AGV
//! reports itself idle at the target point.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use comms_if::agv::{
    decode_navigate_target, encode_status_response, AgvStatus, CommandCode, FrameHeader,
    STATUS_IDLE,
};
use log::{debug, warn};
use std::{
    io,
    net::{SocketAddr, UdpSocket},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    thread,
    time::Duration,
};

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Operational status reported while driving.
const STATUS_RUNNING: u8 = 0x02;

const POLL_TIMEOUT: Duration = Duration::from_millis(50);

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// A simulated AGV listening on `127.0.0.1`.
pub struct SimAgv {
    addr: SocketAddr,
    state: Arc<Mutex<SimAgvState>>,
    run: Arc<AtomicBool>,
    join_handle: Option<thread::JoinHandle<()>>,
}

struct SimAgvState {
    status: AgvStatus,

    /// Targets of every navigate command received
    navigations: Vec<u32>,

    status_queries: usize,

    /// Queries a navigation takes to complete
    travel_queries: u32,

    /// Target being driven to and the queries left before arrival
    driving: Option<(u32, u32)>,

    /// When set no replies are sent
    silent: bool,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(thiserror::Error, Debug)]
pub enum SimAgvError {
    #[error("Could not bind the simulated AGV socket: {0}")]
    BindError(io::Error),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl SimAgv {
    /// Start a simulated AGV on an ephemeral local port.
    ///
    /// The AGV starts idle at point 0 with a full battery.
    pub fn spawn() -> Result<Self, SimAgvError> {
        let socket = UdpSocket::bind("127.0.0.1:0").map_err(SimAgvError::BindError)?;
        socket
            .set_read_timeout(Some(POLL_TIMEOUT))
            .map_err(SimAgvError::BindError)?;
        let addr = socket.local_addr().map_err(SimAgvError::BindError)?;

        let state = Arc::new(Mutex::new(SimAgvState {
            status: AgvStatus {
                x: Some(0.0),
                y: Some(0.0),
                vx: Some(0.0),
                battery_soc: Some(100.0),
                operational_status: Some(STATUS_IDLE),
                last_point_id: Some(0),
            },
            navigations: Vec::new(),
            status_queries: 0,
            travel_queries: 1,
            driving: None,
            silent: false,
        }));
        let run = Arc::new(AtomicBool::new(true));

        let state_clone = state.clone();
        let run_clone = run.clone();
        let join_handle = thread::spawn(move || serve(socket, state_clone, run_clone));

        Ok(Self {
            addr,
            state,
            run,
            join_handle: Some(join_handle),
        })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Set how many status queries a navigation takes before the AGV arrives.
    pub fn set_travel_queries(&self, queries: u32) {
        lock(&self.state).travel_queries = queries;
    }

    /// Stop (or resume) replying to requests.
    pub fn set_silent(&self, silent: bool) {
        lock(&self.state).silent = silent;
    }

    /// Overwrite the reported status.
    pub fn set_status(&self, status: AgvStatus) {
        lock(&self.state).status = status;
    }

    pub fn status(&self) -> AgvStatus {
        lock(&self.state).status
    }

    /// Targets of all navigate commands received so far.
    pub fn navigations(&self) -> Vec<u32> {
        lock(&self.state).navigations.clone()
    }

    pub fn status_queries(&self) -> usize {
        lock(&self.state).status_queries
    }
}

impl Drop for SimAgv {
    fn drop(&mut self) {
        self.run.store(false, Ordering::Relaxed);
        if let Some(jh) = self.join_handle.take() {
            jh.join().ok();
        }
    }
}

impl SimAgvState {
    fn handle(&mut self, request: &[u8]) -> Option<Vec<u8>> {
        let header = match FrameHeader::parse(request) {
            Ok(h) => h,
            Err(e) => {
                warn!("Simulated AGV got a bad frame: {}", e);
                return None;
            }
        };

        if header.command == CommandCode::Navigate.to_byte() {
            let target = match decode_navigate_target(request) {
                Ok(t) => t,
                Err(e) => {
                    warn!("Simulated AGV got a bad navigate frame: {}", e);
                    return None;
                }
            };
            debug!("Simulated AGV driving to {}", target);

            self.navigations.push(target);
            self.driving = Some((target, self.travel_queries));
            self.status.operational_status = Some(STATUS_RUNNING);
            self.status.vx = Some(0.5);

            // Acknowledge with an empty response
            let ack = FrameHeader::response(header.sequence, CommandCode::Navigate, 0);
            return Some(ack.to_bytes().to_vec());
        }

        if header.command == CommandCode::QueryStatus.to_byte() {
            self.status_queries += 1;

            if let Some((target, remaining)) = self.driving {
                if remaining <= 1 {
                    self.driving = None;
                    self.status.last_point_id = Some(target);
                    self.status.operational_status = Some(STATUS_IDLE);
                    self.status.vx = Some(0.0);
                } else {
                    self.driving = Some((target, remaining - 1));
                }
            }

            return Some(encode_status_response(header.sequence, &self.status));
        }

        warn!(
            "Simulated AGV ignoring command {:#04x}",
            header.command
        );
        None
    }
}

// ------------------------------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ------------------------------------------------------------------------------------------------

fn lock(state: &Mutex<SimAgvState>) -> MutexGuard<'_, SimAgvState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

fn serve(socket: UdpSocket, state: Arc<Mutex<SimAgvState>>, run: Arc<AtomicBool>) {
    let mut buf = [0u8; 512];

    while run.load(Ordering::Relaxed) {
        let (len, peer) = match socket.recv_from(&mut buf) {
            Ok(r) => r,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut =>
            {
                continue
            }
            Err(e) => {
                warn!("Simulated AGV receive error: {}", e);
                continue;
            }
        };

        let reply = {
            let mut state = lock(&state);
            let reply = state.handle(&buf[..len]);
            if state.silent {
                None
            } else {
                reply
            }
        };

        if let Some(reply) = reply {
            if let Err(e) = socket.send_to(&reply, peer) {
                warn!("Simulated AGV could not reply to {}: {}", peer, e);
            }
        }
    }
}
