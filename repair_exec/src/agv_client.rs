//! # AGV Client
//!
//! UDP transport to the AGV controller. The client owns the socket, the frame encoder and the
//! navigation target being tracked, all behind one lock so that each request and its reply form
//! one exchange on the wire.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use comms_if::agv::{
    decode_status, AgvCodecError, AgvStatus, CommandCode, FrameEncoder, FrameHeader,
};
use log::{debug, info, trace, warn};
use std::{
    io,
    net::{SocketAddr, UdpSocket},
    sync::{Mutex, MutexGuard},
    time::{Duration, Instant},
};

use crate::params::AgvParams;

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Largest datagram accepted from the AGV.
const RECV_BUF_LEN: usize = 2048;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Client for the AGV link.
pub struct AgvClient {
    link: Mutex<AgvLink>,
}

struct AgvLink {
    socket: Option<UdpSocket>,

    /// Endpoint the socket is (re)opened on, the last one configured
    ip: String,
    port: u16,

    encoder: FrameEncoder,
    recv_timeout: Duration,

    /// Target of the last successful navigate command, while arrival is still being tracked
    target: Option<u32>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(thiserror::Error, Debug)]
pub enum AgvClientError {
    #[error("Invalid AGV endpoint {0}")]
    InvalidEndpoint(String),

    #[error("Could not open the AGV socket: {0}")]
    SocketError(io::Error),

    #[error("The AGV link is not configured")]
    NotConfigured,

    #[error("Could not send to the AGV: {0}")]
    SendError(io::Error),

    #[error("No reply from the AGV: {0}")]
    RecvError(io::Error),

    #[error("Invalid reply from the AGV: {0}")]
    DecodeError(AgvCodecError),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl AgvClient {
    /// Create an unconfigured client. The endpoint in `params` is used if a command is sent before
    /// [`AgvClient::configure`] is called.
    pub fn new(params: &AgvParams) -> Self {
        Self {
            link: Mutex::new(AgvLink {
                socket: None,
                ip: params.ip.clone(),
                port: params.port,
                encoder: FrameEncoder::new(),
                recv_timeout: Duration::from_millis(params.recv_timeout_ms),
                target: None,
            }),
        }
    }

    /// Point the client at the given AGV, replacing any previous socket.
    pub fn configure(&self, ip: &str, port: u16) -> Result<(), AgvClientError> {
        let mut link = self.link();
        Self::open(&mut link, ip, port)
    }

    /// Open the socket on the current endpoint unless already open.
    pub fn start(&self) -> Result<(), AgvClientError> {
        let mut link = self.link();
        Self::ensure_socket(&mut link)?;
        info!("AGV client started");
        Ok(())
    }

    /// Release the socket. Tracking is disarmed, the endpoint is kept for the next command.
    pub fn stop(&self) {
        let mut link = self.link();
        link.socket = None;
        link.target = None;
        info!("AGV client stopped");
    }

    /// Command the AGV to navigate to a map point.
    ///
    /// On success the point becomes the tracked target used by
    /// [`AgvClient::has_reached_target`]. On failure tracking is disarmed and `false` returned.
    pub fn navigate_to_point(&self, point_id: u32) -> bool {
        let mut link = self.link();

        if let Err(e) = Self::ensure_socket(&mut link) {
            warn!("Cannot navigate to point {}: {}", point_id, e);
            link.target = None;
            return false;
        }

        let frame = link.encoder.encode_navigate(point_id);
        match Self::send(&link, &frame) {
            Ok(()) => {
                info!("AGV navigating to point {}", point_id);
                link.target = Some(point_id);
                true
            }
            Err(e) => {
                warn!("Navigate to point {} failed: {}", point_id, e);
                link.target = None;
                false
            }
        }
    }

    /// Query the detailed status of the AGV.
    ///
    /// Any failure (send error, timeout, malformed reply) is logged and gives a status with every
    /// field unset.
    pub fn query_detailed_status(&self) -> AgvStatus {
        let mut link = self.link();

        match self.exchange_status(&mut link) {
            Ok(s) => s,
            Err(e) => {
                warn!("AGV status query failed: {}", e);
                AgvStatus::default()
            }
        }
    }

    /// Check whether the AGV has arrived at the tracked target.
    ///
    /// True only if the AGV is idle and its last passed point is the target. A true result
    /// disarms tracking, so later calls return false until the next navigate command.
    pub fn has_reached_target(&self) -> bool {
        let mut link = self.link();

        let target = match link.target {
            Some(t) => t,
            None => return false,
        };

        let status = match self.exchange_status(&mut link) {
            Ok(s) => s,
            Err(e) => {
                warn!("Could not check arrival at point {}: {}", target, e);
                return false;
            }
        };

        trace!(
            "Arrival check: target {}, last point {:?}, status {:?}",
            target,
            status.last_point_id,
            status.operational_status
        );

        if status.is_idle() && status.last_point_id == Some(target) {
            info!("AGV arrived at point {}", target);
            link.target = None;
            true
        } else {
            false
        }
    }

    /// The point whose arrival is currently being tracked.
    pub fn tracked_target(&self) -> Option<u32> {
        self.link().target
    }

    fn link(&self) -> MutexGuard<'_, AgvLink> {
        // A panic while holding the lock leaves nothing half-written worth refusing
        self.link.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn open(link: &mut AgvLink, ip: &str, port: u16) -> Result<(), AgvClientError> {
        let endpoint: SocketAddr = format!("{}:{}", ip, port)
            .parse()
            .map_err(|_| AgvClientError::InvalidEndpoint(format!("{}:{}", ip, port)))?;

        let socket = UdpSocket::bind("0.0.0.0:0").map_err(AgvClientError::SocketError)?;
        socket
            .connect(endpoint)
            .map_err(AgvClientError::SocketError)?;

        link.socket = Some(socket);
        link.ip = ip.to_string();
        link.port = port;
        info!("AGV link configured for {}", endpoint);
        Ok(())
    }

    fn ensure_socket(link: &mut AgvLink) -> Result<(), AgvClientError> {
        if link.socket.is_none() {
            let (ip, port) = (link.ip.clone(), link.port);
            debug!("AGV socket not open, opening it for {}:{}", ip, port);
            Self::open(link, &ip, port)?;
        }
        Ok(())
    }

    fn send(link: &AgvLink, frame: &[u8]) -> Result<(), AgvClientError> {
        let socket = link.socket.as_ref().ok_or(AgvClientError::NotConfigured)?;
        socket.send(frame).map_err(AgvClientError::SendError)?;
        Ok(())
    }

    /// Send a status query and wait for its reply.
    ///
    /// Replies to earlier requests (navigate acknowledgements, late status replies) are
    /// discarded until the one carrying this query's sequence number arrives.
    fn exchange_status(&self, link: &mut AgvLink) -> Result<AgvStatus, AgvClientError> {
        Self::ensure_socket(link)?;

        let sequence = link.encoder.next_sequence();
        let frame = link.encoder.encode_status_query();
        Self::send(link, &frame)?;

        let socket = link.socket.as_ref().ok_or(AgvClientError::NotConfigured)?;
        let deadline = Instant::now() + link.recv_timeout;
        let mut buf = [0u8; RECV_BUF_LEN];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining == Duration::from_secs(0) {
                return Err(AgvClientError::RecvError(io::ErrorKind::TimedOut.into()));
            }
            socket
                .set_read_timeout(Some(remaining))
                .map_err(AgvClientError::SocketError)?;

            let len = socket.recv(&mut buf).map_err(AgvClientError::RecvError)?;
            let reply = &buf[..len];

            let header = FrameHeader::parse(reply).map_err(AgvClientError::DecodeError)?;
            if header.sequence == sequence
                && header.command == CommandCode::QueryStatus.to_byte()
            {
                return decode_status(reply).map_err(AgvClientError::DecodeError);
            }

            debug!(
                "Discarding AGV reply with sequence {} and command {:#04x}",
                header.sequence, header.command
            );
        }
    }
}
