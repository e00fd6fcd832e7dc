//! # Broker Client
//!
//! Link to the backend message broker. A DEALER socket is owned by a background I/O thread;
//! outbound envelopes are queued to that thread and inbound envelopes are handed back through a
//! channel, so no caller ever blocks on the network.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use chrono::Utc;
use comms_if::{
    msg::{service, Envelope, MODULE_AGV},
    net::{zmq, MonitoredSocket, MonitoredSocketError, SocketOptions},
};
use serde_json::json;
use log::{debug, info, trace, warn};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use crate::params::BrokerParams;

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Receive timeout of the socket, which is also the longest an outbound envelope waits in the
/// queue.
const IO_POLL_MS: i32 = 20;

const SEND_TIMEOUT_MS: i32 = 500;

// ------------------------------------------------------------------------------------------------
// TRAITS
// ------------------------------------------------------------------------------------------------

/// Somewhere envelopes can be sent to.
pub trait EnvelopeSink: Send + Sync {
    fn send(&self, envelope: Envelope) -> Result<(), BrokerClientError>;
}

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Broker client
pub struct BrokerClient {
    outbound: Mutex<Sender<Envelope>>,
    inbound: Mutex<Receiver<Envelope>>,
    connected: Arc<AtomicBool>,
    run: Arc<AtomicBool>,
    join_handle: Mutex<Option<thread::JoinHandle<()>>>,
}

/// Sink which pushes envelopes into a channel.
pub struct ChannelSink {
    tx: Mutex<Sender<Envelope>>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BrokerClientError {
    #[error("Socket error: {0}")]
    SocketError(MonitoredSocketError),

    #[error("The broker link has been shut down")]
    Closed,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl BrokerClient {
    /// Connect to the broker and start the I/O thread.
    ///
    /// This function will not block until the broker connects.
    pub fn new(ctx: &zmq::Context, params: &BrokerParams) -> Result<Self, BrokerClientError> {
        let socket_options = SocketOptions {
            block_on_first_connect: false,
            connect_timeout: 1000,
            heartbeat_ivl: 500,
            heartbeat_timeout: 1000,
            linger: 1,
            reconnect_ivl: params.reconnect_ivl_ms,
            recv_timeout: IO_POLL_MS,
            send_timeout: SEND_TIMEOUT_MS,
            ..Default::default()
        };

        let socket = MonitoredSocket::new(ctx, zmq::DEALER, socket_options, &params.endpoint)
            .map_err(BrokerClientError::SocketError)?;

        let (out_tx, out_rx) = mpsc::channel();
        let (in_tx, in_rx) = mpsc::channel();
        let run = Arc::new(AtomicBool::new(true));
        let connected = Arc::new(AtomicBool::new(false));

        let run_clone = run.clone();
        let connected_clone = connected.clone();
        let join_handle = thread::spawn(move || {
            io_thread(socket, out_rx, in_tx, run_clone, connected_clone)
        });

        info!("Broker client started on {}", params.endpoint);

        Ok(Self {
            outbound: Mutex::new(out_tx),
            inbound: Mutex::new(in_rx),
            connected,
            run,
            join_handle: Mutex::new(Some(join_handle)),
        })
    }

    /// Check if the broker is currently connected.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Wait up to `timeout` for an inbound envelope.
    ///
    /// `Ok(None)` means nothing arrived in time.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<Envelope>, BrokerClientError> {
        let inbound = self.inbound.lock().unwrap_or_else(|e| e.into_inner());
        match inbound.recv_timeout(timeout) {
            Ok(e) => Ok(Some(e)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(BrokerClientError::Closed),
        }
    }

    /// Stop the I/O thread. Queued outbound envelopes are flushed first.
    pub fn shutdown(&self) {
        self.run.store(false, Ordering::Relaxed);
        let join_handle = self
            .join_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(jh) = join_handle {
            jh.join().ok();
            info!("Broker client stopped");
        }
    }
}

impl EnvelopeSink for BrokerClient {
    fn send(&self, envelope: Envelope) -> Result<(), BrokerClientError> {
        self.outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .send(envelope)
            .map_err(|_| BrokerClientError::Closed)
    }
}

impl Drop for BrokerClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl ChannelSink {
    /// Create a sink and the receiver its envelopes arrive on.
    pub fn new() -> (Self, Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx: Mutex::new(tx) }, rx)
    }
}

impl EnvelopeSink for ChannelSink {
    fn send(&self, envelope: Envelope) -> Result<(), BrokerClientError> {
        self.tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .send(envelope)
            .map_err(|_| BrokerClientError::Closed)
    }
}

// ------------------------------------------------------------------------------------------------
// FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Build the envelope announcing this machine to the backend.
pub fn start_envelope(machine_id: &str) -> Envelope {
    let mut envelope = Envelope::new(MODULE_AGV, service::START).success("StartRequest");
    envelope.content = json!({
        "Type": "StartRequest",
        "MachineId": machine_id,
        "Timestamp": Utc::now().to_rfc3339(),
    });
    envelope
}

// ------------------------------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ------------------------------------------------------------------------------------------------

fn io_thread(
    socket: MonitoredSocket,
    outbound: Receiver<Envelope>,
    inbound: Sender<Envelope>,
    run: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
) {
    loop {
        connected.store(socket.connected(), Ordering::Relaxed);

        // Flush the outbound queue
        let mut senders_gone = false;
        loop {
            match outbound.try_recv() {
                Ok(envelope) => send_envelope(&socket, &envelope),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    senders_gone = true;
                    break;
                }
            }
        }

        if senders_gone || !run.load(Ordering::Relaxed) {
            break;
        }

        // A ROUTER peer may prefix the payload with an empty delimiter frame, the payload is
        // always the last frame.
        match socket.recv_multipart(0) {
            Ok(frames) => match frames.last().map(|f| std::str::from_utf8(f)) {
                Some(Ok(text)) => {
                    trace!("Broker -> {}", text);
                    match Envelope::from_json(text) {
                        Ok(envelope) => {
                            if inbound.send(envelope).is_err() {
                                debug!("Inbound receiver dropped, discarding envelope");
                            }
                        }
                        Err(e) => warn!("Dropping unparseable envelope: {}", e),
                    }
                }
                Some(Err(_)) => warn!("Dropping non UTF-8 message from the broker"),
                None => (),
            },
            Err(zmq::Error::EAGAIN) => (),
            Err(e) => warn!("Broker receive error: {}", e),
        }
    }
}

fn send_envelope(socket: &MonitoredSocket, envelope: &Envelope) {
    let text = match envelope.to_json() {
        Ok(t) => t,
        Err(e) => {
            warn!("Could not serialize the {} envelope: {}", envelope.service, e);
            return;
        }
    };

    trace!("Broker <- {}", text);
    if let Err(e) = socket.send(text.as_str(), 0) {
        warn!("Could not send the {} envelope: {}", envelope.service, e);
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_round_trip_through_router() {
        let ctx = zmq::Context::new();
        let router = ctx.socket(zmq::ROUTER).unwrap();
        router.set_rcvtimeo(2000).unwrap();
        router.set_sndtimeo(2000).unwrap();
        router.set_linger(0).unwrap();
        router.bind("tcp://127.0.0.1:*").unwrap();
        let endpoint = router.get_last_endpoint().unwrap().unwrap();

        let client = BrokerClient::new(
            &ctx,
            &BrokerParams {
                endpoint,
                ..Default::default()
            },
        )
        .unwrap();

        // Outbound arrives as [identity, payload]
        client
            .send(Envelope::new(MODULE_AGV, service::START).success("hello"))
            .unwrap();
        let frames = router.recv_multipart(0).unwrap();
        assert_eq!(frames.len(), 2);
        let sent = Envelope::from_json(std::str::from_utf8(&frames[1]).unwrap()).unwrap();
        assert_eq!(sent.service, service::START);
        assert_eq!(sent.msg, "hello");

        // Inbound with and without a delimiter frame
        let identity = frames[0].clone();
        let reply = Envelope::new(MODULE_AGV, service::STATUS_REPORT)
            .to_json()
            .unwrap();
        router
            .send_multipart(vec![identity.clone(), Vec::new(), reply.clone().into_bytes()], 0)
            .unwrap();
        router
            .send_multipart(vec![identity.clone(), b"not json".to_vec()], 0)
            .unwrap();
        router
            .send_multipart(vec![identity, reply.into_bytes()], 0)
            .unwrap();

        for _ in 0..2 {
            let env = client
                .recv_timeout(Duration::from_secs(2))
                .unwrap()
                .expect("no envelope received");
            assert_eq!(env.service, service::STATUS_REPORT);
        }
        assert!(client
            .recv_timeout(Duration::from_millis(100))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_start_envelope() {
        let env = start_envelope("MACHINE042");
        assert_eq!(env.module, MODULE_AGV);
        assert_eq!(env.service, service::START);
        assert_eq!(env.content["Type"], "StartRequest");
        assert_eq!(env.content["MachineId"], "MACHINE042");
        assert!(env.content["Timestamp"].as_str().is_some());
    }

    #[test]
    fn test_channel_sink() {
        let (sink, rx) = ChannelSink::new();
        sink.send(Envelope::new(MODULE_AGV, service::STATUS_REPORT))
            .unwrap();
        assert_eq!(rx.recv().unwrap().module, MODULE_AGV);

        drop(rx);
        assert!(sink.send(Envelope::default()).is_err());
    }
}
