//! # Tracker Server
//!
//! Owns the tracker UDP socket. Every datagram is fed to the [`SessionManager`], handshakes are
//! acknowledged, and every session change is copied onto the blackboard and into the log sink.
//! Reports from a dongle reader arrive over a channel and are applied to the same sessions.
//!
//! The socket has a short read timeout so that the stop flag and the once per sweep period
//! eviction are serviced even when no tracker is talking.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

pub mod dongle;
pub mod sessions;

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use comms_if::eqpt::{dongle::DongleReport, tracker::handshake_ack, tracker::DecodeParams};
use log::{debug, info, warn};
use std::{
    io::ErrorKind,
    net::{SocketAddr, UdpSocket},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{Receiver, TryRecvError},
        Arc,
    },
    time::{Duration, Instant},
};
use util::time::seconds_to_std;

use crate::{blackboard::Blackboard, log_sink::LogSink, params::TrackerParams};

pub use sessions::{DatagramOutcome, SessionManager, TrackerSession};

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Larger than any tracker datagram
const RECV_BUF_LEN: usize = 2048;

/// Lower bound on the socket read timeout, a zero timeout is rejected by the OS
const MIN_RECV_TIMEOUT: Duration = Duration::from_millis(1);

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

pub struct TrackerServer {
    socket: UdpSocket,

    sessions: SessionManager,

    blackboard: Arc<Blackboard>,

    log_sink: Option<Box<dyn LogSink>>,

    dongle_rx: Option<Receiver<DongleReport>>,

    sweep_period: Duration,

    last_sweep: Instant,

    buf: Vec<u8>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TrackerServerError {
    #[error("Could not bind the tracker socket to {0}: {1}")]
    Bind(String, std::io::Error),

    #[error("Tracker socket error: {0}")]
    Socket(std::io::Error),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl TrackerServer {
    /// Bind the tracker socket.
    pub fn bind(
        params: &TrackerParams,
        decode: DecodeParams,
        blackboard: Arc<Blackboard>,
    ) -> Result<Self, TrackerServerError> {
        let addr = format!("{}:{}", params.bind_address, params.port);

        let socket = UdpSocket::bind(&addr).map_err(|e| TrackerServerError::Bind(addr.clone(), e))?;
        socket
            .set_read_timeout(Some(
                seconds_to_std(params.recv_timeout_s).max(MIN_RECV_TIMEOUT),
            ))
            .map_err(TrackerServerError::Socket)?;

        info!("Tracker server listening on {}", addr);

        Ok(Self {
            socket,
            sessions: SessionManager::new(
                decode,
                seconds_to_std(params.disconnect_threshold_s),
            ),
            blackboard,
            log_sink: None,
            dongle_rx: None,
            sweep_period: seconds_to_std(params.sweep_period_s),
            last_sweep: Instant::now(),
            buf: vec![0u8; RECV_BUF_LEN],
        })
    }

    /// Append a record to `sink` for every session update.
    pub fn with_log_sink(mut self, sink: Box<dyn LogSink>) -> Self {
        self.log_sink = Some(sink);
        self
    }

    /// Apply reports received on `rx` alongside the network traffic.
    pub fn with_dongle(mut self, rx: Receiver<DongleReport>) -> Self {
        self.dongle_rx = Some(rx);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TrackerServerError> {
        self.socket.local_addr().map_err(TrackerServerError::Socket)
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Serve until `stop` is raised or the socket fails.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<(), TrackerServerError> {
        while !stop.load(Ordering::Relaxed) {
            self.poll()?;
        }

        info!("Tracker server stopped with {} active session(s)", self.sessions.len());

        Ok(())
    }

    /// Wait at most the read timeout for one datagram and handle it, then apply pending dongle
    /// reports and sweep if due.
    ///
    /// Returns the outcome of the datagram, if one arrived.
    pub fn poll(&mut self) -> Result<Option<DatagramOutcome>, TrackerServerError> {
        let outcome = match self.socket.recv_from(&mut self.buf) {
            Ok((n, addr)) => {
                let now = Instant::now();
                let outcome = self.sessions.handle_datagram(&self.buf[..n], addr, now);
                self.on_outcome(&outcome, addr);
                Some(outcome)
            }
            Err(e) => match e.kind() {
                ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted => None,
                // ICMP port unreachable from an earlier reply, the tracker went away
                ErrorKind::ConnectionReset | ErrorKind::ConnectionRefused => {
                    debug!("Tracker connection reset: {}", e);
                    None
                }
                _ => return Err(TrackerServerError::Socket(e)),
            },
        };

        self.drain_dongle();

        let now = Instant::now();
        if now.saturating_duration_since(self.last_sweep) >= self.sweep_period {
            self.last_sweep = now;
            for id in self.sessions.sweep(now) {
                self.blackboard.remove_tracker(&id);
            }
        }

        Ok(outcome)
    }

    fn on_outcome(&mut self, outcome: &DatagramOutcome, addr: SocketAddr) {
        match outcome {
            DatagramOutcome::Handshake { .. } => {
                if let Err(e) = self.socket.send_to(handshake_ack(), addr) {
                    warn!("Could not acknowledge the handshake from {}: {}", addr, e);
                }
                self.publish(outcome.session_id(), false);
            }
            DatagramOutcome::Updated(id) => self.publish(Some(id.as_str()), true),
            // Liveness changed, values did not
            DatagramOutcome::Rejected(id) => self.publish(Some(id.as_str()), false),
            DatagramOutcome::Ignored
            | DatagramOutcome::UnknownSource
            | DatagramOutcome::Malformed(_) => (),
        }
    }

    fn drain_dongle(&mut self) {
        let rx = match self.dongle_rx.as_ref() {
            Some(rx) => rx,
            None => return,
        };

        let mut updated = Vec::new();
        let mut disconnected = false;

        loop {
            match rx.try_recv() {
                Ok(report) => {
                    if let Some((id, _)) = self.sessions.handle_dongle(&report, Instant::now()) {
                        updated.push(id);
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    disconnected = true;
                    break;
                }
            }
        }

        if disconnected {
            warn!("Dongle reader has stopped, continuing with network trackers only");
            self.dongle_rx = None;
        }

        for id in updated {
            self.publish(Some(&id), true);
        }
    }

    fn publish(&mut self, id: Option<&str>, log: bool) {
        let sessions = &self.sessions;
        let session = match id.and_then(|id| sessions.session(id)) {
            Some(s) => s,
            None => return,
        };

        self.blackboard.publish_tracker(session);

        if log {
            if let Some(sink) = self.log_sink.as_mut() {
                if let Err(e) = sink.append(session, &self.blackboard.gimbal()) {
                    warn!("{}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{blackboard::SharedGimbalState, log_sink::LogSinkError};
    use comms_if::eqpt::{
        dongle::DongleReportKind,
        tracker::{MacAddress, PacketType, HANDSHAKE_ACK},
    };
    use std::sync::{mpsc, Mutex};

    const MAC: [u8; 6] = [1, 2, 3, 4, 5, 6];
    const MAC_STR: &str = "01:02:03:04:05:06";

    struct Recorder(Arc<Mutex<Vec<String>>>);

    impl LogSink for Recorder {
        fn append(
            &mut self,
            session: &TrackerSession,
            _gimbal: &SharedGimbalState,
        ) -> Result<(), LogSinkError> {
            self.0.lock().unwrap().push(session.id.clone());
            Ok(())
        }
    }

    fn params(disconnect_threshold_s: f64) -> TrackerParams {
        TrackerParams {
            bind_address: "127.0.0.1".to_string(),
            port: 0,
            disconnect_threshold_s,
            sweep_period_s: 0.0,
            recv_timeout_s: 0.01,
            ..Default::default()
        }
    }

    fn client(server: &TrackerServer) -> UdpSocket {
        let c = UdpSocket::bind("127.0.0.1:0").unwrap();
        c.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        c.connect(server.local_addr().unwrap()).unwrap();
        c
    }

    fn datagram(packet_type: u8, payload: &[u8]) -> Vec<u8> {
        let mut d = vec![0, 0, 0, packet_type];
        d.extend_from_slice(&[0u8; 8]);
        d.extend_from_slice(payload);
        d
    }

    fn handshake() -> Vec<u8> {
        let mut p = vec![0u8; 24];
        p.push(0);
        p.extend_from_slice(&MAC);
        datagram(PacketType::Handshake as u8, &p)
    }

    fn battery(voltage: f32, pct: f32) -> Vec<u8> {
        let mut p = voltage.to_be_bytes().to_vec();
        p.extend_from_slice(&pct.to_be_bytes());
        datagram(PacketType::Battery as u8, &p)
    }

    /// Poll until a datagram is handled, the socket is local so this is quick.
    fn poll_datagram(server: &mut TrackerServer) -> DatagramOutcome {
        for _ in 0..100 {
            if let Some(o) = server.poll().unwrap() {
                return o;
            }
        }
        panic!("No datagram received");
    }

    #[test]
    fn test_handshake_and_update() {
        let bb = Arc::new(Blackboard::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut server = TrackerServer::bind(&params(5.0), DecodeParams::default(), bb.clone())
            .unwrap()
            .with_log_sink(Box::new(Recorder(log.clone())));
        let c = client(&server);

        c.send(&handshake()).unwrap();
        assert_eq!(
            poll_datagram(&mut server),
            DatagramOutcome::Handshake {
                id: MAC_STR.to_string(),
                new_session: true
            }
        );

        let mut ack = [0u8; 64];
        let n = c.recv(&mut ack).unwrap();
        assert_eq!(&ack[..n], &HANDSHAKE_ACK[..]);
        assert!(bb.tracker(MAC_STR).is_some());

        c.send(&battery(3.8, 0.87)).unwrap();
        assert_eq!(
            poll_datagram(&mut server),
            DatagramOutcome::Updated(MAC_STR.to_string())
        );

        let pct = bb.tracker(MAC_STR).unwrap().battery_pct.unwrap();
        assert!((pct - 87.0).abs() < 1e-4);
        assert_eq!(*log.lock().unwrap(), vec![MAC_STR.to_string()]);

        // Garbage does not disturb the session
        c.send(&[0xff, 0x00]).unwrap();
        assert!(matches!(
            poll_datagram(&mut server),
            DatagramOutcome::Malformed(_)
        ));
        assert_eq!(server.sessions().len(), 1);
    }

    #[test]
    fn test_sweep_removes_from_blackboard() {
        let bb = Arc::new(Blackboard::new());
        let mut server =
            TrackerServer::bind(&params(0.0), DecodeParams::default(), bb.clone()).unwrap();
        let c = client(&server);

        c.send(&handshake()).unwrap();
        poll_datagram(&mut server);

        std::thread::sleep(Duration::from_millis(5));
        server.poll().unwrap();

        assert!(server.sessions().is_empty());
        assert!(bb.tracker(MAC_STR).is_none());
    }

    #[test]
    fn test_dongle_reports() {
        let bb = Arc::new(Blackboard::new());
        let (tx, rx) = mpsc::channel();

        let mut server = TrackerServer::bind(&params(5.0), DecodeParams::default(), bb.clone())
            .unwrap()
            .with_dongle(rx);

        tx.send(DongleReport {
            tracker_id: 0,
            kind: DongleReportKind::Announce(MacAddress(MAC)),
        })
        .unwrap();
        tx.send(DongleReport {
            tracker_id: 0,
            kind: DongleReportKind::Battery {
                percentage: 55,
                voltage: 3.9,
            },
        })
        .unwrap();
        drop(tx);

        assert_eq!(server.poll().unwrap(), None);

        let s = bb.tracker(MAC_STR).unwrap();
        assert_eq!(s.battery_pct, Some(55.0));
        assert_eq!(s.network_addr(), None);

        // Reader gone, the server keeps serving
        assert_eq!(server.poll().unwrap(), None);
    }

    #[test]
    fn test_run_stops() {
        let bb = Arc::new(Blackboard::new());
        let mut server =
            TrackerServer::bind(&params(5.0), DecodeParams::default(), bb).unwrap();

        let stop = AtomicBool::new(true);
        server.run(&stop).unwrap();
    }
}
