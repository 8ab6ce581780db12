//! # Tracker Sessions
//!
//! Pure session bookkeeping for the tracker server: which devices are connected, where they send
//! from and what they last reported. No I/O happens here, every call takes the current time so
//! the lifecycle can be driven from tests.
//!
//! A network address goes `Unknown -> Active` on an accepted handshake and back to `Unknown`
//! when its session is evicted. Datagrams from unknown addresses other than handshakes are
//! ignored.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use comms_if::eqpt::{
    dongle::{DongleReport, DongleReportKind},
    tracker::{
        accel_in_bounds, validate_quaternion, DecodeParams, Handshake, PacketError, TrackerPacket,
    },
};
use log::{debug, info, trace};
use nalgebra::{Quaternion, Vector3};
use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    time::{Duration, Instant},
};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Latest known state of one tracker.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerSession {
    /// Hardware address as `aa:bb:cc:dd:ee:ff`, or `ip-a-b-c-d` for devices without one
    pub id: String,

    pub source: SessionSource,

    pub last_seen: Instant,

    /// Units: percent
    pub battery_pct: Option<f32>,

    /// Units: volts
    pub battery_volt: Option<f32>,

    pub orientation: Option<Quaternion<f32>>,

    pub acceleration: Option<Vector3<f32>>,

    /// Identity announcement, for trackers connected over the network
    pub handshake: Option<Handshake>,

    /// Number of values rejected by validation
    pub rejected: u64,
}

/// Owns every tracker session and the maps used to find them.
pub struct SessionManager {
    sessions: HashMap<String, TrackerSession>,

    /// Network address to session id
    addr_map: HashMap<SocketAddr, String>,

    /// Dongle-local tracker id to session id, set by announcements
    dongle_map: HashMap<u8, String>,

    params: DecodeParams,

    disconnect_threshold: Duration,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// How a tracker reaches the rig.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSource {
    Network(SocketAddr),
    Dongle(u8),
}

/// A decoded value to apply to a session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SessionUpdate {
    Battery {
        percentage: f32,
        voltage: f32,
    },
    Orientation(Quaternion<f32>),
    Acceleration(Vector3<f32>),

    /// Packed rotation and acceleration. The acceleration is checked against the packed bound.
    OrientationAndAcceleration {
        quat: Quaternion<f32>,
        accel: Vector3<f32>,
    },
}

/// Result of applying an update to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyResult {
    /// At least one value was stored.
    Updated,

    /// Every value failed validation, the session keeps its previous values.
    Rejected,

    NoSession,
}

/// What the server should do after a datagram.
#[derive(Debug, Clone, PartialEq)]
pub enum DatagramOutcome {
    /// Handshake accepted, the acknowledgement must be sent back.
    Handshake { id: String, new_session: bool },

    Updated(String),

    Rejected(String),

    /// A well formed datagram carrying nothing to apply (unknown type, acknowledgement echo).
    Ignored,

    /// Data from an address without a session.
    UnknownSource,

    Malformed(PacketError),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl TrackerSession {
    fn new(id: String, source: SessionSource, now: Instant) -> Self {
        Self {
            id,
            source,
            last_seen: now,
            battery_pct: None,
            battery_volt: None,
            orientation: None,
            acceleration: None,
            handshake: None,
            rejected: 0,
        }
    }

    /// The address the session is reached at, if it is on the network.
    pub fn network_addr(&self) -> Option<SocketAddr> {
        match self.source {
            SessionSource::Network(a) => Some(a),
            SessionSource::Dongle(_) => None,
        }
    }
}

impl DatagramOutcome {
    /// The id of the session affected, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            DatagramOutcome::Handshake { id, .. }
            | DatagramOutcome::Updated(id)
            | DatagramOutcome::Rejected(id) => Some(id),
            _ => None,
        }
    }
}

impl SessionManager {
    pub fn new(params: DecodeParams, disconnect_threshold: Duration) -> Self {
        Self {
            sessions: HashMap::new(),
            addr_map: HashMap::new(),
            dongle_map: HashMap::new(),
            params,
            disconnect_threshold,
        }
    }

    pub fn session(&self, id: &str) -> Option<&TrackerSession> {
        self.sessions.get(id)
    }

    pub fn session_for_addr(&self, addr: &SocketAddr) -> Option<&TrackerSession> {
        self.addr_map.get(addr).and_then(|id| self.sessions.get(id))
    }

    pub fn sessions(&self) -> impl Iterator<Item = &TrackerSession> {
        self.sessions.values()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Number of addresses mapped to a session.
    pub fn num_addresses(&self) -> usize {
        self.addr_map.len()
    }

    /// Process one datagram received from `addr`.
    pub fn handle_datagram(&mut self, data: &[u8], addr: SocketAddr, now: Instant) -> DatagramOutcome {
        let packet = match TrackerPacket::decode(data, &self.params) {
            Ok(p) => p,
            Err(e) => {
                trace!("Malformed datagram from {}: {}", addr, e);
                return DatagramOutcome::Malformed(e);
            }
        };

        let update = match packet {
            TrackerPacket::Handshake(hs) => return self.handshake(hs, addr, now),
            TrackerPacket::AckEcho | TrackerPacket::Unknown(_) => {
                // Still proof of life from a known tracker
                if let Some(id) = self.addr_map.get(&addr).cloned() {
                    self.touch(&id, now);
                }
                return DatagramOutcome::Ignored;
            }
            TrackerPacket::Battery(b) => SessionUpdate::Battery {
                percentage: b.percentage,
                voltage: b.voltage,
            },
            TrackerPacket::Rotation(r) => SessionUpdate::Orientation(r.quat),
            TrackerPacket::Acceleration(a) => SessionUpdate::Acceleration(a),
            TrackerPacket::RotationAndAcceleration { quat, accel } => {
                SessionUpdate::OrientationAndAcceleration { quat, accel }
            }
        };

        let id = match self.addr_map.get(&addr) {
            Some(id) => id.clone(),
            None => return DatagramOutcome::UnknownSource,
        };

        match self.apply(&id, update, now) {
            ApplyResult::Updated => DatagramOutcome::Updated(id),
            ApplyResult::Rejected => DatagramOutcome::Rejected(id),
            ApplyResult::NoSession => DatagramOutcome::UnknownSource,
        }
    }

    /// Process one dongle report. Returns the id of the updated session, if any.
    pub fn handle_dongle(&mut self, report: &DongleReport, now: Instant) -> Option<(String, ApplyResult)> {
        let update = match report.kind {
            DongleReportKind::Announce(mac) => {
                let id = mac.to_string();
                debug!("Dongle tracker {} is {}", report.tracker_id, id);
                self.dongle_map.insert(report.tracker_id, id);
                return None;
            }
            DongleReportKind::Battery {
                percentage,
                voltage,
            } => SessionUpdate::Battery {
                percentage: percentage as f32,
                voltage,
            },
            DongleReportKind::RotationAndAcceleration { quat, accel } => {
                SessionUpdate::OrientationAndAcceleration { quat, accel }
            }
            DongleReportKind::Rotation(q) => SessionUpdate::Orientation(q),
            DongleReportKind::Unknown(_) => return None,
        };

        // Data before the announcement cannot be attributed
        let id = self.dongle_map.get(&report.tracker_id)?.clone();

        if !self.sessions.contains_key(&id) {
            info!("Tracker {} connected via dongle", id);
            self.sessions.insert(
                id.clone(),
                TrackerSession::new(id.clone(), SessionSource::Dongle(report.tracker_id), now),
            );
        }

        let result = self.apply(&id, update, now);
        Some((id, result))
    }

    /// Apply a decoded value to a session, validating it first.
    ///
    /// The session's liveness is refreshed even if the value is rejected.
    pub fn apply(&mut self, id: &str, update: SessionUpdate, now: Instant) -> ApplyResult {
        let params = self.params;

        let session = match self.sessions.get_mut(id) {
            Some(s) => s,
            None => return ApplyResult::NoSession,
        };

        session.last_seen = now;

        let mut stored = false;
        let mut rejected = false;

        match update {
            SessionUpdate::Battery {
                percentage,
                voltage,
            } => {
                session.battery_pct = Some(percentage);
                session.battery_volt = Some(voltage);
                stored = true;
            }
            SessionUpdate::Orientation(q) => {
                if validate_quaternion(&q, &params) {
                    session.orientation = Some(q);
                    stored = true;
                } else {
                    rejected = true;
                }
            }
            SessionUpdate::Acceleration(a) => {
                if accel_in_bounds(&a, params.accel_limit) {
                    session.acceleration = Some(a);
                    stored = true;
                } else {
                    rejected = true;
                }
            }
            SessionUpdate::OrientationAndAcceleration { quat, accel } => {
                if validate_quaternion(&quat, &params) {
                    session.orientation = Some(quat);
                    stored = true;
                } else {
                    rejected = true;
                }

                if accel_in_bounds(&accel, params.packed_accel_limit) {
                    session.acceleration = Some(accel);
                    stored = true;
                } else {
                    rejected = true;
                }
            }
        }

        if rejected {
            session.rejected += 1;
            trace!("Rejected value from tracker {}: {:?}", id, update);
        }

        if stored {
            ApplyResult::Updated
        } else {
            ApplyResult::Rejected
        }
    }

    /// Evict every session silent for longer than the disconnect threshold. Returns the evicted
    /// ids.
    pub fn sweep(&mut self, now: Instant) -> Vec<String> {
        let threshold = self.disconnect_threshold;

        let stale: Vec<String> = self
            .sessions
            .values()
            .filter(|s| now.saturating_duration_since(s.last_seen) > threshold)
            .map(|s| s.id.clone())
            .collect();

        for id in stale.iter() {
            self.evict(id);
        }

        stale
    }

    /// Remove a session and any address mapped to it. Returns `false` if there was no such
    /// session, in which case nothing changes.
    pub fn evict(&mut self, id: &str) -> bool {
        if self.sessions.remove(id).is_none() {
            return false;
        }

        self.addr_map.retain(|_, v| v != id);
        info!("Tracker {} disconnected", id);

        true
    }

    fn handshake(&mut self, hs: Handshake, addr: SocketAddr, now: Instant) -> DatagramOutcome {
        let id = if hs.mac.is_zero() {
            synthetic_id(addr.ip())
        } else {
            hs.mac.to_string()
        };

        // The address may have belonged to another device
        if let Some(prev) = self.addr_map.get(&addr) {
            if *prev != id {
                debug!("Address {} moved from tracker {} to {}", addr, prev, id);
            }
        }

        let new_session = match self.sessions.get_mut(&id) {
            Some(s) => {
                if let SessionSource::Network(old) = s.source {
                    if old != addr {
                        info!("Tracker {} moved from {} to {}", id, old, addr);
                        // Another device may have taken the old address since
                        if self.addr_map.get(&old).map(String::as_str) == Some(id.as_str()) {
                            self.addr_map.remove(&old);
                        }
                    }
                }
                s.source = SessionSource::Network(addr);
                s.last_seen = now;
                s.handshake = Some(hs);
                false
            }
            None => {
                info!(
                    "Tracker {} connected from {} (firmware {:?}, build {})",
                    id, addr, hs.firmware, hs.firmware_build
                );
                let mut s = TrackerSession::new(id.clone(), SessionSource::Network(addr), now);
                s.handshake = Some(hs);
                self.sessions.insert(id.clone(), s);
                true
            }
        };

        self.addr_map.insert(addr, id.clone());

        DatagramOutcome::Handshake { id, new_session }
    }

    fn touch(&mut self, id: &str, now: Instant) {
        if let Some(s) = self.sessions.get_mut(id) {
            s.last_seen = now;
        }
    }
}

// ------------------------------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Identity for devices which report an all-zero hardware address.
fn synthetic_id(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!("ip-{}-{}-{}-{}", o[0], o[1], o[2], o[3])
        }
        IpAddr::V6(v6) => format!("ip-{}", v6.to_string().replace(':', "-")),
    }
}
