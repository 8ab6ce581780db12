//! # Tracker Dongle Report Codec
//!
//! A receiver dongle relays trackers which are not on the network. It produces fixed 16 byte
//! reports, several of which may be packed into a single read. Byte 0 is the report type and
//! byte 1 the dongle-local tracker id. Multi-byte fields are little-endian.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use byteorder::{ByteOrder, LittleEndian};
use nalgebra::{Quaternion, Vector3};

use super::tracker::{MacAddress, MAC_LEN};

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Size of a single dongle report.
pub const REPORT_LEN: usize = 16;

/// Scale of the packed 16 bit fields in motion reports.
pub const PACKED_SCALE: f32 = 1.0 / 32768.0;

const TYPE_BATTERY: u8 = 0;
const TYPE_ROTATION_ACCEL: u8 = 1;
const TYPE_BATTERY_ALT: u8 = 2;
const TYPE_ROTATION_MAG: u8 = 4;
const TYPE_ANNOUNCE: u8 = 255;

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// Payload of a decoded dongle report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DongleReportKind {
    /// Binds the dongle-local id to a hardware address.
    Announce(MacAddress),

    Battery {
        /// Units: percent
        percentage: u8,

        /// Units: volts
        voltage: f32,
    },

    RotationAndAcceleration {
        quat: Quaternion<f32>,
        accel: Vector3<f32>,
    },

    /// Orientation from a report which also carries magnetometer data. The magnetometer is not
    /// used.
    Rotation(Quaternion<f32>),

    Unknown(u8),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DongleError {
    #[error("Expected a 16 byte report, found {0} bytes")]
    WrongLength(usize),
}

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DongleReport {
    /// Dongle-local id of the tracker the report is about.
    pub tracker_id: u8,

    pub kind: DongleReportKind,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl DongleReport {
    /// Decode a single report. The slice must be exactly [`REPORT_LEN`] bytes long.
    pub fn decode(report: &[u8]) -> Result<Self, DongleError> {
        if report.len() != REPORT_LEN {
            return Err(DongleError::WrongLength(report.len()));
        }

        let tracker_id = report[1];

        let kind = match report[0] {
            TYPE_ANNOUNCE => {
                let mut mac = [0u8; MAC_LEN];
                mac.copy_from_slice(&report[2..2 + MAC_LEN]);
                DongleReportKind::Announce(MacAddress(mac))
            }
            TYPE_BATTERY | TYPE_BATTERY_ALT => DongleReportKind::Battery {
                percentage: if report[2] == 128 { 1 } else { report[2] & 127 },
                voltage: (report[3] as f32 + 245.0) / 100.0,
            },
            TYPE_ROTATION_ACCEL => {
                let raw = read_packed(report);
                DongleReportKind::RotationAndAcceleration {
                    quat: packed_quat(&raw),
                    accel: Vector3::new(
                        raw[4] as f32 * PACKED_SCALE,
                        raw[5] as f32 * PACKED_SCALE,
                        raw[6] as f32 * PACKED_SCALE,
                    ),
                }
            }
            TYPE_ROTATION_MAG => DongleReportKind::Rotation(packed_quat(&read_packed(report))),
            t => DongleReportKind::Unknown(t),
        };

        Ok(Self { tracker_id, kind })
    }
}

// ------------------------------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Split a raw read into whole reports, decoding each. A trailing partial report is dropped.
pub fn decode_reports(buf: &[u8]) -> Vec<DongleReport> {
    buf.chunks_exact(REPORT_LEN)
        .filter_map(|c| DongleReport::decode(c).ok())
        .collect()
}

// ------------------------------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ------------------------------------------------------------------------------------------------

fn read_packed(report: &[u8]) -> [i16; 7] {
    let mut raw = [0i16; 7];
    LittleEndian::read_i16_into(&report[2..16], &mut raw);
    raw
}

/// Packed components are in `x, y, z, w` order.
fn packed_quat(raw: &[i16; 7]) -> Quaternion<f32> {
    Quaternion::new(
        raw[3] as f32 * PACKED_SCALE,
        raw[0] as f32 * PACKED_SCALE,
        raw[1] as f32 * PACKED_SCALE,
        raw[2] as f32 * PACKED_SCALE,
    )
}

#[cfg(test)]
mod test {
    use super::*;

    fn report(kind: u8, id: u8, body: &[u8]) -> [u8; REPORT_LEN] {
        let mut r = [0u8; REPORT_LEN];
        r[0] = kind;
        r[1] = id;
        r[2..2 + body.len()].copy_from_slice(body);
        r
    }

    #[test]
    fn test_announce() {
        let r = report(255, 4, &[1, 2, 3, 4, 5, 6]);
        assert_eq!(
            DongleReport::decode(&r),
            Ok(DongleReport {
                tracker_id: 4,
                kind: DongleReportKind::Announce(MacAddress([1, 2, 3, 4, 5, 6]))
            })
        );
    }

    #[test]
    fn test_battery() {
        let r = DongleReport::decode(&report(0, 1, &[0x80 | 55, 150])).unwrap();
        match r.kind {
            DongleReportKind::Battery {
                percentage,
                voltage,
            } => {
                assert_eq!(percentage, 55);
                assert!((voltage - 3.95).abs() < 1e-6);
            }
            k => panic!("Expected battery, got {:?}", k),
        }

        // 128 is reported as 1%
        let r = DongleReport::decode(&report(2, 1, &[128, 0])).unwrap();
        assert!(matches!(
            r.kind,
            DongleReportKind::Battery { percentage: 1, .. }
        ));
    }

    #[test]
    fn test_motion() {
        let mut body = Vec::new();
        for v in [0i16, 0, 0, 16384, 8192, 0, -8192].iter() {
            body.extend_from_slice(&v.to_le_bytes());
        }

        let r = DongleReport::decode(&report(1, 2, &body)).unwrap();
        assert_eq!(
            r.kind,
            DongleReportKind::RotationAndAcceleration {
                quat: Quaternion::new(0.5, 0.0, 0.0, 0.0),
                accel: Vector3::new(0.25, 0.0, -0.25),
            }
        );

        let r = DongleReport::decode(&report(4, 2, &body)).unwrap();
        assert_eq!(
            r.kind,
            DongleReportKind::Rotation(Quaternion::new(0.5, 0.0, 0.0, 0.0))
        );
    }

    #[test]
    fn test_framing() {
        assert_eq!(
            DongleReport::decode(&[0u8; 15]),
            Err(DongleError::WrongLength(15))
        );

        let mut buf = Vec::new();
        buf.extend_from_slice(&report(255, 0, &[1, 1, 1, 1, 1, 1]));
        buf.extend_from_slice(&report(9, 0, &[]));
        buf.extend_from_slice(&[0u8; 5]);

        let reports = decode_reports(&buf);
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[1].kind, DongleReportKind::Unknown(9));
    }
}
