//! # Tracker UDP Packet Codec
//!
//! Trackers stream datagrams made of a 12 byte header (three zero bytes, one packet type byte
//! and an 8 byte counter which is ignored) followed by a type specific, mostly big-endian,
//! payload. Several firmware generations are in the field, so the rotation payload comes in more
//! than one layout.
//!
//! Decoding only checks structure. Whether a decoded value is plausible is a separate question
//! answered by [`validate_quaternion`] and [`accel_in_bounds`].

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use byteorder::{BigEndian, ByteOrder};
use nalgebra::{Quaternion, Vector3};
use serde::Deserialize;
use std::fmt;

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Leading bytes of every tracker packet.
pub const HEADER_MAGIC: [u8; 3] = [0, 0, 0];

/// Header length: magic, type byte and packet counter.
pub const HEADER_LEN: usize = 12;

/// Reply sent to a tracker once its handshake has been accepted.
pub const HANDSHAKE_ACK: [u8; 13] = *b"\x03Hey OVR =D 5";

/// Offset of the firmware string length byte inside the handshake payload.
const HANDSHAKE_FW_LEN_OFFSET: usize = 24;

/// Number of bytes in a hardware (MAC) address.
pub const MAC_LEN: usize = 6;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Firmware-specific decoding conventions.
///
/// These were inferred from observed traffic rather than a published format, so they are kept
/// configurable.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct DecodeParams {
    /// Scale applied to the packed 16 bit quaternion components.
    pub packed_quat_scale: f32,

    /// Scale applied to the packed 16 bit acceleration components.
    pub packed_accel_scale: f32,

    /// Battery percentages at or below this value are fractions and are multiplied by 100.
    pub battery_fraction_threshold: f32,

    /// Every quaternion component must lie strictly within +/- this value.
    pub quat_component_limit: f32,

    /// Lower (exclusive) bound on the quaternion norm.
    pub quat_norm_min: f32,

    /// Upper (exclusive) bound on the quaternion norm.
    pub quat_norm_max: f32,

    /// Packed quaternions are normalised when their norm exceeds this value.
    pub packed_quat_normalise_min: f32,

    /// Bound on each component of a float acceleration payload.
    pub accel_limit: f32,

    /// Bound on each component of a packed acceleration payload.
    pub packed_accel_limit: f32,
}

/// Six byte hardware identifier of a tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress(pub [u8; MAC_LEN]);

/// Identity announcement sent by a tracker when it (re)connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub board_type: i32,
    pub imu_type: i32,
    pub mcu_type: i32,
    pub firmware_build: i32,
    pub firmware: String,
    pub mac: MacAddress,
}

/// Battery state of a tracker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Battery {
    /// Units: volts
    pub voltage: f32,

    /// Units: percent, already rescaled if the firmware sent a fraction
    pub percentage: f32,
}

/// Orientation of a tracker, not yet validated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rotation {
    pub layout: RotationLayout,
    pub quat: Quaternion<f32>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// Packet type byte values understood by the rig.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Handshake = 3,
    Acceleration = 4,
    Battery = 12,
    Rotation = 17,
    RotationAndAcceleration = 23,
}

/// Layout of a rotation payload, identified by the size of the sub-header before the four
/// quaternion floats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationLayout {
    /// Floats straight after the header.
    Bare,

    /// One byte sensor id.
    SensorId,

    /// Sensor id and data type bytes.
    SensorIdAndDataType,
}

/// A decoded tracker datagram.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackerPacket {
    Handshake(Handshake),
    Battery(Battery),
    Rotation(Rotation),
    Acceleration(Vector3<f32>),
    RotationAndAcceleration {
        quat: Quaternion<f32>,
        accel: Vector3<f32>,
    },

    /// A stray handshake acknowledgement, e.g. our own reply looped back.
    AckEcho,

    /// Well formed header with a type the rig does not handle.
    Unknown(u8),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("Not enough data in the datagram: expected {expected} bytes, found {found}")]
    NotEnoughData { expected: usize, found: usize },

    #[error("The datagram does not start with the packet header")]
    BadMagic,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Default for DecodeParams {
    fn default() -> Self {
        Self {
            packed_quat_scale: 1.0 / 32768.0,
            packed_accel_scale: 1.0 / 128.0,
            battery_fraction_threshold: 1.0,
            quat_component_limit: 10.0,
            quat_norm_min: 0.1,
            quat_norm_max: 2.0,
            packed_quat_normalise_min: 0.1,
            accel_limit: 1000.0,
            packed_accel_limit: 100.0,
        }
    }
}

impl MacAddress {
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

impl PacketType {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            3 => Some(PacketType::Handshake),
            4 => Some(PacketType::Acceleration),
            12 => Some(PacketType::Battery),
            17 => Some(PacketType::Rotation),
            23 => Some(PacketType::RotationAndAcceleration),
            _ => None,
        }
    }
}

impl RotationLayout {
    /// Number of bytes between the header and the quaternion.
    pub fn sub_header_len(self) -> usize {
        match self {
            RotationLayout::Bare => 0,
            RotationLayout::SensorId => 1,
            RotationLayout::SensorIdAndDataType => 2,
        }
    }
}

impl TrackerPacket {
    /// Decode a single datagram.
    pub fn decode(data: &[u8], params: &DecodeParams) -> Result<Self, PacketError> {
        // Our own acknowledgement has no magic, only the handshake type byte up front
        if data.first() == Some(&(PacketType::Handshake as u8)) {
            return Ok(TrackerPacket::AckEcho);
        }

        check_len(data, HEADER_MAGIC.len() + 1)?;
        if data[..HEADER_MAGIC.len()] != HEADER_MAGIC {
            return Err(PacketError::BadMagic);
        }

        let raw_type = data[3];

        if raw_type == PacketType::Handshake as u8 {
            return decode_handshake(data).map(TrackerPacket::Handshake);
        }

        check_len(data, HEADER_LEN + 1)?;

        match PacketType::from_u8(raw_type) {
            Some(PacketType::Battery) => decode_battery(data, params).map(TrackerPacket::Battery),
            Some(PacketType::Rotation) => decode_rotation(data).map(TrackerPacket::Rotation),
            Some(PacketType::Acceleration) => {
                decode_acceleration(data).map(TrackerPacket::Acceleration)
            }
            Some(PacketType::RotationAndAcceleration) => {
                let (quat, accel) = decode_rotation_and_acceleration(data, params)?;
                Ok(TrackerPacket::RotationAndAcceleration { quat, accel })
            }
            Some(PacketType::Handshake) | None => Ok(TrackerPacket::Unknown(raw_type)),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// The fixed acknowledgement sent in reply to a handshake.
pub fn handshake_ack() -> &'static [u8] {
    &HANDSHAKE_ACK
}

/// Check that a quaternion is plausible: finite components within the component limit and a
/// norm inside the configured open interval.
pub fn validate_quaternion(q: &Quaternion<f32>, params: &DecodeParams) -> bool {
    let components_ok = q
        .coords
        .iter()
        .all(|v| v.is_finite() && v.abs() < params.quat_component_limit);

    if !components_ok {
        return false;
    }

    let norm = q.norm();
    norm > params.quat_norm_min && norm < params.quat_norm_max
}

/// Check that every acceleration component is finite and strictly within `+/- limit`.
pub fn accel_in_bounds(accel: &Vector3<f32>, limit: f32) -> bool {
    accel.iter().all(|v| v.is_finite() && v.abs() < limit)
}

// ------------------------------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ------------------------------------------------------------------------------------------------

fn check_len(data: &[u8], expected: usize) -> Result<(), PacketError> {
    if data.len() < expected {
        Err(PacketError::NotEnoughData {
            expected,
            found: data.len(),
        })
    } else {
        Ok(())
    }
}

/// Read four big-endian floats in `x, y, z, w` order.
fn read_quat_xyzw(buf: &[u8]) -> Quaternion<f32> {
    let x = BigEndian::read_f32(&buf[0..4]);
    let y = BigEndian::read_f32(&buf[4..8]);
    let z = BigEndian::read_f32(&buf[8..12]);
    let w = BigEndian::read_f32(&buf[12..16]);

    Quaternion::new(w, x, y, z)
}

fn decode_handshake(data: &[u8]) -> Result<Handshake, PacketError> {
    let fw_len_idx = HEADER_LEN + HANDSHAKE_FW_LEN_OFFSET;
    check_len(data, fw_len_idx + 1)?;

    let fw_len = data[fw_len_idx] as usize;
    let fw_start = fw_len_idx + 1;
    let mac_start = fw_start + fw_len;
    check_len(data, mac_start + MAC_LEN)?;

    let p = &data[HEADER_LEN..];

    let mut mac = [0u8; MAC_LEN];
    mac.copy_from_slice(&data[mac_start..mac_start + MAC_LEN]);

    Ok(Handshake {
        board_type: BigEndian::read_i32(&p[0..4]),
        imu_type: BigEndian::read_i32(&p[4..8]),
        mcu_type: BigEndian::read_i32(&p[8..12]),
        firmware_build: BigEndian::read_i32(&p[20..24]),
        firmware: String::from_utf8_lossy(&data[fw_start..mac_start]).into_owned(),
        mac: MacAddress(mac),
    })
}

fn decode_battery(data: &[u8], params: &DecodeParams) -> Result<Battery, PacketError> {
    check_len(data, HEADER_LEN + 8)?;

    let p = &data[HEADER_LEN..];
    let voltage = BigEndian::read_f32(&p[0..4]);
    let mut percentage = BigEndian::read_f32(&p[4..8]);

    if percentage <= params.battery_fraction_threshold {
        percentage *= 100.0;
    }

    Ok(Battery {
        voltage,
        percentage,
    })
}

fn decode_rotation(data: &[u8]) -> Result<Rotation, PacketError> {
    // Longest layout first, the payload length is the only hint of which firmware sent it
    let layout = [
        RotationLayout::SensorIdAndDataType,
        RotationLayout::SensorId,
        RotationLayout::Bare,
    ]
    .iter()
    .copied()
    .find(|l| data.len() >= HEADER_LEN + l.sub_header_len() + 16)
    .ok_or(PacketError::NotEnoughData {
        expected: HEADER_LEN + 16,
        found: data.len(),
    })?;

    let start = HEADER_LEN + layout.sub_header_len();

    Ok(Rotation {
        layout,
        quat: read_quat_xyzw(&data[start..start + 16]),
    })
}

fn decode_acceleration(data: &[u8]) -> Result<Vector3<f32>, PacketError> {
    check_len(data, HEADER_LEN + 12)?;

    let p = &data[HEADER_LEN..];

    Ok(Vector3::new(
        BigEndian::read_f32(&p[0..4]),
        BigEndian::read_f32(&p[4..8]),
        BigEndian::read_f32(&p[8..12]),
    ))
}

fn decode_rotation_and_acceleration(
    data: &[u8],
    params: &DecodeParams,
) -> Result<(Quaternion<f32>, Vector3<f32>), PacketError> {
    // One byte sensor id then seven packed i16
    check_len(data, HEADER_LEN + 1 + 14)?;

    let mut raw = [0i16; 7];
    BigEndian::read_i16_into(&data[HEADER_LEN + 1..HEADER_LEN + 15], &mut raw);

    let qs = params.packed_quat_scale;
    let mut quat = Quaternion::new(
        raw[3] as f32 * qs,
        raw[0] as f32 * qs,
        raw[1] as f32 * qs,
        raw[2] as f32 * qs,
    );

    if quat.norm() > params.packed_quat_normalise_min {
        quat = quat.normalize();
    }

    let a = params.packed_accel_scale;
    let accel = Vector3::new(raw[4] as f32 * a, raw[5] as f32 * a, raw[6] as f32 * a);

    Ok((quat, accel))
}
