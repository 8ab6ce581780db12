//! # Rig Executable Parameters
//!
//! This module provides parameters for the rig executable. Every group has defaults matching the
//! rig hardware, so a partial (or empty) parameter file is accepted.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use comms_if::eqpt::tracker::DecodeParams;
use serde::Deserialize;

use crate::bus::BackoffPolicy;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RigExecParams {
    pub bus: BusParams,

    pub gimbal: GimbalParams,

    pub tracker: TrackerParams,

    /// Firmware conventions used when decoding tracker packets
    pub decode: DecodeParams,

    pub replay: ReplayParams,
}

/// Motor bus parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusParams {
    /// SocketCAN interface name, e.g. `can0`
    pub channel: String,

    /// Node ids of the X, Y and Z axes, in that order
    pub node_ids: [u8; 3],

    /// Retry policy for sends rejected by a full transmit buffer
    pub backoff: BackoffPolicy,

    /// Maximum number of inbound frames buffered per axis
    pub inbox_capacity: usize,

    /// How long bring-up waits for every axis to report closed loop control.
    ///
    /// Units: seconds
    pub closed_loop_timeout_s: f64,

    /// How long to wait for an encoder estimate before falling back to the cached value.
    ///
    /// Units: seconds
    pub encoder_timeout_s: f64,

    /// Ceiling on the wait for all axes to finish their trajectories.
    ///
    /// Units: seconds
    pub settle_timeout_s: f64,
}

/// Gimbal motion parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GimbalParams {
    /// Units: degrees/second
    pub speed_min_deg_s: f64,

    /// Units: degrees/second
    pub speed_max_deg_s: f64,

    /// Ratio between the trajectory acceleration limit and the velocity limit.
    pub accel_factor: f64,

    /// Axes closer than this to their goal are not commanded.
    ///
    /// Units: degrees
    pub pos_eps_deg: f64,

    /// Velocity limits closer than this to the last sent ones are not resent.
    ///
    /// Units: turns/second
    pub vel_limit_eps: f64,

    /// Units: turns/second^2
    pub accel_limit_eps: f64,

    /// Minimum time between the start of two cycles.
    ///
    /// Units: seconds
    pub cycle_period_s: f64,
}

/// Tracker server parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrackerParams {
    /// Address the UDP socket binds to
    pub bind_address: String,

    /// UDP port trackers send to
    pub port: u16,

    /// Sessions silent for longer than this are evicted.
    ///
    /// Units: seconds
    pub disconnect_threshold_s: f64,

    /// Units: seconds
    pub sweep_period_s: f64,

    /// Socket read timeout, bounds how long a stop request or sweep can be delayed.
    ///
    /// Units: seconds
    pub recv_timeout_s: f64,

    /// Archive file (relative to the session archive directory) for tracker records
    pub log_file: String,
}

/// Replay motion source parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReplayParams {
    /// Time between two rows of the replay file.
    ///
    /// Units: seconds
    pub frame_period_s: f64,

    /// Only every n-th row is used
    pub decimation: usize,

    /// Source column used for each gimbal axis
    pub axis_remap: [usize; 3],

    /// Sign applied to each gimbal axis after remapping
    pub axis_sign: [f64; 3],

    /// Restart from the first row when the file is exhausted
    pub looping: bool,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Default for BusParams {
    fn default() -> Self {
        Self {
            channel: String::from("can0"),
            node_ids: [1, 2, 3],
            backoff: BackoffPolicy::default(),
            inbox_capacity: 64,
            closed_loop_timeout_s: 2.0,
            encoder_timeout_s: 0.03,
            settle_timeout_s: 0.5,
        }
    }
}

impl Default for GimbalParams {
    fn default() -> Self {
        Self {
            speed_min_deg_s: 10.0,
            speed_max_deg_s: 10.0,
            accel_factor: 2.0,
            pos_eps_deg: 0.25,
            vel_limit_eps: 1e-3,
            accel_limit_eps: 1e-3,
            cycle_period_s: 0.1,
        }
    }
}

impl Default for TrackerParams {
    fn default() -> Self {
        Self {
            bind_address: String::from("0.0.0.0"),
            port: 6969,
            disconnect_threshold_s: 5.0,
            sweep_period_s: 1.0,
            recv_timeout_s: 0.1,
            log_file: String::from("trackers.csv"),
        }
    }
}

impl Default for ReplayParams {
    fn default() -> Self {
        Self {
            frame_period_s: 1.0 / 120.0,
            decimation: 10,
            axis_remap: [0, 1, 2],
            axis_sign: [1.0, 1.0, 1.0],
            looping: true,
        }
    }
}
