//! # Motion Sources
//!
//! Where the gimbal's goal angles come from: uniformly random targets for exploring the whole
//! workspace, or a replayed recording of joint angles.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use log::info;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Deserialize;
use std::{io::Read, path::Path};
use util::maths::{clamp, shortest_signed_difference};

use crate::params::{GimbalParams, ReplayParams};

// ------------------------------------------------------------------------------------------------
// TRAITS
// ------------------------------------------------------------------------------------------------

/// Supplies a goal for every gimbal cycle.
pub trait MotionSource: Send {
    /// Goal for cycle number `tick`, or `None` once the source is exhausted.
    fn next_target(&mut self, tick: u64) -> Option<MotionTarget>;
}

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionTarget {
    /// Goal of the X, Y and Z axes.
    ///
    /// Units: degrees
    pub goal_deg: [f64; 3],

    /// Requested common speed, the orchestrator clamps it to its limits. `None` lets the
    /// orchestrator pick its minimum speed.
    ///
    /// Units: degrees/second
    pub speed_deg_s: Option<f64>,
}

/// Uniformly random goals in `[0, 360)` with a uniformly random speed.
pub struct RandomSource {
    rng: StdRng,
    speed_min_deg_s: f64,
    speed_max_deg_s: f64,
}

/// Replays rows of `x_deg, y_deg, z_deg` from a CSV recording.
pub struct ReplaySource {
    frames: Vec<[f64; 3]>,

    params: ReplayParams,

    /// Time between two replayed goals.
    ///
    /// Units: seconds
    dt_s: f64,

    speed_min_deg_s: f64,
    speed_max_deg_s: f64,

    /// Index of the next row to consider
    cursor: usize,

    prev_goal_deg: Option<[f64; 3]>,
}

#[derive(Debug, Deserialize)]
struct ReplayRow {
    x_deg: f64,
    y_deg: f64,
    z_deg: f64,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("Could not read the replay file: {0}")]
    Read(csv::Error),

    #[error("The replay file contains no rows")]
    Empty,

    #[error("Axis remap {0:?} refers to a column other than 0, 1 or 2")]
    InvalidRemap([usize; 3]),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl RandomSource {
    /// Create a new source. Without a seed the generator is seeded from the OS.
    pub fn new(seed: Option<u64>, params: &GimbalParams) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };

        Self {
            rng,
            speed_min_deg_s: params.speed_min_deg_s.min(params.speed_max_deg_s),
            speed_max_deg_s: params.speed_max_deg_s.max(params.speed_min_deg_s),
        }
    }
}

impl MotionSource for RandomSource {
    fn next_target(&mut self, _tick: u64) -> Option<MotionTarget> {
        let mut goal_deg = [0.0; 3];
        for g in goal_deg.iter_mut() {
            *g = self.rng.gen_range(0.0..360.0);
        }

        let speed = self
            .rng
            .gen_range(self.speed_min_deg_s..=self.speed_max_deg_s);

        Some(MotionTarget {
            goal_deg,
            speed_deg_s: Some(speed),
        })
    }
}

impl ReplaySource {
    /// Load a recording from a CSV file with an `x_deg,y_deg,z_deg` header.
    pub fn from_path<P: AsRef<Path>>(
        path: P,
        replay: &ReplayParams,
        gimbal: &GimbalParams,
    ) -> Result<Self, ReplayError> {
        let reader = csv::Reader::from_path(path).map_err(ReplayError::Read)?;
        Self::from_csv(reader, replay, gimbal)
    }

    pub fn from_reader<R: Read>(
        reader: R,
        replay: &ReplayParams,
        gimbal: &GimbalParams,
    ) -> Result<Self, ReplayError> {
        Self::from_csv(csv::Reader::from_reader(reader), replay, gimbal)
    }

    fn from_csv<R: Read>(
        mut reader: csv::Reader<R>,
        replay: &ReplayParams,
        gimbal: &GimbalParams,
    ) -> Result<Self, ReplayError> {
        if replay.axis_remap.iter().any(|c| *c > 2) {
            return Err(ReplayError::InvalidRemap(replay.axis_remap));
        }

        let mut frames = Vec::new();
        for row in reader.deserialize() {
            let row: ReplayRow = row.map_err(ReplayError::Read)?;
            frames.push([row.x_deg, row.y_deg, row.z_deg]);
        }

        if frames.is_empty() {
            return Err(ReplayError::Empty);
        }

        let mut params = replay.clone();
        params.decimation = params.decimation.max(1);

        let dt_s = (params.frame_period_s * params.decimation as f64).max(gimbal.cycle_period_s);

        info!(
            "Loaded {} replay frames, one goal every {:.3} s",
            frames.len(),
            dt_s
        );

        Ok(Self {
            frames,
            params,
            dt_s,
            speed_min_deg_s: gimbal.speed_min_deg_s,
            speed_max_deg_s: gimbal.speed_max_deg_s,
            cursor: 0,
            prev_goal_deg: None,
        })
    }

    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }
}

impl MotionSource for ReplaySource {
    fn next_target(&mut self, _tick: u64) -> Option<MotionTarget> {
        if self.cursor >= self.frames.len() {
            if !self.params.looping {
                return None;
            }
            self.cursor = 0;
        }

        let frame = self.frames[self.cursor];
        self.cursor += self.params.decimation;

        let mut goal_deg = [0.0; 3];
        for k in 0..3 {
            goal_deg[k] = self.params.axis_sign[k] * frame[self.params.axis_remap[k]];
        }

        let prev = self.prev_goal_deg.unwrap_or(goal_deg);
        let speed = (0..3)
            .map(|k| {
                clamp(
                    shortest_signed_difference(goal_deg[k], prev[k]).abs() / self.dt_s,
                    self.speed_min_deg_s,
                    self.speed_max_deg_s,
                )
            })
            .fold(self.speed_min_deg_s, f64::max);

        self.prev_goal_deg = Some(goal_deg);

        Some(MotionTarget {
            goal_deg,
            speed_deg_s: Some(speed),
        })
    }
}
