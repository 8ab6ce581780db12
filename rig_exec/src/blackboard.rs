//! # Blackboard
//!
//! State shared between the gimbal and tracker tasks and any observer. Everything is copied in
//! and out under a single lock, so a reader never sees a half written record and the critical
//! section never outlives a copy.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use serde::Serialize;
use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard},
};
use util::maths::shortest_signed_difference;

use crate::tracker_server::sessions::TrackerSession;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Latest commanded and measured gimbal orientation.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct SharedGimbalState {
    /// Units: degrees
    pub goal_deg: [f64; 3],

    /// Units: degrees
    pub encoder_deg: [f64; 3],

    /// Shortest signed difference from encoder to goal, in `(-180, 180]`.
    ///
    /// Units: degrees
    pub error_deg: [f64; 3],
}

/// Copy of everything on the blackboard at one instant.
#[derive(Debug, Clone, Default)]
pub struct BlackboardSnapshot {
    pub gimbal: SharedGimbalState,

    /// Number of gimbal publications so far
    pub gimbal_cycles: u64,

    pub trackers: Vec<TrackerSession>,
}

#[derive(Default)]
pub struct Blackboard {
    data: Mutex<BlackboardData>,
}

#[derive(Default)]
struct BlackboardData {
    gimbal: SharedGimbalState,
    gimbal_cycles: u64,
    trackers: BTreeMap<String, TrackerSession>,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl SharedGimbalState {
    /// Build a state from goal and measured angles, deriving the error.
    pub fn new(goal_deg: [f64; 3], encoder_deg: [f64; 3]) -> Self {
        let mut error_deg = [0.0; 3];
        for i in 0..3 {
            error_deg[i] = shortest_signed_difference(goal_deg[i], encoder_deg[i]);
        }

        Self {
            goal_deg,
            encoder_deg,
            error_deg,
        }
    }
}

impl Blackboard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a new gimbal state. Only the gimbal orchestrator calls this.
    pub fn publish_gimbal(&self, goal_deg: [f64; 3], encoder_deg: [f64; 3]) {
        let state = SharedGimbalState::new(goal_deg, encoder_deg);

        let mut data = self.lock();
        data.gimbal = state;
        data.gimbal_cycles += 1;
    }

    pub fn gimbal(&self) -> SharedGimbalState {
        self.lock().gimbal
    }

    /// Insert or replace the copy of a tracker session.
    pub fn publish_tracker(&self, session: &TrackerSession) {
        self.lock()
            .trackers
            .insert(session.id.clone(), session.clone());
    }

    pub fn remove_tracker(&self, id: &str) {
        self.lock().trackers.remove(id);
    }

    pub fn tracker(&self, id: &str) -> Option<TrackerSession> {
        self.lock().trackers.get(id).cloned()
    }

    /// All published trackers, ordered by id.
    pub fn trackers(&self) -> Vec<TrackerSession> {
        self.lock().trackers.values().cloned().collect()
    }

    pub fn snapshot(&self) -> BlackboardSnapshot {
        let data = self.lock();

        BlackboardSnapshot {
            gimbal: data.gimbal,
            gimbal_cycles: data.gimbal_cycles,
            trackers: data.trackers.values().cloned().collect(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BlackboardData> {
        // A panicking writer cannot leave a partial record, every write is a single assignment
        match self.data.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
