//! # Axis Phase Machine
//!
//! What the rig believes about one axis, updated from the commands it sent and the heartbeats it
//! received. Transitions are a pure function so the bring-up, move and idle sequences can be
//! checked without a bus.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use comms_if::eqpt::bus::{AxisState, Heartbeat};

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisPhase {
    /// Not energised. Initial and final phase.
    Idle,

    /// The axis reported an error.
    Fault,

    /// Errors cleared and closed loop requested, waiting for confirmation.
    Arming,

    /// Confirmed in closed loop control with no move pending.
    ClosedLoop,

    /// A position command was sent and the trajectory has not been reported done.
    Moving,

    /// The last trajectory was reported done.
    Settled,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AxisEvent {
    /// Clear errors, controller mode and closed loop request were sent.
    InitSent,

    Heartbeat(Heartbeat),

    /// A position command was sent.
    MoveSent,

    /// The idle request was sent.
    IdleSent,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl AxisPhase {
    /// True once closed loop control has been confirmed.
    pub fn is_energised(self) -> bool {
        matches!(
            self,
            AxisPhase::ClosedLoop | AxisPhase::Moving | AxisPhase::Settled
        )
    }
}

// ------------------------------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Phase of an axis after `event`.
pub fn transition(phase: AxisPhase, event: AxisEvent) -> AxisPhase {
    use AxisPhase::*;

    match (phase, event) {
        (_, AxisEvent::IdleSent) => Idle,
        (_, AxisEvent::InitSent) => Arming,

        // Bring-up is tolerant: a move may be issued before closed loop was confirmed
        (Arming, AxisEvent::MoveSent) => Moving,
        (ClosedLoop, AxisEvent::MoveSent)
        | (Moving, AxisEvent::MoveSent)
        | (Settled, AxisEvent::MoveSent) => Moving,
        (p, AxisEvent::MoveSent) => p,

        (p, AxisEvent::Heartbeat(hb)) => on_heartbeat(p, &hb),
    }
}

// ------------------------------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ------------------------------------------------------------------------------------------------

fn on_heartbeat(phase: AxisPhase, hb: &Heartbeat) -> AxisPhase {
    use AxisPhase::*;

    match phase {
        // Stale errors may still be reported while the clear is processed
        Arming => match hb.axis_state {
            AxisState::ClosedLoop => ClosedLoop,
            _ => Arming,
        },

        // Only a new bring-up leaves these
        Idle | Fault => phase,

        ClosedLoop | Moving | Settled if hb.axis_error != 0 => Fault,

        ClosedLoop | Moving | Settled => match hb.axis_state {
            AxisState::Idle => Idle,
            AxisState::ClosedLoop if phase == Moving && hb.trajectory_done => Settled,
            _ => phase,
        },
    }
}
