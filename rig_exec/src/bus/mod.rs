//! # Motor Bus Transport
//!
//! The control logic only ever sees the bus through the [`MotorBus`] trait, so the same axis
//! controller runs on a real SocketCAN interface or on the [`sim::SimBus`].

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

/// Per-axis receive buffering on top of a [`MotorBus`]
pub mod port;

/// Simulated bus
pub mod sim;

/// SocketCAN transport
#[cfg(feature = "can")]
pub mod can;

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use comms_if::eqpt::bus::BusFrame;
use log::warn;
use serde::{Deserialize, Serialize};
use std::{thread, time::Duration};

// ------------------------------------------------------------------------------------------------
// TRAITS
// ------------------------------------------------------------------------------------------------

/// A transport able to carry [`BusFrame`]s.
///
/// Implementors must never block in `send`. A full transmit buffer is reported as
/// [`BusError::Busy`] and retried by the caller.
pub trait MotorBus: Send {
    /// Queue a single frame for transmission.
    fn send(&mut self, frame: &BusFrame) -> Result<(), BusError>;

    /// Wait up to `timeout` for the next frame. `Ok(None)` means nothing arrived in time.
    fn recv(&mut self, timeout: Duration) -> Result<Option<BusFrame>, BusError>;
}

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Bounded exponential backoff used when the transmit buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// First delay between two attempts.
    ///
    /// Units: seconds
    pub initial_s: f64,

    /// Largest delay between two attempts.
    ///
    /// Units: seconds
    pub cap_s: f64,

    /// Number of attempts before the frame is dropped
    pub retries: u32,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("The bus transmit buffer is full")]
    Busy,

    #[error("The bus has been closed")]
    Closed,

    #[error("Bus I/O error: {0}")]
    Io(std::io::Error),
}

/// Result of a send that went through the backoff loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,

    /// Every attempt found the bus busy, the frame was discarded.
    Dropped,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_s: 0.0005,
            cap_s: 0.01,
            retries: 10,
        }
    }
}

impl BackoffPolicy {
    /// The delay to wait after the given (zero based) failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2f64.powi(attempt.min(31) as i32);
        util::time::seconds_to_std((self.initial_s * factor).min(self.cap_s))
    }
}

impl<B: MotorBus + ?Sized> MotorBus for Box<B> {
    fn send(&mut self, frame: &BusFrame) -> Result<(), BusError> {
        (**self).send(frame)
    }

    fn recv(&mut self, timeout: Duration) -> Result<Option<BusFrame>, BusError> {
        (**self).recv(timeout)
    }
}

// ------------------------------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Send a frame, retrying with exponential backoff while the bus is busy.
///
/// Exhausting the retries drops the frame with a warning and is not an error: every control
/// value is resent on the next cycle anyway. Any other bus error is returned straight away.
pub fn send_with_backoff<B>(
    bus: &mut B,
    frame: &BusFrame,
    policy: &BackoffPolicy,
) -> Result<SendOutcome, BusError>
where
    B: MotorBus + ?Sized,
{
    for attempt in 0..policy.retries {
        match bus.send(frame) {
            Ok(()) => return Ok(SendOutcome::Sent),
            Err(BusError::Busy) if attempt + 1 < policy.retries => {
                thread::sleep(policy.delay(attempt))
            }
            Err(BusError::Busy) => (),
            Err(e) => return Err(e),
        }
    }

    warn!(
        "Bus busy after {} attempts, dropping command {} for node {}",
        policy.retries, frame.command, frame.node
    );

    Ok(SendOutcome::Dropped)
}
