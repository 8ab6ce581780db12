//! # SocketCAN Motor Bus
//!
//! [`MotorBus`] over a Linux SocketCAN interface using 11 bit standard identifiers.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use comms_if::eqpt::bus::BusFrame;
use log::debug;
use socketcan::{CanFrame, CanSocket, EmbeddedFrame, Id, Socket, StandardId};
use std::{io, time::Duration};

use super::{BusError, MotorBus};

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// `ENOBUFS`, returned by the kernel when the interface transmit queue is full.
const ENOBUFS: i32 = 105;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

pub struct CanBus {
    socket: CanSocket,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl CanBus {
    /// Open the named interface, e.g. `can0`.
    pub fn open(channel: &str) -> Result<Self, BusError> {
        let socket = CanSocket::open(channel).map_err(BusError::Io)?;

        // Writes must fail fast so the backoff loop can handle a full queue
        socket.set_nonblocking(true).map_err(BusError::Io)?;

        Ok(Self { socket })
    }
}

impl MotorBus for CanBus {
    fn send(&mut self, frame: &BusFrame) -> Result<(), BusError> {
        let id = StandardId::new(frame.arbitration_id() as u16).ok_or_else(|| {
            BusError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "arbitration id out of range",
            ))
        })?;

        let can_frame = if frame.remote {
            CanFrame::new_remote(id, frame.dlc() as usize)
        } else {
            CanFrame::new(id, frame.payload())
        }
        .ok_or_else(|| {
            BusError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "could not build CAN frame",
            ))
        })?;

        self.socket.write_frame(&can_frame).map_err(map_write_error)
    }

    fn recv(&mut self, timeout: Duration) -> Result<Option<BusFrame>, BusError> {
        let can_frame = match self.socket.read_frame_timeout(timeout) {
            Ok(f) => f,
            Err(e) if is_timeout(&e) => return Ok(None),
            Err(e) => return Err(BusError::Io(e)),
        };

        let raw_id = match can_frame.id() {
            Id::Standard(id) => id.as_raw() as u32,
            Id::Extended(_) => return Ok(None),
        };

        match BusFrame::from_raw(raw_id, can_frame.data(), can_frame.is_remote_frame()) {
            Ok(f) => Ok(Some(f)),
            Err(e) => {
                debug!("Ignoring CAN frame 0x{:03X}: {}", raw_id, e);
                Ok(None)
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ------------------------------------------------------------------------------------------------

fn map_write_error(e: io::Error) -> BusError {
    if e.kind() == io::ErrorKind::WouldBlock || e.raw_os_error() == Some(ENOBUFS) {
        BusError::Busy
    } else {
        BusError::Io(e)
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}
