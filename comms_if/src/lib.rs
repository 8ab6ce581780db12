//! # Communications interface crate.
//!
//! Provides the wire-level interfaces used by the rig software: the motor bus frame codec, the
//! tracker UDP packet codec and the tracker dongle report codec.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

/// Wire formats for the equipment the rig talks to (motor bus, trackers)
pub mod eqpt;
