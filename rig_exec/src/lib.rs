//! # Rig library.
//!
//! This library allows other crates in the workspace to access items defined inside the rig
//! crate.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

/// Axis control - drives a single motor axis through bring-up, moves and idle
pub mod axis_ctrl;

/// State shared between the gimbal and tracker tasks
pub mod blackboard;

/// Motor bus transports and the per-axis message router
pub mod bus;

/// Gimbal orchestrator - moves the three axes through goals supplied by a motion source
pub mod gimbal;

/// Persistent tracker records
pub mod log_sink;

/// Executable parameters
pub mod params;

/// Tracker server - sessions for trackers talking over UDP or through a dongle
pub mod tracker_server;
