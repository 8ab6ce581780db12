//! # Equipment Interface
//!
//! This module defines the wire formats exchanged with the rig's equipment. Every decoder here is
//! pure: it takes bytes and returns a typed value or an error, and never panics on short input.

// -----------------------------------------------------------------------------------------------
// MODULES
// -----------------------------------------------------------------------------------------------

pub mod bus;
pub mod dongle;
pub mod tracker;
