//! Firmware implementations
//!
//! Supported controllers:
//! - TinyG: JSON protocol with a planner buffer observed through queue reports

pub mod tinyg;
