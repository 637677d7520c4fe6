//! # tinylink Core
//!
//! Core types, errors, and events shared by the tinylink crates.
//! Provides the machine data model (axes, run states, units), the
//! error taxonomy used across the communication stack, the controller
//! event dispatcher, and a minimal G-code line model.

pub mod core;
pub mod data;
pub mod error;
pub mod gcode;

pub use self::core::event::{ControllerEvent, EventDispatcher};

pub use data::{Axis, AxisValues, MachineRunState, Units};

pub use error::{
    ConnectionError, ControllerError, Error, GcodeParseError, ProtocolError, Result,
};

pub use gcode::{GcodeLine, GcodeWord};
