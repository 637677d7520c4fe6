//! Data models for axes, positions, units and machine run state
//!
//! This module provides:
//! - Axis identifiers for up to six axes (X, Y, Z, A, B, C)
//! - Partial per-axis values for positions, offsets and probe targets
//! - Machine run state as reported by the controller
//! - Unit management (MM, INCH)

use serde::{Deserialize, Serialize};
use std::fmt;

/// Machine coordinate units (millimeters or inches)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Units {
    /// Millimeters (metric)
    #[default]
    MM,
    /// Inches (imperial)
    INCH,
}

impl Units {
    /// Units for a TinyG `unit` status value (0 = inches, 1 = mm)
    pub fn from_tinyg_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Units::INCH),
            1 => Some(Units::MM),
            _ => None,
        }
    }
}

impl fmt::Display for Units {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Units::MM => write!(f, "mm"),
            Units::INCH => write!(f, "in"),
        }
    }
}

/// Axis identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Axis {
    /// X-axis (typically left-right).
    X,
    /// Y-axis (typically front-back).
    Y,
    /// Z-axis (typically up-down).
    Z,
    /// A-axis (rotational around X).
    A,
    /// B-axis (rotational around Y).
    B,
    /// C-axis (rotational around Z).
    C,
}

impl Axis {
    /// All axes in wire order
    pub const ALL: [Axis; 6] = [Axis::X, Axis::Y, Axis::Z, Axis::A, Axis::B, Axis::C];

    /// Lowercase letter used in wire field names (`posx`, `g54` members)
    pub fn letter(self) -> char {
        match self {
            Axis::X => 'x',
            Axis::Y => 'y',
            Axis::Z => 'z',
            Axis::A => 'a',
            Axis::B => 'b',
            Axis::C => 'c',
        }
    }

    /// True for the X, Y and Z axes
    pub fn is_linear(self) -> bool {
        matches!(self, Axis::X | Axis::Y | Axis::Z)
    }

    /// Parse an axis letter, either case
    pub fn from_letter(c: char) -> Option<Self> {
        match c.to_ascii_lowercase() {
            'x' => Some(Axis::X),
            'y' => Some(Axis::Y),
            'z' => Some(Axis::Z),
            'a' => Some(Axis::A),
            'b' => Some(Axis::B),
            'c' => Some(Axis::C),
            _ => None,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter().to_ascii_uppercase())
    }
}

/// Per-axis values where each axis may be absent
///
/// Used for positions, coordinate offsets, homed flags, and move/probe
/// targets where only some axes are specified.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AxisValues<T: Copy = f64> {
    values: [Option<T>; 6],
}

impl<T: Copy> AxisValues<T> {
    /// Create an empty set of values
    pub fn new() -> Self {
        Self { values: [None; 6] }
    }

    /// Get the value for an axis
    pub fn get(&self, axis: Axis) -> Option<T> {
        self.values[axis.index()]
    }

    /// Set the value for an axis
    pub fn set(&mut self, axis: Axis, value: T) {
        self.values[axis.index()] = Some(value);
    }

    /// Builder-style setter
    pub fn with(mut self, axis: Axis, value: T) -> Self {
        self.set(axis, value);
        self
    }

    /// Iterate over the axes that have a value
    pub fn iter(&self) -> impl Iterator<Item = (Axis, T)> + '_ {
        Axis::ALL
            .iter()
            .filter_map(move |axis| self.get(*axis).map(|v| (*axis, v)))
    }

    /// True if no axis has a value
    pub fn is_empty(&self) -> bool {
        self.values.iter().all(Option::is_none)
    }
}

impl AxisValues<f64> {
    /// True if every present value is zero (within 1e-9)
    pub fn all_zero(&self) -> bool {
        self.iter().all(|(_, v)| v.abs() < 1e-9)
    }
}

impl<T: Copy> FromIterator<(Axis, T)> for AxisValues<T> {
    fn from_iter<I: IntoIterator<Item = (Axis, T)>>(iter: I) -> Self {
        let mut values = Self::new();
        for (axis, value) in iter {
            values.set(axis, value);
        }
        values
    }
}

impl fmt::Display for AxisValues<f64> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (axis, value) in self.iter() {
            if !first {
                write!(f, " ")?;
            }
            write!(f, "{}:{:.3}", axis, value)?;
            first = false;
        }
        Ok(())
    }
}

/// Machine run state (TinyG `stat` field)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MachineRunState {
    /// Machine is initializing
    #[default]
    Initializing,
    /// Ready for use
    Ready,
    /// Machine in alarm state
    Alarm,
    /// Program stopped (M0/M1)
    Stop,
    /// Program ended (M2/M30)
    End,
    /// Executing motion
    Run,
    /// Feed hold active
    Hold,
    /// Probe cycle active
    Probe,
    /// Cycle running (machining)
    Cycle,
    /// Homing cycle active
    Homing,
    /// Jogging
    Jog,
    /// Interlock active
    Interlock,
    /// Shutdown
    Shutdown,
    /// Panic state, needs reset
    Panic,
}

impl MachineRunState {
    /// Decode a TinyG `stat` code
    pub fn from_tinyg_code(code: i64) -> Option<Self> {
        Some(match code {
            0 => Self::Initializing,
            1 => Self::Ready,
            2 => Self::Alarm,
            3 => Self::Stop,
            4 => Self::End,
            5 => Self::Run,
            6 => Self::Hold,
            7 => Self::Probe,
            8 => Self::Cycle,
            9 => Self::Homing,
            10 => Self::Jog,
            11 => Self::Interlock,
            12 => Self::Shutdown,
            13 => Self::Panic,
            _ => return None,
        })
    }

    /// True when the machine is not moving and will not move on its own
    pub fn is_stopped(self) -> bool {
        matches!(self, Self::Ready | Self::Stop | Self::End)
    }

    /// True for the error-ish states
    pub fn is_alarmed(self) -> bool {
        matches!(self, Self::Alarm | Self::Shutdown | Self::Panic)
    }
}

impl fmt::Display for MachineRunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
