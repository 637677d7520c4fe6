//! TinyG Command Creator
//!
//! Builds the G-code and JSON lines the controller sends on its own behalf:
//! moves, homing, probing, queries, configuration writes and the
//! initialization sequence.

use super::codec::WireCodec;
use super::machine_state::STATUS_REPORT_FIELDS;
use serde_json::{json, Map, Value};
use tinylink_core::{Axis, AxisValues};

/// Single-byte commands that bypass the send queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCode {
    /// Feed hold (`!`)
    FeedHold,
    /// Cycle start / resume (`~`)
    Resume,
    /// Planner queue flush (`%`), only honoured during a hold
    QueueFlush,
    /// Soft reset (ctrl-x)
    Cancel,
}

impl ControlCode {
    /// Byte written to the wire
    pub fn as_byte(&self) -> u8 {
        match self {
            Self::FeedHold => b'!',
            Self::Resume => b'~',
            Self::QueueFlush => b'%',
            Self::Cancel => 0x18,
        }
    }

    /// Printable name for logs and events
    pub fn label(&self) -> &'static str {
        match self {
            Self::FeedHold => "!",
            Self::Resume => "~",
            Self::QueueFlush => "%",
            Self::Cancel => "^X",
        }
    }
}

/// Motion mode for generated moves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionType {
    /// `G0`
    Rapid,
    /// `G1`
    Linear,
}

/// Coordinate systems queried at startup
pub const COORDINATE_SYSTEMS: &[&str] = &["g54", "g55", "g56", "g57", "g58", "g59", "g92"];

/// Stored positions queried at startup
pub const STORED_POSITIONS: &[&str] = &["g28", "g30"];

/// TinyG command creator
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandCreator {
    codec: WireCodec,
}

impl CommandCreator {
    /// Create a command creator formatting numbers with `codec`
    pub fn new(codec: WireCodec) -> Self {
        Self { codec }
    }

    /// Codec used for numbers and JSON
    pub fn codec(&self) -> &WireCodec {
        &self.codec
    }

    fn axis_words(&self, target: &AxisValues) -> String {
        target
            .iter()
            .map(|(axis, value)| format!("{}{}", axis, self.codec.format_number(value)))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Absolute move; `G0` without a feed rate, `G1` with one
    pub fn move_to(&self, target: &AxisValues, feed: Option<f64>) -> String {
        let motion = if feed.is_some() {
            MotionType::Linear
        } else {
            MotionType::Rapid
        };
        let mut line = format!(
            "G90 {} {}",
            match motion {
                MotionType::Rapid => "G0",
                MotionType::Linear => "G1",
            },
            self.axis_words(target)
        );
        if let Some(feed) = feed {
            line.push_str(&format!(" F{}", self.codec.format_number(feed)));
        }
        line
    }

    /// Rapid move in machine coordinates
    pub fn machine_rapid(&self, target: &AxisValues) -> String {
        format!("G53 G0 {}", self.axis_words(target))
    }

    /// Homing cycle for the given axes
    pub fn home(&self, axes: &[Axis]) -> String {
        let words: Vec<String> = axes.iter().map(|axis| format!("{}0", axis)).collect();
        format!("G28.2 {}", words.join(" "))
    }

    /// Straight probe toward `target`, stopping on contact
    pub fn probe(&self, target: &AxisValues, feed: f64) -> String {
        format!(
            "G38.2 {} F{}",
            self.axis_words(target),
            self.codec.format_number(feed)
        )
    }

    /// Read a value: `{"key":null}`
    pub fn query(&self, key: &str) -> String {
        self.codec.encode(&json!({ key: null }))
    }

    /// Write a value: `{"key":value}`
    pub fn write(&self, key: &str, value: Value) -> String {
        self.codec.encode(&json!({ key: value }))
    }

    /// Request a full status report
    pub fn status_request(&self) -> String {
        self.query("sr")
    }

    /// Request a queue report
    pub fn queue_report_request(&self) -> String {
        self.query("qr")
    }

    /// Clear an alarm
    pub fn clear_alarm(&self) -> String {
        self.query("clear")
    }

    /// Status report field selection
    pub fn status_report_setup(&self) -> String {
        let fields: Map<String, Value> = STATUS_REPORT_FIELDS
            .iter()
            .map(|field| (field.to_string(), Value::Bool(true)))
            .collect();
        let mut setup = Map::new();
        setup.insert("sr".to_string(), Value::Object(fields));
        self.codec
            .with_abbreviated_literals(true)
            .encode(&Value::Object(setup))
    }

    /// Lines sent after the port opens, in order
    pub fn init_sequence(&self, status_interval_ms: u64) -> Vec<String> {
        let mut lines = vec![
            // echo off
            self.write("ee", json!(0)),
            // verbose JSON responses with footers
            self.write("jv", json!(4)),
            // triple queue reports
            self.write("qv", json!(2)),
            // filtered status reports
            self.write("sv", json!(1)),
            self.write("si", json!(status_interval_ms)),
            self.status_report_setup(),
        ];
        lines.extend(
            COORDINATE_SYSTEMS
                .iter()
                .chain(STORED_POSITIONS)
                .map(|key| self.query(key)),
        );
        lines.push(self.query("hom"));
        lines.push(self.status_request());
        lines.push(self.queue_report_request());
        lines
    }
}
