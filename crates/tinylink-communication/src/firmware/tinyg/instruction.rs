//! Instructions and their completion handles
//!
//! An [`Instruction`] is one line of work for the firmware together with the
//! controller's estimate of what it costs. Enqueuing it yields an
//! [`InstructionHandle`] that can await each lifecycle stage.

use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use tinylink_core::{ControllerError, GcodeLine};
use tokio::sync::watch;

use super::codec::WireCodec;

/// Planner slots consumed by an arc (worst case)
pub const ARC_PLANNER_SLOTS: u8 = 4;

/// Ordering key of a queued instruction.
///
/// Normal instructions get consecutive integers. Immediate instructions are
/// spliced between two existing ids and get a fractional value.
#[derive(Debug, Clone, Copy)]
pub struct LineId(f64);

impl LineId {
    /// Wrap a raw id
    pub fn new(value: f64) -> Self {
        Self(value)
    }

    /// Raw id value
    pub fn value(self) -> f64 {
        self.0
    }

    /// Id halfway between two ids
    pub fn midpoint(self, other: LineId) -> LineId {
        LineId(self.0 + (other.0 - self.0) / 2.0)
    }
}

impl PartialEq for LineId {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for LineId {}

impl PartialOrd for LineId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LineId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl fmt::Display for LineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Enqueue priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    /// Append to the tail, subject to flow control
    #[default]
    Normal,
    /// Send next, ahead of queued work and flow control
    Immediate,
}

/// One logical unit of work
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    /// Wire text, without line terminator
    pub text: String,
    /// Parsed G-code, for G-code lines
    pub gcode: Option<GcodeLine>,
    /// Estimated planner slots the instruction occupies
    pub planner_slots: u8,
    /// Must run alone: all earlier work retired before it is sent, nothing
    /// sent after it until it retires
    pub full_sync: bool,
    /// Firmware answers this line
    pub expects_response: bool,
}

impl Instruction {
    /// Build an instruction from a raw line, classifying it by content
    pub fn from_text(text: impl Into<String>) -> Self {
        let text = text.into();
        let trimmed = text.trim();

        if trimmed.is_empty() {
            return Self {
                text,
                gcode: None,
                planner_slots: 0,
                full_sync: false,
                expects_response: false,
            };
        }

        if trimmed.starts_with('{') {
            let full_sync = WireCodec::default()
                .decode(trimmed)
                .map(|value| is_config_write(&value))
                .unwrap_or(false);
            return Self {
                text,
                gcode: None,
                planner_slots: 0,
                full_sync,
                expects_response: true,
            };
        }

        match GcodeLine::parse(trimmed) {
            Ok(line) => {
                let mut instruction = Self::from_gcode(&line);
                instruction.text = text;
                instruction
            }
            Err(e) => {
                tracing::debug!("Sending unparsed line {:?}: {}", trimmed, e);
                Self {
                    text,
                    gcode: None,
                    planner_slots: 1,
                    full_sync: false,
                    expects_response: true,
                }
            }
        }
    }

    /// Build an instruction from a parsed G-code line
    pub fn from_gcode(line: &GcodeLine) -> Self {
        Self {
            text: line.to_string(),
            gcode: Some(line.clone()),
            planner_slots: estimate_planner_slots(line),
            full_sync: requires_full_sync(line),
            expects_response: true,
        }
    }

    /// Build an instruction from a structured JSON command
    pub fn from_json(value: &Value, codec: &WireCodec) -> Self {
        Self {
            text: codec.encode(value),
            gcode: None,
            planner_slots: 0,
            full_sync: is_config_write(value),
            expects_response: true,
        }
    }

    /// Override the planner slot estimate
    pub fn with_planner_slots(mut self, slots: u8) -> Self {
        self.planner_slots = slots;
        self
    }

    /// Override the full-sync flag
    pub fn with_full_sync(mut self, full_sync: bool) -> Self {
        self.full_sync = full_sync;
        self
    }

    /// Override whether a response is expected
    pub fn with_expects_response(mut self, expects_response: bool) -> Self {
        self.expects_response = expects_response;
        self
    }
}

/// Planner slots a G-code line is expected to take.
///
/// Motion, dwell and M-codes are queued in the planner; arcs may be split into
/// several segments. Lines that only change modal state are handled by the
/// parser and never reach the planner.
pub fn estimate_planner_slots(line: &GcodeLine) -> u8 {
    let mut slots = 0;
    for code in line.codes('G') {
        let code = (code * 10.0).round() as i64;
        match code {
            20 | 30 => slots = slots.max(ARC_PLANNER_SLOTS),
            0 | 10 | 40 | 382 | 383 | 384 | 385 | 282 | 283 | 280 | 300 => slots = slots.max(1),
            _ => {}
        }
    }
    if line.codes('M').next().is_some() {
        slots = slots.max(1);
    }
    if slots == 0 && line.codes('G').next().is_none() {
        // Bare axis words continue the modal motion
        let has_axis = line
            .words()
            .iter()
            .any(|w| matches!(w.letter, 'X' | 'Y' | 'Z' | 'A' | 'B' | 'C'));
        if has_axis {
            slots = 1;
        }
    }
    slots
}

/// G10 and the stored-position setters write EEPROM on TinyG
pub fn requires_full_sync(line: &GcodeLine) -> bool {
    line.codes('G').any(|code| {
        let code = (code * 10.0).round() as i64;
        matches!(code, 100 | 281 | 301)
    })
}

/// A JSON command that assigns a non-null value is a configuration write
pub fn is_config_write(value: &Value) -> bool {
    match value {
        Value::Object(map) => map.values().any(|v| !v.is_null()),
        _ => false,
    }
}

/// Lifecycle stage of an instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    /// Waiting in the send queue
    Queued,
    /// Written to the wire
    Sent,
    /// Firmware responded
    Acknowledged,
    /// At the head of the planner
    Executing,
    /// Retired from the planner
    Executed,
}

/// Progress of one instruction, observed through its handle
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    /// Current id of the instruction
    pub id: LineId,
    /// Furthest stage reached
    pub stage: Stage,
    /// Firmware response body, once acknowledged
    pub response: Option<Value>,
    /// Terminal error
    pub error: Option<ControllerError>,
}

/// Producer side of an instruction's progress
#[derive(Debug)]
pub(crate) struct ProgressTracker {
    tx: watch::Sender<Progress>,
}

impl ProgressTracker {
    pub(crate) fn new(id: LineId) -> (Self, InstructionHandle) {
        let (tx, rx) = watch::channel(Progress {
            id,
            stage: Stage::Queued,
            response: None,
            error: None,
        });
        (Self { tx }, InstructionHandle { rx })
    }

    pub(crate) fn set_id(&self, id: LineId) {
        self.tx.send_modify(|p| p.id = id);
    }

    fn advance(&self, stage: Stage) {
        self.tx.send_if_modified(|p| {
            if p.error.is_some() || p.stage >= stage {
                return false;
            }
            p.stage = stage;
            true
        });
    }

    pub(crate) fn sent(&self) {
        self.advance(Stage::Sent);
    }

    pub(crate) fn acknowledged(&self, response: Value) {
        self.tx.send_if_modified(|p| {
            if p.error.is_some() || p.stage >= Stage::Acknowledged {
                return false;
            }
            p.stage = Stage::Acknowledged;
            p.response = Some(response);
            true
        });
    }

    pub(crate) fn executing(&self) {
        self.advance(Stage::Executing);
    }

    pub(crate) fn executed(&self) {
        self.advance(Stage::Executed);
    }

    pub(crate) fn errored(&self, error: ControllerError) {
        self.tx.send_if_modified(|p| {
            if p.error.is_some() || p.stage == Stage::Executed {
                return false;
            }
            p.error = Some(error);
            true
        });
    }

    pub(crate) fn stage(&self) -> Stage {
        self.tx.borrow().stage
    }
}

/// Caller side of an enqueued instruction
#[derive(Debug, Clone)]
pub struct InstructionHandle {
    rx: watch::Receiver<Progress>,
}

impl InstructionHandle {
    /// Current id (may change if the queue renumbers unsent entries)
    pub fn id(&self) -> LineId {
        self.rx.borrow().id
    }

    /// Snapshot of the current progress
    pub fn progress(&self) -> Progress {
        self.rx.borrow().clone()
    }

    /// Furthest stage reached
    pub fn stage(&self) -> Stage {
        self.rx.borrow().stage
    }

    /// Terminal error, if the instruction failed
    pub fn error(&self) -> Option<ControllerError> {
        self.rx.borrow().error.clone()
    }

    /// Has the instruction finished, successfully or not
    pub fn is_finished(&self) -> bool {
        let p = self.rx.borrow();
        p.error.is_some() || p.stage == Stage::Executed
    }

    async fn wait_for(&mut self, stage: Stage) -> Result<Progress, ControllerError> {
        let progress = self
            .rx
            .wait_for(|p| p.error.is_some() || p.stage >= stage)
            .await
            .map(|p| p.clone())
            .map_err(|_| ControllerError::Cancelled {
                reason: "controller stopped".to_string(),
            })?;
        match progress.error {
            Some(error) => Err(error),
            None => Ok(progress),
        }
    }

    /// Wait until the line is on the wire
    pub async fn sent(&mut self) -> Result<(), ControllerError> {
        self.wait_for(Stage::Sent).await.map(|_| ())
    }

    /// Wait for the firmware response
    pub async fn acknowledged(&mut self) -> Result<Value, ControllerError> {
        let progress = self.wait_for(Stage::Acknowledged).await?;
        Ok(progress.response.unwrap_or(Value::Null))
    }

    /// Wait until the instruction reaches the head of the planner
    pub async fn executing(&mut self) -> Result<(), ControllerError> {
        self.wait_for(Stage::Executing).await.map(|_| ())
    }

    /// Wait until the instruction has retired
    pub async fn executed(&mut self) -> Result<(), ControllerError> {
        self.wait_for(Stage::Executed).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn gcode(text: &str) -> Instruction {
        Instruction::from_text(text)
    }

    #[test]
    fn test_line_id_order() {
        let a = LineId::new(1.0);
        let b = LineId::new(2.0);
        let mid = a.midpoint(b);
        assert!(a < mid && mid < b);
        assert_eq!(mid.value(), 1.5);
    }

    #[test]
    fn test_planner_slot_estimates() {
        assert_eq!(gcode("G1 X10 F100").planner_slots, 1);
        assert_eq!(gcode("G0 Z5").planner_slots, 1);
        assert_eq!(gcode("G2 X1 Y1 I1").planner_slots, 4);
        assert_eq!(gcode("G4 P1").planner_slots, 1);
        assert_eq!(gcode("M3 S1000").planner_slots, 1);
        assert_eq!(gcode("X5 Y5").planner_slots, 1);
        assert_eq!(gcode("G90 G21").planner_slots, 0);
        assert_eq!(gcode("G38.2 Z-10 F25").planner_slots, 1);
        assert_eq!(gcode(r#"{"sr":null}"#).planner_slots, 0);
    }

    #[test]
    fn test_full_sync_detection() {
        assert!(gcode("G10 L2 P1 X0").full_sync);
        assert!(gcode("G28.1").full_sync);
        assert!(gcode("G30.1").full_sync);
        assert!(!gcode("G28.2 X0").full_sync);
        assert!(gcode(r#"{"xvm":12000}"#).full_sync);
        assert!(!gcode(r#"{"g54":null}"#).full_sync);
        assert!(Instruction::from_json(&json!({"si": 250}), &WireCodec::default()).full_sync);
    }

    #[test]
    fn test_blank_line_expects_no_response() {
        let instruction = gcode("   ");
        assert!(!instruction.expects_response);
        assert_eq!(instruction.planner_slots, 0);
    }

    #[tokio::test]
    async fn test_handle_observes_stages() {
        let (tracker, mut handle) = ProgressTracker::new(LineId::new(1.0));
        tracker.sent();
        tracker.acknowledged(json!({"ok": true}));
        assert_eq!(handle.acknowledged().await.unwrap(), json!({"ok": true}));

        tracker.executing();
        tracker.executed();
        handle.executed().await.unwrap();
        assert!(handle.is_finished());

        // No regressions after the terminal stage
        tracker.errored(ControllerError::Cancelled {
            reason: "late".into(),
        });
        assert!(handle.error().is_none());
    }

    #[tokio::test]
    async fn test_error_rejects_waiters() {
        let (tracker, mut handle) = ProgressTracker::new(LineId::new(1.0));
        tracker.sent();
        tracker.errored(ControllerError::RequestRejected {
            code: 131,
            message: "G-code command unsupported".into(),
        });
        let err = handle.executed().await.unwrap_err();
        assert!(matches!(err, ControllerError::RequestRejected { code: 131, .. }));
    }

    #[tokio::test]
    async fn test_dropped_tracker_cancels() {
        let (tracker, mut handle) = ProgressTracker::new(LineId::new(1.0));
        drop(tracker);
        assert!(matches!(
            handle.sent().await,
            Err(ControllerError::Cancelled { .. })
        ));
    }
}
