//! Machine state tracking
//!
//! TinyG status reports only carry the fields that changed. The state keeps
//! a flat map of every field seen since the connection opened, with nested
//! objects flattened the way TinyG names its own tokens (`{"g54":{"x":1}}`
//! becomes `g54x`), and typed accessors on top.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tinylink_core::{Axis, AxisValues, MachineRunState, Units};

/// Millimetres per inch
const MM_PER_INCH: f64 = 25.4;

/// Status report fields requested from the firmware
pub const STATUS_REPORT_FIELDS: &[&str] = &[
    "line", "posx", "posy", "posz", "posa", "mpox", "mpoy", "mpoz", "mpoa", "ofsx", "ofsy",
    "ofsz", "ofsa", "feed", "vel", "unit", "coor", "dist", "momo", "stat",
];

/// Canonical machine state
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MachineState {
    fields: BTreeMap<String, Value>,
}

impl MachineState {
    /// Create an empty state
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a partial report. Returns the names of fields whose value changed.
    pub fn apply(&mut self, partial: &Map<String, Value>) -> Vec<String> {
        let mut changed = Vec::new();
        for (key, value) in partial {
            self.merge(key, value, &mut changed);
        }
        changed
    }

    fn merge(&mut self, key: &str, value: &Value, changed: &mut Vec<String>) {
        match value {
            Value::Object(map) => {
                for (sub, value) in map {
                    self.merge(&format!("{}{}", key, sub), value, changed);
                }
            }
            _ => {
                if self.fields.get(key) != Some(value) {
                    self.fields.insert(key.to_string(), value.clone());
                    changed.push(key.to_string());
                }
            }
        }
    }

    /// Raw field value
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// All known fields
    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    /// Forget everything
    pub fn clear(&mut self) {
        self.fields.clear();
    }

    fn number(&self, key: &str) -> Option<f64> {
        self.fields.get(key).and_then(Value::as_f64)
    }

    fn axes(&self, prefix: &str) -> AxisValues {
        Axis::ALL
            .iter()
            .filter_map(|axis| {
                let key = format!("{}{}", prefix, axis.letter());
                self.number(&key).map(|v| (*axis, v))
            })
            .collect()
    }

    /// Run state (`stat`)
    pub fn run_state(&self) -> MachineRunState {
        self.number("stat")
            .and_then(|code| MachineRunState::from_tinyg_code(code as i64))
            .unwrap_or_default()
    }

    /// Active units (`unit`)
    pub fn units(&self) -> Units {
        self.number("unit")
            .and_then(|code| Units::from_tinyg_code(code as i64))
            .unwrap_or_default()
    }

    /// Work position in active units (`pos*`)
    pub fn work_position(&self) -> AxisValues {
        self.axes("pos")
    }

    /// Machine position in active units (`mpo*`, reported in mm)
    pub fn machine_position(&self) -> AxisValues {
        self.from_mm(self.axes("mpo"))
    }

    /// Active work offset in active units (`ofs*`, reported in mm)
    pub fn work_offset(&self) -> AxisValues {
        self.from_mm(self.axes("ofs"))
    }

    /// Stored coordinate offset for `g54`..`g59` or `g92`
    pub fn coordinate_offset(&self, system: &str) -> AxisValues {
        self.axes(system)
    }

    /// Stored position for `g28` or `g30`
    pub fn stored_position(&self, which: &str) -> AxisValues {
        self.axes(which)
    }

    /// Active coordinate system number, 1 = G54 .. 6 = G59
    pub fn coordinate_system(&self) -> Option<u8> {
        self.number("coor").map(|c| c as u8)
    }

    /// True in G91 incremental distance mode
    pub fn incremental(&self) -> bool {
        self.number("dist") == Some(1.0)
    }

    /// Programmed feed rate
    pub fn feed_rate(&self) -> Option<f64> {
        self.number("feed")
    }

    /// Current velocity
    pub fn velocity(&self) -> Option<f64> {
        self.number("vel")
    }

    /// Last executed line number
    pub fn line(&self) -> Option<u64> {
        self.fields.get("line").and_then(Value::as_u64)
    }

    /// Spindle enabled, if reported
    pub fn spindle_on(&self) -> Option<bool> {
        self.number("spe").map(|v| v != 0.0)
    }

    /// Coolant enabled (mist or flood), if reported
    pub fn coolant_on(&self) -> Option<bool> {
        match (self.number("com"), self.number("cof")) {
            (None, None) => None,
            (mist, flood) => Some(mist.unwrap_or(0.0) != 0.0 || flood.unwrap_or(0.0) != 0.0),
        }
    }

    /// Per-axis homed flags (`hom*`)
    pub fn homed(&self) -> AxisValues<bool> {
        Axis::ALL
            .iter()
            .filter_map(|axis| {
                let key = format!("hom{}", axis.letter());
                self.number(&key).map(|v| (*axis, v != 0.0))
            })
            .collect()
    }

    /// Convert a machine-coordinate position to work coordinates
    pub fn machine_to_work(&self, machine: &AxisValues) -> AxisValues {
        let offset = self.work_offset();
        machine
            .iter()
            .map(|(axis, v)| (axis, v - offset.get(axis).unwrap_or(0.0)))
            .collect()
    }

    /// Convert a work-coordinate position to machine coordinates
    pub fn work_to_machine(&self, work: &AxisValues) -> AxisValues {
        let offset = self.work_offset();
        work.iter()
            .map(|(axis, v)| (axis, v + offset.get(axis).unwrap_or(0.0)))
            .collect()
    }

    fn from_mm(&self, values: AxisValues) -> AxisValues {
        match self.units() {
            Units::MM => values,
            Units::INCH => values
                .iter()
                .map(|(axis, v)| {
                    if axis.is_linear() {
                        (axis, v / MM_PER_INCH)
                    } else {
                        (axis, v)
                    }
                })
                .collect(),
        }
    }
}

/// Inputs of the synchronization predicate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncInputs {
    /// Machine reports a stopped run state
    pub stopped: bool,
    /// Sent instructions still waiting for a response
    pub unacked: usize,
    /// Instructions not yet written
    pub pending: usize,
    /// Sending is enabled
    pub sending_enabled: bool,
    /// Sequence number of the newest status report
    pub last_status_seq: Option<u64>,
    /// Sequence number of the newest acknowledgement
    pub last_ack_seq: Option<u64>,
}

impl SyncInputs {
    /// True when the machine is idle, everything sent has been answered and
    /// the latest status report is newer than the latest answer
    pub fn is_synced(&self) -> bool {
        let fresh = match (self.last_status_seq, self.last_ack_seq) {
            (Some(status), Some(ack)) => status > ack,
            (Some(_), None) => true,
            (None, _) => false,
        };
        self.stopped
            && self.unacked == 0
            && (self.pending == 0 || !self.sending_enabled)
            && fresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_apply_reports_changes_only() {
        let mut state = MachineState::new();
        let changed = state.apply(&object(json!({"posx": 1.0, "stat": 3})));
        assert_eq!(changed, vec!["posx", "stat"]);

        let changed = state.apply(&object(json!({"posx": 1.0, "posy": 2.0})));
        assert_eq!(changed, vec!["posy"]);
        assert_eq!(state.work_position().get(Axis::X), Some(1.0));
        assert_eq!(state.run_state(), MachineRunState::Stop);
    }

    #[test]
    fn test_nested_objects_flatten() {
        let mut state = MachineState::new();
        state.apply(&object(json!({"g54": {"x": 10.0, "y": -5.0}, "hom": {"e": 1, "x": 1, "z": 0}})));
        assert_eq!(state.get("g54x"), Some(&json!(10.0)));
        assert_eq!(state.coordinate_offset("g54").get(Axis::Y), Some(-5.0));
        let homed = state.homed();
        assert_eq!(homed.get(Axis::X), Some(true));
        assert_eq!(homed.get(Axis::Z), Some(false));
        assert_eq!(homed.get(Axis::Y), None);
    }

    #[test]
    fn test_inch_conversion() {
        let mut state = MachineState::new();
        state.apply(&object(json!({"unit": 0, "mpox": 25.4, "mpoa": 90.0, "ofsx": 2.54})));
        assert_eq!(state.units(), Units::INCH);
        assert!((state.machine_position().get(Axis::X).unwrap() - 1.0).abs() < 1e-9);
        assert_eq!(state.machine_position().get(Axis::A), Some(90.0));
        let work = state.machine_to_work(&state.machine_position());
        assert!((work.get(Axis::X).unwrap() - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_work_machine_round_trip() {
        let mut state = MachineState::new();
        state.apply(&object(json!({"unit": 1, "ofsx": 10.0, "ofsz": -3.0})));
        let work = AxisValues::new().with(Axis::X, 1.0).with(Axis::Z, 1.0);
        let machine = state.work_to_machine(&work);
        assert_eq!(machine.get(Axis::X), Some(11.0));
        assert_eq!(machine.get(Axis::Z), Some(-2.0));
        assert_eq!(state.machine_to_work(&machine), work);
    }

    #[test]
    fn test_sync_predicate() {
        let base = SyncInputs {
            stopped: true,
            unacked: 0,
            pending: 0,
            sending_enabled: true,
            last_status_seq: Some(5),
            last_ack_seq: Some(4),
        };
        assert!(base.is_synced());
        assert!(!SyncInputs { stopped: false, ..base }.is_synced());
        assert!(!SyncInputs { unacked: 1, ..base }.is_synced());
        assert!(!SyncInputs { pending: 2, ..base }.is_synced());
        assert!(SyncInputs {
            pending: 2,
            sending_enabled: false,
            ..base
        }
        .is_synced());
        assert!(!SyncInputs {
            last_status_seq: Some(3),
            ..base
        }
        .is_synced());
        assert!(!SyncInputs {
            last_status_seq: None,
            ..base
        }
        .is_synced());
    }
}
