//! In-memory TinyG used by the controller tests
//!
//! `FirmwareSim` answers every line the controller writes the way TinyG does:
//! a response with a status footer, queue reports as moves enter and leave
//! the planner, status reports as the machine starts and stops, and probe
//! reports for `G38.2`.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tinylink_communication::{
    ConnectionParams, Transport, TransportConnector, TransportEvent, TransportLink, WireCodec,
};
use tinylink_core::{ConnectionError, GcodeLine};
use tinylink_settings::Config;
use tokio::sync::mpsc;

const AXES: [&str; 3] = ["x", "y", "z"];

/// Simulated firmware state
#[derive(Debug)]
pub struct FirmwareSim {
    events: Option<mpsc::UnboundedSender<TransportEvent>>,
    /// Every line written, terminator removed
    pub lines: Vec<String>,
    /// Every single-byte control written
    pub controls: Vec<u8>,
    /// Number of times the link was opened
    pub opens: usize,
    /// Planner size
    pub capacity: usize,
    /// Planner slots in use
    pub occupied: usize,
    /// Machine position, mm
    pub machine: [f64; 3],
    /// Active work offset, mm
    pub offset: [f64; 3],
    /// Work Z at which the probe touches
    pub probe_contact_z: Option<f64>,
    /// Interpret `G38.2` targets as machine coordinates
    pub probe_uses_machine_coordinates: bool,
    /// Send an exception report when a probe misses
    pub error_on_probe_miss: bool,
    /// Keep moves in the planner until `finish_moves`
    pub hold_moves: bool,
    /// Reject lines containing this text with the given status
    pub reject: Option<(String, u16)>,
    held_moves: Vec<[f64; 3]>,
}

impl Default for FirmwareSim {
    fn default() -> Self {
        Self {
            events: None,
            lines: Vec::new(),
            controls: Vec::new(),
            opens: 0,
            capacity: 28,
            occupied: 0,
            machine: [0.0; 3],
            offset: [0.0; 3],
            probe_contact_z: None,
            probe_uses_machine_coordinates: false,
            error_on_probe_miss: false,
            hold_moves: false,
            reject: None,
            held_moves: Vec::new(),
        }
    }
}

impl FirmwareSim {
    /// Work position
    pub fn work(&self) -> [f64; 3] {
        [
            self.machine[0] - self.offset[0],
            self.machine[1] - self.offset[1],
            self.machine[2] - self.offset[2],
        ]
    }

    /// Lines written that start with `prefix`
    pub fn lines_starting_with(&self, prefix: &str) -> Vec<String> {
        self.lines
            .iter()
            .filter(|line| line.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Deliver a raw line to the controller
    pub fn emit(&self, line: impl Into<String>) {
        if let Some(events) = &self.events {
            let _ = events.send(TransportEvent::Line(line.into()));
        }
    }

    fn emit_json(&self, value: Value) {
        self.emit(value.to_string());
    }

    fn respond(&self, body: Value, status: u16) {
        self.emit_json(json!({ "r": body, "f": [1, status, 8, 1234] }));
    }

    fn status_body(&self, stat: u8) -> Value {
        let mut sr = Map::new();
        sr.insert("stat".into(), json!(stat));
        sr.insert("unit".into(), json!(1));
        let work = self.work();
        for (i, axis) in AXES.iter().enumerate() {
            sr.insert(format!("pos{}", axis), json!(work[i]));
            sr.insert(format!("mpo{}", axis), json!(self.machine[i]));
            sr.insert(format!("ofs{}", axis), json!(self.offset[i]));
        }
        Value::Object(sr)
    }

    fn current_stat(&self) -> u8 {
        if self.held_moves.is_empty() {
            3
        } else {
            5
        }
    }

    /// Deliver an asynchronous status report
    pub fn send_status(&self, stat: u8) {
        self.emit_json(json!({ "sr": self.status_body(stat) }));
    }

    fn queue_report(&self, pushed: usize, popped: usize) {
        self.emit_json(json!({
            "qr": self.capacity - self.occupied,
            "qi": pushed,
            "qo": popped
        }));
    }

    /// Deliver an exception report
    pub fn send_error_report(&self, code: u16, message: &str) {
        self.emit_json(json!({ "er": { "fb": 440.2, "st": code, "msg": message } }));
    }

    /// Drop the link from the firmware side
    pub fn drop_link(&mut self) {
        if let Some(events) = self.events.take() {
            let _ = events.send(TransportEvent::Closed);
        }
    }

    /// Execute every move held in the planner
    pub fn finish_moves(&mut self) {
        let moves: Vec<_> = self.held_moves.drain(..).collect();
        for target in moves {
            self.execute_move(target);
        }
    }

    fn handle(&mut self, data: &[u8]) {
        if data.len() == 1 && data[0] != b'\n' {
            self.handle_control(data[0]);
            return;
        }
        let line = String::from_utf8_lossy(data).trim().to_string();
        self.lines.push(line.clone());

        if let Some((text, status)) = &self.reject {
            if line.contains(text.as_str()) {
                self.respond(json!({}), *status);
                return;
            }
        }

        if line.starts_with('{') {
            self.handle_json(&line);
        } else {
            self.handle_gcode(&line);
        }
    }

    fn handle_control(&mut self, byte: u8) {
        self.controls.push(byte);
        match byte {
            0x18 => {
                self.occupied = 0;
                self.held_moves.clear();
                self.respond(
                    json!({ "fv": 0.97, "fb": 440.2, "hp": 1, "hv": 8, "msg": "SYSTEM READY" }),
                    0,
                );
            }
            b'%' => {
                let popped = self.occupied;
                self.occupied = 0;
                self.held_moves.clear();
                self.queue_report(0, popped);
            }
            _ => {}
        }
    }

    fn handle_json(&mut self, line: &str) {
        let Ok(Value::Object(map)) = WireCodec::default().decode(line) else {
            self.respond(json!({}), 108);
            return;
        };
        let Some((key, value)) = map.into_iter().next() else {
            self.respond(json!({}), 0);
            return;
        };
        let echo = json!({ key.clone(): value.clone() });
        let body = match (key.as_str(), &value) {
            ("sr", Value::Null) => json!({ "sr": self.status_body(self.current_stat()) }),
            ("qr", Value::Null) => json!({
                "qr": self.capacity - self.occupied,
                "qi": 0,
                "qo": 0
            }),
            ("g54", Value::Null) => {
                json!({ "g54": { "x": self.offset[0], "y": self.offset[1], "z": self.offset[2] } })
            }
            ("hom", Value::Null) => json!({ "hom": { "e": 0, "x": 0, "y": 0, "z": 0 } }),
            ("clear", _) => json!({}),
            (_, Value::Null) if key.starts_with('g') => {
                json!({ key.clone(): { "x": 0.0, "y": 0.0, "z": 0.0 } })
            }
            (_, Value::Object(_)) => json!({}),
            _ => echo,
        };
        self.respond(body, 0);
    }

    fn handle_gcode(&mut self, line: &str) {
        let Ok(gcode) = GcodeLine::parse(line) else {
            self.respond(json!({}), 100);
            return;
        };

        if gcode.has_word('G', 38.2) {
            self.respond(json!({}), 0);
            self.probe(&gcode);
            return;
        }

        let motion = gcode.has_word('G', 0.0) || gcode.has_word('G', 1.0);
        let homing = gcode.has_word('G', 28.2);
        if !motion && !homing {
            self.respond(json!({}), 0);
            return;
        }

        let mut target = self.machine;
        for (i, axis) in ['X', 'Y', 'Z'].iter().enumerate() {
            if let Some(value) = gcode.get(*axis) {
                target[i] = if homing {
                    0.0
                } else if gcode.has_word('G', 53.0) {
                    value
                } else {
                    value + self.offset[i]
                };
            }
        }

        self.respond(json!({}), 0);
        self.occupied += 1;
        self.queue_report(1, 0);
        if self.hold_moves {
            self.held_moves.push(target);
        } else {
            self.execute_move(target);
        }
    }

    fn execute_move(&mut self, target: [f64; 3]) {
        self.send_status(5);
        self.machine = target;
        self.occupied = self.occupied.saturating_sub(1);
        self.queue_report(0, 1);
        self.send_status(3);
    }

    fn probe(&mut self, gcode: &GcodeLine) {
        self.occupied += 1;
        self.queue_report(1, 0);
        self.send_status(7);

        let mut target = self.machine;
        for (i, axis) in ['X', 'Y', 'Z'].iter().enumerate() {
            if let Some(value) = gcode.get(*axis) {
                target[i] = if self.probe_uses_machine_coordinates {
                    value
                } else {
                    value + self.offset[i]
                };
            }
        }

        let contact = self.probe_contact_z.map(|z| z + self.offset[2]);
        let tripped = match contact {
            Some(contact) => self.machine[2] >= contact && target[2] <= contact,
            None => false,
        };
        if let (true, Some(contact)) = (tripped, contact) {
            target[2] = contact;
        }
        self.machine = target;

        if !tripped && self.error_on_probe_miss {
            self.send_error_report(204, "Probe cycle failed");
        }
        let reported = if self.probe_uses_machine_coordinates {
            self.machine
        } else {
            self.work()
        };
        self.emit_json(json!({
            "prb": {
                "e": u8::from(tripped),
                "x": reported[0],
                "y": reported[1],
                "z": reported[2]
            }
        }));
        self.occupied = self.occupied.saturating_sub(1);
        self.queue_report(0, 1);
        self.send_status(3);
    }
}

/// Write half handed to the controller
struct SimTransport {
    sim: Arc<Mutex<FirmwareSim>>,
}

impl Transport for SimTransport {
    fn write(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        let mut sim = self.sim.lock();
        if sim.events.is_none() {
            return Err(ConnectionError::ConnectionLost {
                reason: "simulated link is down".to_string(),
            });
        }
        sim.handle(data);
        Ok(())
    }

    fn close(&mut self) {
        self.sim.lock().events = None;
    }

    fn name(&self) -> String {
        "sim".to_string()
    }
}

/// Connector that opens links to a shared `FirmwareSim`
#[derive(Clone, Default)]
pub struct SimConnector {
    /// The simulated firmware
    pub sim: Arc<Mutex<FirmwareSim>>,
}

#[async_trait]
impl TransportConnector for SimConnector {
    async fn open(&self, _params: &ConnectionParams) -> Result<TransportLink, ConnectionError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut sim = self.sim.lock();
            sim.events = Some(tx);
            sim.opens += 1;
        }
        Ok(TransportLink {
            transport: Box::new(SimTransport {
                sim: self.sim.clone(),
            }),
            events: rx,
        })
    }
}

/// Test configuration: no reconnects unless asked for
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.connection.auto_reconnect = false;
    config.connection.reconnect_delay_ms = 50;
    config
}

/// Bound on how long a test waits for the controller
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);
