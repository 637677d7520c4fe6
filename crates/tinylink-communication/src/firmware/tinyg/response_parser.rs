//! TinyG Response Parser
//!
//! Classifies decoded wire objects into the message kinds the controller
//! reacts to: command responses with their footer, status reports, queue
//! reports, error reports, probe reports and the startup banner.

use super::codec::WireCodec;
use serde_json::{Map, Value};
use tinylink_core::{Axis, AxisValues, ProtocolError};

/// Response footer (`"f":[revision, status, rx_available, checksum]`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Footer {
    /// Footer revision
    pub revision: u16,
    /// Status code of the command
    pub status: u16,
    /// Bytes available in the firmware receive buffer
    pub rx_available: Option<u16>,
    /// Line checksum
    pub checksum: Option<u32>,
}

impl Footer {
    fn parse(value: &Value) -> Result<Self, ProtocolError> {
        let items = value.as_array().ok_or_else(|| unexpected("footer is not an array"))?;
        let field = |i: usize| items.get(i).and_then(Value::as_u64);
        let small = |v: u64| u16::try_from(v).map_err(|_| unexpected("footer field out of range"));
        Ok(Self {
            revision: field(0).map(small).transpose()?.unwrap_or(1),
            status: small(field(1).ok_or_else(|| unexpected("footer has no status"))?)?,
            rx_available: field(2).map(small).transpose()?,
            checksum: field(3)
                .map(|v| u32::try_from(v).map_err(|_| unexpected("footer checksum out of range")))
                .transpose()?,
        })
    }
}

/// Planner queue report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueReport {
    /// Free planner slots now (`qr`)
    pub free: usize,
    /// Slots filled since the previous report (`qi`)
    pub pushed: usize,
    /// Slots vacated since the previous report (`qo`)
    pub popped: usize,
}

impl QueueReport {
    /// Extract a queue report from an object carrying `qr` (and optionally `qi`/`qo`).
    ///
    /// Slot counts that can't fit a planner are rejected.
    pub fn from_object(map: &Map<String, Value>) -> Result<Option<Self>, ProtocolError> {
        let Some(free) = map.get("qr").and_then(Value::as_u64) else {
            return Ok(None);
        };
        let count = |value: u64| {
            u16::try_from(value)
                .map(usize::from)
                .map_err(|_| unexpected("queue report count out of range"))
        };
        let field = |key: &str| count(map.get(key).and_then(Value::as_u64).unwrap_or(0));
        Ok(Some(Self {
            free: count(free)?,
            pushed: field("qi")?,
            popped: field("qo")?,
        }))
    }
}

/// Probe cycle report (`prb`)
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProbeReport {
    /// True if the probe tripped
    pub tripped: bool,
    /// Reported position per axis
    pub position: AxisValues,
}

impl ProbeReport {
    /// Parse the `prb` object
    pub fn from_value(value: &Value) -> Result<Self, ProtocolError> {
        let map = value
            .as_object()
            .ok_or_else(|| unexpected("probe report is not an object"))?;
        let tripped = match map.get("e") {
            Some(Value::Bool(b)) => *b,
            Some(v) => v.as_f64() == Some(1.0),
            None => false,
        };
        let position = axis_values(map, "");
        Ok(Self { tripped, position })
    }
}

/// Classified TinyG message
#[derive(Debug, Clone, PartialEq)]
pub enum TinyGMessage {
    /// Response to a command (`r`)
    Response {
        /// Response body
        body: Map<String, Value>,
        /// Footer, absent for footer-less firmware builds
        footer: Option<Footer>,
    },
    /// Asynchronous status report (`sr`)
    StatusReport(Map<String, Value>),
    /// Asynchronous queue report (`qr`/`qi`/`qo`)
    QueueReport(QueueReport),
    /// Exception report (`er`)
    ErrorReport {
        /// Status code, if present
        code: Option<u16>,
        /// Message text
        message: String,
    },
    /// Probe report (`prb`)
    ProbeReport(ProbeReport),
    /// Startup banner
    Startup {
        /// Firmware version, if reported
        version: Option<f64>,
    },
    /// Anything else
    Unknown(Value),
}

impl TinyGMessage {
    /// Status code of a response; 0 if the response had no footer
    pub fn status(&self) -> Option<u16> {
        match self {
            TinyGMessage::Response { footer, .. } => Some(footer.map(|f| f.status).unwrap_or(0)),
            _ => None,
        }
    }
}

/// TinyG response parser
#[derive(Debug, Default, Clone)]
pub struct TinyGResponseParser {
    codec: WireCodec,
}

impl TinyGResponseParser {
    /// Create a parser using the given codec
    pub fn new(codec: WireCodec) -> Self {
        Self { codec }
    }

    /// Decode and classify one line
    pub fn parse(&self, line: &str) -> Result<TinyGMessage, ProtocolError> {
        let value = self.codec.decode(line.trim())?;
        classify(value)
    }
}

/// Classify a decoded value
pub fn classify(value: Value) -> Result<TinyGMessage, ProtocolError> {
    let Value::Object(mut map) = value else {
        return Ok(TinyGMessage::Unknown(value));
    };

    if let Some(body) = map.remove("r") {
        let footer = map.get("f").map(Footer::parse).transpose()?;
        let body = match body {
            Value::Object(body) => body,
            Value::Null => Map::new(),
            other => {
                let mut wrapped = Map::new();
                wrapped.insert("value".to_string(), other);
                wrapped
            }
        };
        if is_startup_banner(&body) {
            return Ok(TinyGMessage::Startup {
                version: body.get("fv").and_then(Value::as_f64),
            });
        }
        // A probe report wrapped as a response is not an answer to any command
        if body.len() == 1 {
            if let Some(prb) = body.get("prb") {
                return Ok(TinyGMessage::ProbeReport(ProbeReport::from_value(prb)?));
            }
        }
        return Ok(TinyGMessage::Response { body, footer });
    }

    if let Some(sr) = map.remove("sr") {
        return match sr {
            Value::Object(sr) => Ok(TinyGMessage::StatusReport(sr)),
            _ => Err(unexpected("status report is not an object")),
        };
    }

    if let Some(report) = QueueReport::from_object(&map)? {
        return Ok(TinyGMessage::QueueReport(report));
    }

    if let Some(er) = map.remove("er") {
        let code = er
            .get("st")
            .and_then(Value::as_u64)
            .and_then(|c| u16::try_from(c).ok());
        let message = er
            .get("msg")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        return Ok(TinyGMessage::ErrorReport { code, message });
    }

    if let Some(prb) = map.get("prb") {
        return Ok(TinyGMessage::ProbeReport(ProbeReport::from_value(prb)?));
    }

    Ok(TinyGMessage::Unknown(Value::Object(map)))
}

fn is_startup_banner(body: &Map<String, Value>) -> bool {
    body.get("msg")
        .and_then(Value::as_str)
        .is_some_and(|msg| msg.eq_ignore_ascii_case("SYSTEM READY"))
}

/// Read per-axis values from `<prefix>x`, `<prefix>y`, ... keys
pub fn axis_values(map: &Map<String, Value>, prefix: &str) -> AxisValues {
    Axis::ALL
        .iter()
        .filter_map(|axis| {
            let key = format!("{}{}", prefix, axis.letter());
            map.get(&key).and_then(Value::as_f64).map(|v| (*axis, v))
        })
        .collect()
}

fn unexpected(reason: &str) -> ProtocolError {
    ProtocolError::UnexpectedMessage {
        reason: reason.to_string(),
    }
}
