//! # tinylink Communication
//!
//! Serial transport and TinyG protocol support for tinylink.
//! The transport layer opens the serial link and frames lines; the
//! firmware layer encodes and decodes the wire protocol, flow-controls the
//! send queue against the firmware planner, and exposes the controller
//! handle used by applications.

pub mod communication;
pub mod firmware;

pub use communication::{
    list_ports, ConnectionParams, LineFramer, ReconnectPolicy, SerialConnector, SerialPortInfo,
    SerialTransport, Transport, TransportConnector, TransportEvent, TransportLink,
};

pub use firmware::tinyg::{
    CommandCreator, CommsDiagnostics, ControlCode, Instruction, InstructionHandle, LineId,
    MachineState, PlannerMirror, Priority, ProbeOutcome, Progress, QueueReport, SendQueue, Stage,
    StatusSnapshot, TinyGController, TinyGEngine, TinyGMessage, TinyGResponseParser, WireCodec,
    WireStage,
};
