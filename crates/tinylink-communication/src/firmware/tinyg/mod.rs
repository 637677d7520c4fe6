//! TinyG Firmware Support
//!
//! TinyG speaks a relaxed JSON dialect over the serial line. Every line sent
//! gets a response with a status footer; asynchronous status, queue and
//! exception reports arrive in between. The controller tracks the firmware's
//! planner buffer from queue reports so each instruction can report when it
//! starts and finishes executing, not only when it was accepted.

pub mod codec;
pub mod command_creator;
pub mod controller;
pub mod engine;
pub mod instruction;
pub mod machine_state;
pub mod planner;
pub mod probe;
pub mod response_parser;
pub mod send_queue;
pub mod status_codes;

pub use codec::WireCodec;
pub use command_creator::{CommandCreator, ControlCode, MotionType};
pub use controller::TinyGController;
pub use engine::{CommsDiagnostics, SendingState, StatusSnapshot, TinyGEngine};
pub use instruction::{Instruction, InstructionHandle, LineId, Priority, Progress, Stage};
pub use machine_state::{MachineState, SyncInputs};
pub use planner::{LineRange, PlannerMirror, ReportOutcome};
pub use probe::ProbeOutcome;
pub use response_parser::{
    Footer, ProbeReport, QueueReport, TinyGMessage, TinyGResponseParser,
};
pub use send_queue::{AckOutcome, QueueEntry, SendQueue, WireStage};
pub use status_codes::{decode_status, is_success};
