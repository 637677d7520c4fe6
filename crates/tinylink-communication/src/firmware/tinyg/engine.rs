//! TinyG protocol engine
//!
//! Synchronous core of the controller. It owns the send queue, the planner
//! mirror and the machine state, consumes decoded lines from the wire and
//! decides what to write next. Bytes to write are collected in an outbox that
//! the I/O task drains after every call, so everything here runs without
//! awaiting and can be driven directly from tests.

use super::codec::WireCodec;
use super::command_creator::{CommandCreator, ControlCode};
use super::instruction::{Instruction, InstructionHandle, LineId, Priority};
use super::machine_state::{MachineState, SyncInputs};
use super::planner::PlannerMirror;
use super::response_parser::{
    Footer, ProbeReport, QueueReport, TinyGMessage, TinyGResponseParser,
};
use super::send_queue::{AckOutcome, SendQueue, WireStage};
use super::status_codes::{decode_status, is_success, STATUS_OK};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::VecDeque;
use std::time::Duration;
use tinylink_core::{ControllerError, ControllerEvent, EventDispatcher, ProtocolError};
use tinylink_settings::ControllerSettings;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Response fields that are never merged into the machine state
const TRANSIENT_RESPONSE_FIELDS: &[&str] = &["sr", "qr", "qi", "qo", "prb", "gc", "msg", "value"];

/// Result delivered to a `wait_until_synced` caller
pub type SyncResult = Result<(), ControllerError>;

/// Communication-side diagnostics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CommsDiagnostics {
    /// Serial link is open
    pub connected: bool,
    /// Initialization finished since the link opened
    pub ready: bool,
    /// Unretired instructions
    pub queue_len: usize,
    /// Index of the next entry to write
    pub to_send: usize,
    /// Index of the next entry waiting for a response
    pub to_receive: usize,
    /// Sent entries waiting for a response
    pub unacked: usize,
    /// Free planner slots as of the last queue report
    pub planner_free: usize,
    /// Slots the planner mirror believes occupied
    pub planner_mirror_len: usize,
    /// Planner size in slots
    pub planner_capacity: usize,
    /// Machine is idle and nothing is outstanding
    pub synced: bool,
    /// Feed hold requested
    pub held: bool,
    /// Normal-priority sending enabled
    pub sending_enabled: bool,
    /// Sticky alarm, until cleared
    #[serde(skip)]
    pub error: Option<ControllerError>,
    /// Firmware reports probe results in machine coordinates, once known
    pub probe_uses_machine_coordinates: Option<bool>,
}

/// Sending and error-report settings, saved around a hand-sequenced exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendingState {
    /// Normal-priority sending enabled
    pub sending_enabled: bool,
    /// Firmware error reports are logged rather than raised
    pub suppress_error_reports: bool,
}

/// Read-only snapshot of the controller
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusSnapshot {
    /// Canonical machine state
    pub state: MachineState,
    /// Queue and link diagnostics
    pub comms: CommsDiagnostics,
}

/// TinyG protocol engine
#[derive(Debug)]
pub struct TinyGEngine {
    settings: ControllerSettings,
    creator: CommandCreator,
    parser: TinyGResponseParser,
    queue: SendQueue,
    planner: PlannerMirror,
    state: MachineState,
    events: EventDispatcher,
    outbox: VecDeque<Vec<u8>>,

    connected: bool,
    ready: bool,
    init_through: Option<LineId>,
    sending_enabled: bool,
    held: bool,
    error: Option<ControllerError>,
    suppress_error_reports: bool,
    probe_uses_machine_coordinates: Option<bool>,

    // Every inbound message gets a sequence number; sync freshness compares them
    seq: u64,
    last_ack_seq: Option<u64>,
    last_status_seq: Option<u64>,
    last_status_at: Option<Instant>,
    status_requested_at: Option<Instant>,

    synced: bool,
    sync_waiters: Vec<oneshot::Sender<SyncResult>>,
    probe_waiter: Option<oneshot::Sender<ProbeReport>>,
}

impl TinyGEngine {
    /// Create a disconnected engine
    pub fn new(settings: ControllerSettings, events: EventDispatcher) -> Self {
        let codec = WireCodec::new(settings.number_precision);
        Self {
            creator: CommandCreator::new(codec),
            parser: TinyGResponseParser::new(codec),
            queue: SendQueue::new(),
            planner: PlannerMirror::new(settings.planner_capacity),
            state: MachineState::new(),
            events,
            outbox: VecDeque::new(),
            connected: false,
            ready: false,
            init_through: None,
            sending_enabled: true,
            held: false,
            error: None,
            suppress_error_reports: false,
            probe_uses_machine_coordinates: None,
            seq: 0,
            last_ack_seq: None,
            last_status_seq: None,
            last_status_at: None,
            status_requested_at: None,
            synced: false,
            sync_waiters: Vec::new(),
            probe_waiter: None,
            settings,
        }
    }

    /// Command builder matching the engine's codec
    pub fn creator(&self) -> &CommandCreator {
        &self.creator
    }

    /// Event dispatcher
    pub fn events(&self) -> &EventDispatcher {
        &self.events
    }

    /// Link is open
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Initialization finished
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Synchronization predicate as last evaluated
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// Canonical machine state
    pub fn state(&self) -> &MachineState {
        &self.state
    }

    /// Send queue
    pub fn queue(&self) -> &SendQueue {
        &self.queue
    }

    /// Planner mirror
    pub fn planner(&self) -> &PlannerMirror {
        &self.planner
    }

    /// Sticky alarm
    pub fn error(&self) -> Option<&ControllerError> {
        self.error.as_ref()
    }

    /// Cached probe coordinate convention
    pub fn probe_uses_machine_coordinates(&self) -> Option<bool> {
        self.probe_uses_machine_coordinates
    }

    /// Remember the probe coordinate convention for this connection
    pub fn set_probe_uses_machine_coordinates(&mut self, machine: bool) {
        tracing::info!(
            "Probe reports use {} coordinates",
            if machine { "machine" } else { "work" }
        );
        self.probe_uses_machine_coordinates = Some(machine);
    }

    /// Take everything waiting to be written
    pub fn take_outbox(&mut self) -> Vec<Vec<u8>> {
        self.outbox.drain(..).collect()
    }

    /// Build a snapshot
    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            state: self.state.clone(),
            comms: CommsDiagnostics {
                connected: self.connected,
                ready: self.ready,
                queue_len: self.queue.len(),
                to_send: self.queue.to_send(),
                to_receive: self.queue.to_receive(),
                unacked: self.queue.unacked_count(),
                planner_free: self.planner.last_free(),
                planner_mirror_len: self.planner.len(),
                planner_capacity: self.planner.capacity(),
                synced: self.synced,
                held: self.held,
                sending_enabled: self.sending_enabled,
                error: self.error.clone(),
                probe_uses_machine_coordinates: self.probe_uses_machine_coordinates,
            },
        }
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    /// The link opened: start a fresh session and initialize the firmware
    pub fn connection_opened(&mut self) {
        self.reset_session();
        self.connected = true;
        tracing::info!("Connected, initializing controller");
        self.begin_init();
    }

    /// The link closed, on request or otherwise
    pub fn connection_closed(&mut self, reason: &str) {
        if !self.connected {
            return;
        }
        self.cancel_running_ops(reason);
        self.reset_session();
        self.connected = false;
        self.outbox.clear();
        tracing::info!("Disconnected: {}", reason);
        self.events.publish(ControllerEvent::Disconnected);
    }

    fn reset_session(&mut self) {
        self.state.clear();
        self.planner.clear();
        self.ready = false;
        self.init_through = None;
        self.sending_enabled = true;
        self.held = false;
        self.error = None;
        self.suppress_error_reports = false;
        self.probe_uses_machine_coordinates = None;
        self.last_ack_seq = None;
        self.last_status_seq = None;
        self.last_status_at = None;
        self.status_requested_at = None;
        self.synced = false;
    }

    fn begin_init(&mut self) {
        let lines = self
            .creator
            .init_sequence(self.settings.status_report_interval_ms);
        let mut last = None;
        for line in lines {
            let handle = self.queue.push(Instruction::from_text(line), Priority::Normal);
            last = Some(handle.id());
        }
        self.init_through = last;
        self.pump();
    }

    fn check_init_complete(&mut self) {
        let Some(marker) = self.init_through else {
            return;
        };
        let done = self
            .queue
            .iter()
            .all(|e| e.id > marker || e.stage == WireStage::Acked);
        if done && self.connected {
            self.init_through = None;
            self.ready = true;
            tracing::info!("Controller ready");
            self.events.publish(ControllerEvent::Ready);
        }
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Queue an instruction
    pub fn enqueue(
        &mut self,
        instruction: Instruction,
        priority: Priority,
    ) -> Result<InstructionHandle, ControllerError> {
        if !self.connected {
            return Err(ControllerError::NotConnected);
        }
        let handle = self.queue.push(instruction, priority);
        tracing::trace!("Queued line {} ({:?})", handle.id(), priority);
        self.synced = false;
        self.pump();
        Ok(handle)
    }

    /// Write a single-byte control command, bypassing the queue
    pub fn send_control(&mut self, code: ControlCode) -> Result<(), ControllerError> {
        if !self.connected {
            return Err(ControllerError::NotConnected);
        }
        tracing::debug!("Sending control {}", code.label());
        self.outbox.push_back(vec![code.as_byte()]);
        self.events
            .publish(ControllerEvent::Sent(code.label().to_string()));
        match code {
            ControlCode::FeedHold => self.held = true,
            ControlCode::Resume => self.held = false,
            ControlCode::QueueFlush => self.cancel_running_ops("queue flushed"),
            ControlCode::Cancel => {
                self.held = false;
                self.cancel_running_ops("reset");
            }
        }
        Ok(())
    }

    /// Enable or disable normal-priority sending
    pub fn set_sending_enabled(&mut self, enabled: bool) {
        if self.sending_enabled != enabled {
            tracing::debug!("Sending {}", if enabled { "enabled" } else { "disabled" });
        }
        self.sending_enabled = enabled;
        if enabled {
            self.pump();
        }
        self.update_sync();
    }

    /// Log firmware error reports instead of raising them as alarms
    pub fn set_suppress_error_reports(&mut self, suppress: bool) {
        self.suppress_error_reports = suppress;
    }

    /// Current sending and error-report settings
    pub fn sending_state(&self) -> SendingState {
        SendingState {
            sending_enabled: self.sending_enabled,
            suppress_error_reports: self.suppress_error_reports,
        }
    }

    /// Stop normal sending and suppress error reports, returning the
    /// settings to restore afterwards
    pub fn begin_manual_sequence(&mut self) -> SendingState {
        let prior = self.sending_state();
        self.set_suppress_error_reports(true);
        self.set_sending_enabled(false);
        prior
    }

    /// Put back settings saved by `begin_manual_sequence`
    pub fn restore_sending_state(&mut self, state: SendingState) {
        self.set_suppress_error_reports(state.suppress_error_reports);
        self.set_sending_enabled(state.sending_enabled);
    }

    /// Drop the sticky alarm and ask the firmware to clear its own
    pub fn clear_error(&mut self) -> Result<InstructionHandle, ControllerError> {
        if let Some(error) = self.error.take() {
            tracing::info!("Clearing {}", error);
        }
        let line = self.creator.clear_alarm();
        self.enqueue(Instruction::from_text(line), Priority::Immediate)
    }

    /// Would the flow-control rules allow writing the next normal entry now
    pub fn can_send_more(&self) -> bool {
        let Some(next) = self.queue.next_to_send() else {
            return false;
        };
        if !self.connected || !self.sending_enabled || self.queue.blocked_by_full_sync() {
            return false;
        }
        let unacked = self.queue.unacked_count();
        if unacked >= self.settings.max_unacked_requests {
            return false;
        }
        if unacked < self.settings.rx_low_watermark {
            return true;
        }
        let budget =
            self.planner.last_free() as i64 - self.queue.slots_sent_since_report() as i64;
        budget >= i64::from(next.instruction.planner_slots)
    }

    /// Write as many entries as flow control allows
    fn pump(&mut self) {
        loop {
            let Some(next) = self.queue.next_to_send() else {
                break;
            };
            let immediate = next.priority == Priority::Immediate;
            if !self.connected || (!immediate && !self.can_send_more()) {
                break;
            }
            if let Some(entry) = self.queue.mark_next_sent() {
                let text = entry.instruction.text.clone();
                tracing::trace!("Writing line {}: {}", entry.id, text);
                // Silent lines still go out; only their ack is local
                if !text.trim().is_empty() {
                    self.outbox.push_back(format!("{}\n", text).into_bytes());
                    self.events.publish(ControllerEvent::Sent(text));
                }
            }
            self.synthesize_acks();
        }
    }

    /// Lines the firmware never answers are acknowledged as soon as they
    /// reach the front of the unacked region
    fn synthesize_acks(&mut self) {
        while let Some(entry) = self.queue.oldest_unacked() {
            if entry.instruction.expects_response {
                break;
            }
            self.queue.acknowledge(Value::Null, None);
        }
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Process one line from the wire.
    ///
    /// A line that looks like JSON but doesn't decode is a protocol error;
    /// the caller should drop the connection.
    pub fn handle_line(&mut self, line: &str) -> Result<(), ProtocolError> {
        self.events
            .publish(ControllerEvent::Received(line.to_string()));
        let trimmed = line.trim();
        if !trimmed.starts_with('{') {
            tracing::debug!("Ignoring non-JSON line: {}", trimmed);
            return Ok(());
        }
        let message = self.parser.parse(trimmed)?;
        self.handle_message(message);
        Ok(())
    }

    /// Process one classified message
    pub fn handle_message(&mut self, message: TinyGMessage) {
        match message {
            TinyGMessage::Response { body, footer } => self.handle_response(body, footer),
            TinyGMessage::StatusReport(sr) => self.handle_status(&sr),
            TinyGMessage::QueueReport(report) => self.handle_queue_report(report),
            TinyGMessage::ErrorReport { code, message } => self.handle_error_report(code, message),
            TinyGMessage::ProbeReport(report) => self.handle_probe_report(report),
            TinyGMessage::Startup { version } => self.handle_startup(version),
            TinyGMessage::Unknown(value) => tracing::debug!("Unhandled message: {}", value),
        }
        self.synthesize_acks();
        self.pump();
        self.check_init_complete();
        self.update_sync();
    }

    fn handle_response(&mut self, body: Map<String, Value>, footer: Option<Footer>) {
        // A firmware banner that answers nothing we sent means the board restarted
        if body.contains_key("fv") && self.queue.oldest_unacked().is_none() {
            self.handle_startup(body.get("fv").and_then(Value::as_f64));
            return;
        }

        let status = footer.map(|f| f.status).unwrap_or(STATUS_OK);
        let rejection = (!is_success(status)).then(|| ControllerError::RequestRejected {
            code: status,
            message: decode_status(status).to_string(),
        });

        self.seq += 1;
        match self.queue.acknowledge(Value::Object(body.clone()), rejection) {
            None => tracing::warn!("Response with nothing outstanding: {:?}", body),
            Some(AckOutcome::Rejected(id)) => {
                let message = format!("Line {} rejected: {} ({})", id, decode_status(status), status);
                tracing::warn!("{}", message);
                self.events.publish(ControllerEvent::Error(message));
            }
            Some(outcome) => tracing::trace!("Acknowledged {:?}", outcome),
        }
        self.last_ack_seq = Some(self.seq);

        // Reports embedded in the response apply after the acknowledgement
        if let Some(Value::Object(sr)) = body.get("sr") {
            self.handle_status(sr);
        }
        match QueueReport::from_object(&body) {
            Ok(Some(report)) => self.handle_queue_report(report),
            Ok(None) => {}
            Err(e) => tracing::warn!("Ignoring queue report: {}", e),
        }
        if let Some(prb) = body.get("prb") {
            match ProbeReport::from_value(prb) {
                Ok(report) => self.handle_probe_report(report),
                Err(e) => tracing::warn!("Ignoring probe report: {}", e),
            }
        }

        let fields: Map<String, Value> = body
            .into_iter()
            .filter(|(key, _)| !TRANSIENT_RESPONSE_FIELDS.contains(&key.as_str()))
            .collect();
        if !fields.is_empty() {
            let changed = self.state.apply(&fields);
            if !changed.is_empty() {
                self.events.publish(ControllerEvent::StatusUpdate(changed));
            }
        }
    }

    fn handle_status(&mut self, sr: &Map<String, Value>) {
        self.seq += 1;
        self.last_status_seq = Some(self.seq);
        self.last_status_at = Some(Instant::now());
        self.status_requested_at = None;

        let was_alarmed = self.state.run_state().is_alarmed();
        let changed = self.state.apply(sr);
        if changed.is_empty() {
            return;
        }
        let run_state = self.state.run_state();
        self.events.publish(ControllerEvent::StatusUpdate(changed));

        if run_state.is_alarmed() && !was_alarmed {
            let message = format!("Machine entered {} state", run_state);
            if self.suppress_error_reports {
                tracing::debug!("{} (suppressed)", message);
            } else if self.error.is_none() {
                tracing::error!("{}", message);
                self.error = Some(ControllerError::MachineAlarm {
                    code: None,
                    message: message.clone(),
                });
                self.events.publish(ControllerEvent::Error(message));
            }
        }
    }

    fn handle_queue_report(&mut self, report: QueueReport) {
        self.planner.apply_report(report, &mut self.queue);
        self.queue.mark_report();
    }

    fn handle_error_report(&mut self, code: Option<u16>, message: String) {
        if self.suppress_error_reports {
            tracing::debug!("Suppressed firmware error report: {} ({:?})", message, code);
            return;
        }
        tracing::error!("Firmware error report: {} ({:?})", message, code);
        let error = ControllerError::MachineAlarm { code, message };
        self.error = Some(error.clone());
        self.events.publish(ControllerEvent::Error(error.to_string()));
        self.cancel_with(error.clone(), &error.to_string());
    }

    fn handle_probe_report(&mut self, report: ProbeReport) {
        let mut fields = Map::new();
        fields.insert("prbe".to_string(), json!(u8::from(report.tripped)));
        for (axis, value) in report.position.iter() {
            fields.insert(format!("prb{}", axis.letter()), json!(value));
        }
        let changed = self.state.apply(&fields);
        if !changed.is_empty() {
            self.events.publish(ControllerEvent::StatusUpdate(changed));
        }
        match self.probe_waiter.take() {
            Some(waiter) => {
                let _ = waiter.send(report);
            }
            None => tracing::debug!("Probe report with no probe in progress"),
        }
    }

    fn handle_startup(&mut self, version: Option<f64>) {
        tracing::info!("Controller startup detected (firmware {:?})", version);
        if !self.queue.is_empty() {
            self.cancel_running_ops("controller reset");
        }
        self.reset_session();
        self.connected = true;
        self.begin_init();
    }

    // ------------------------------------------------------------------
    // Cancellation and synchronization
    // ------------------------------------------------------------------

    /// Reject everything outstanding and clear the local planner picture.
    ///
    /// Calling it again with nothing outstanding only repeats the event.
    pub fn cancel_running_ops(&mut self, reason: &str) {
        self.cancel_with(
            ControllerError::Cancelled {
                reason: reason.to_string(),
            },
            reason,
        );
    }

    fn cancel_with(&mut self, error: ControllerError, reason: &str) {
        let cancelled = self.queue.cancel_all(&error);
        self.planner.clear();
        for waiter in self.sync_waiters.drain(..) {
            let _ = waiter.send(Err(error.clone()));
        }
        self.probe_waiter = None;
        self.synced = false;
        if cancelled > 0 {
            tracing::info!("Cancelled {} instructions: {}", cancelled, reason);
        }
        self.events
            .publish(ControllerEvent::CancelRunningOps(reason.to_string()));
    }

    /// Register a caller waiting for the machine to go idle
    pub fn wait_until_synced(&mut self, waiter: oneshot::Sender<SyncResult>, now: Instant) {
        if !self.connected {
            let _ = waiter.send(Err(ControllerError::NotConnected));
            return;
        }
        self.update_sync();
        if self.synced {
            let _ = waiter.send(Ok(()));
            return;
        }
        self.sync_waiters.push(waiter);
        self.request_status(now);
    }

    /// Register the receiver of the next probe report
    pub fn expect_probe_report(&mut self, waiter: oneshot::Sender<ProbeReport>) {
        self.probe_waiter = Some(waiter);
    }

    /// Periodic housekeeping: refresh stale status while someone waits
    pub fn tick(&mut self, now: Instant) {
        if !self.connected {
            return;
        }
        if !self.sync_waiters.is_empty() {
            let stale = Duration::from_millis(self.settings.status_stale_ms);
            let fresh = self
                .last_status_at
                .is_some_and(|at| now.saturating_duration_since(at) < stale);
            if !fresh {
                self.request_status(now);
            }
        }
        self.update_sync();
    }

    fn request_status(&mut self, now: Instant) {
        let stale = Duration::from_millis(self.settings.status_stale_ms);
        if self
            .status_requested_at
            .is_some_and(|at| now.saturating_duration_since(at) < stale)
        {
            return;
        }
        self.status_requested_at = Some(now);
        let line = self.creator.status_request();
        if let Err(e) = self.enqueue(Instruction::from_text(line), Priority::Immediate) {
            tracing::debug!("Status request not sent: {}", e);
        }
    }

    fn update_sync(&mut self) {
        let inputs = SyncInputs {
            stopped: self.state.run_state().is_stopped(),
            unacked: self.queue.unacked_count(),
            pending: self.queue.pending_count(),
            sending_enabled: self.sending_enabled,
            last_status_seq: self.last_status_seq,
            last_ack_seq: self.last_ack_seq,
        };
        let synced = self.connected && inputs.is_synced();
        if synced && (!self.planner.is_empty() || self.queue.to_receive() > 0) {
            let retired = self.planner.drain(&mut self.queue);
            tracing::debug!("Machine idle, drained planner mirror ({} retired)", retired);
        }
        self.synced = synced;
        if synced {
            for waiter in self.sync_waiters.drain(..) {
                let _ = waiter.send(Ok(()));
            }
        }
    }
}
