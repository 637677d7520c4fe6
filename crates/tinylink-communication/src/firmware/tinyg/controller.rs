//! TinyG Controller
//!
//! Public handle over the protocol engine. The engine and the open transport
//! are owned by a single I/O task; the handle talks to it over a command
//! channel and reads snapshots published after every iteration of the loop.

use super::codec::WireCodec;
use super::command_creator::{CommandCreator, ControlCode};
use super::engine::{SendingState, StatusSnapshot, SyncResult, TinyGEngine};
use super::instruction::{Instruction, InstructionHandle, Priority};
use super::probe::{self, ProbeOutcome};
use super::response_parser::ProbeReport;
use crate::communication::{
    ConnectionParams, ReconnectPolicy, ReconnectTicket, SerialConnector, TransportConnector,
    TransportEvent, TransportLink,
};
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tinylink_core::{
    Axis, AxisValues, ConnectionError, ControllerError, ControllerEvent, Error, EventDispatcher,
    GcodeLine, Result,
};
use tinylink_settings::{Config, ControllerSettings};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};

/// Housekeeping period of the I/O task
const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Requests handled by the I/O task
#[derive(Debug)]
pub(crate) enum Command {
    Connect(oneshot::Sender<std::result::Result<(), ConnectionError>>),
    Close(oneshot::Sender<()>),
    Enqueue {
        instruction: Instruction,
        priority: Priority,
        reply: oneshot::Sender<std::result::Result<InstructionHandle, ControllerError>>,
    },
    Control {
        code: ControlCode,
        reply: oneshot::Sender<std::result::Result<(), ControllerError>>,
    },
    ClearError(oneshot::Sender<std::result::Result<InstructionHandle, ControllerError>>),
    WaitUntilSynced(oneshot::Sender<SyncResult>),
    ExpectProbeReport(oneshot::Sender<ProbeReport>),
    SetSendingEnabled(bool),
    BeginManualSequence(oneshot::Sender<SendingState>),
    RestoreSendingState(SendingState),
    SetProbeConvention(bool),
    Snapshot(oneshot::Sender<StatusSnapshot>),
}

fn stopped() -> Error {
    ControllerError::Cancelled {
        reason: "controller stopped".to_string(),
    }
    .into()
}

/// Handle to a TinyG controller
pub struct TinyGController {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: Arc<RwLock<StatusSnapshot>>,
    events: EventDispatcher,
    creator: CommandCreator,
    settings: ControllerSettings,
}

impl TinyGController {
    /// Create a controller for the serial port named in `config`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: &Config) -> Self {
        Self::with_connector(config, Arc::new(SerialConnector))
    }

    /// Create a controller that opens its link through `connector`
    pub fn with_connector(config: &Config, connector: Arc<dyn TransportConnector>) -> Self {
        let events = EventDispatcher::default();
        let settings = config.controller.clone();
        let params = ConnectionParams::from(&config.connection);
        let engine = TinyGEngine::new(settings.clone(), events.clone());
        let creator = *engine.creator();
        let snapshot = Arc::new(RwLock::new(engine.snapshot()));
        let (commands, rx) = mpsc::unbounded_channel();

        let io = IoTask {
            reconnect: ReconnectPolicy::new(params.auto_reconnect, params.reconnect_delay),
            engine,
            params,
            connector,
            link: None,
            snapshot: snapshot.clone(),
        };
        // The task ends when the last command sender is dropped
        tokio::spawn(io.run(rx));

        Self {
            commands,
            snapshot,
            events,
            creator,
            settings,
        }
    }

    pub(crate) fn command_sender(&self) -> mpsc::UnboundedSender<Command> {
        self.commands.clone()
    }

    pub(crate) fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| stopped())
    }

    pub(crate) async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send(build(tx))?;
        rx.await.map_err(|_| stopped())
    }

    /// Command builder using the configured number precision
    pub fn creator(&self) -> &CommandCreator {
        &self.creator
    }

    /// Wire codec using the configured number precision
    pub fn codec(&self) -> &WireCodec {
        self.creator.codec()
    }

    /// Controller settings in use
    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    /// Subscribe to controller events
    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    /// Open the link and wait until initialization completes
    pub async fn connect(&self) -> Result<()> {
        let mut events = self.subscribe();
        self.call(Command::Connect).await??;
        if self.snapshot.read().comms.ready {
            return Ok(());
        }
        loop {
            match events.recv().await {
                Ok(ControllerEvent::Ready) => return Ok(()),
                Ok(ControllerEvent::Disconnected) => {
                    return Err(ConnectionError::ConnectionLost {
                        reason: "closed during initialization".to_string(),
                    }
                    .into())
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!("Missed {} events while connecting", skipped);
                    if self.get_status().await?.comms.ready {
                        return Ok(());
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return Err(stopped()),
            }
        }
    }

    /// Close the link. Outstanding work is cancelled; no reconnect is attempted.
    pub async fn close(&self) -> Result<()> {
        self.call(Command::Close).await
    }

    /// Soft-reset the firmware (ctrl-x). The controller re-initializes when
    /// the firmware comes back.
    pub async fn reset(&self) -> Result<()> {
        self.control(ControlCode::Cancel).await
    }

    /// Queue an instruction with the given priority
    pub async fn send_with_priority(
        &self,
        instruction: Instruction,
        priority: Priority,
    ) -> Result<InstructionHandle> {
        let handle = self
            .call(|reply| Command::Enqueue {
                instruction,
                priority,
                reply,
            })
            .await??;
        Ok(handle)
    }

    /// Queue a raw line
    pub async fn send_line(&self, text: impl Into<String>) -> Result<InstructionHandle> {
        self.send_with_priority(Instruction::from_text(text), Priority::Normal)
            .await
    }

    /// Queue a structured JSON command
    pub async fn send_json(&self, value: &Value) -> Result<InstructionHandle> {
        self.send_with_priority(Instruction::from_json(value, self.codec()), Priority::Normal)
            .await
    }

    /// Queue a parsed G-code line
    pub async fn send_gcode_line(&self, line: &GcodeLine) -> Result<InstructionHandle> {
        self.send_with_priority(Instruction::from_gcode(line), Priority::Normal)
            .await
    }

    /// Send a line and wait for the firmware's response body
    pub async fn request(&self, text: impl Into<String>) -> Result<Value> {
        let mut handle = self.send_line(text).await?;
        Ok(handle.acknowledged().await?)
    }

    /// Home the given axes and wait for the cycle to finish
    pub async fn home(&self, axes: &[Axis]) -> Result<()> {
        if axes.is_empty() {
            return Err(ControllerError::InvalidRequest {
                reason: "no axes to home".to_string(),
            }
            .into());
        }
        let mut handle = self.send_line(self.creator.home(axes)).await?;
        handle.executed().await?;
        self.wait_until_synced().await
    }

    /// Move to an absolute work position; rapid without a feed rate
    pub async fn move_to(&self, target: &AxisValues, feed: Option<f64>) -> Result<()> {
        if target.is_empty() {
            return Err(ControllerError::InvalidRequest {
                reason: "move has no target axes".to_string(),
            }
            .into());
        }
        if let Some(feed) = feed.filter(|f| *f <= 0.0) {
            return Err(ControllerError::InvalidRequest {
                reason: format!("feed rate must be positive, got {}", feed),
            }
            .into());
        }
        let mut handle = self.send_line(self.creator.move_to(target, feed)).await?;
        handle.executed().await?;
        Ok(())
    }

    /// Probe toward `target` (work coordinates). Not tripping is a normal outcome.
    pub async fn probe(&self, target: &AxisValues, feed: Option<f64>) -> Result<ProbeOutcome> {
        let feed = feed.unwrap_or(self.settings.probe_default_feed);
        probe::run(self, target, feed).await
    }

    /// Latest published snapshot, without waiting
    pub fn status(&self) -> StatusSnapshot {
        self.snapshot.read().clone()
    }

    /// Snapshot taken after every previously issued command was processed
    pub async fn get_status(&self) -> Result<StatusSnapshot> {
        self.call(Command::Snapshot).await
    }

    /// Wait until the machine is idle and everything sent has retired
    pub async fn wait_until_synced(&self) -> Result<()> {
        self.call(Command::WaitUntilSynced).await??;
        Ok(())
    }

    async fn control(&self, code: ControlCode) -> Result<()> {
        self.call(|reply| Command::Control { code, reply }).await??;
        Ok(())
    }

    /// Feed hold (`!`)
    pub async fn feed_hold(&self) -> Result<()> {
        self.control(ControlCode::FeedHold).await
    }

    /// Resume after a feed hold (`~`)
    pub async fn resume(&self) -> Result<()> {
        self.control(ControlCode::Resume).await
    }

    /// Flush the planner (`%`). Only honoured by the firmware while held.
    pub async fn flush_queue(&self) -> Result<()> {
        self.control(ControlCode::QueueFlush).await
    }

    /// Soft reset (ctrl-x), cancelling everything outstanding
    pub async fn cancel(&self) -> Result<()> {
        self.control(ControlCode::Cancel).await
    }

    /// Clear the sticky alarm locally and on the firmware
    pub async fn clear_error(&self) -> Result<()> {
        let mut handle = self.call(Command::ClearError).await??;
        handle.acknowledged().await?;
        Ok(())
    }

    /// Enable or disable normal-priority sending
    pub fn set_sending_enabled(&self, enabled: bool) -> Result<()> {
        self.send(Command::SetSendingEnabled(enabled))
    }
}

/// I/O task: owns the engine and the transport
struct IoTask {
    engine: TinyGEngine,
    params: ConnectionParams,
    connector: Arc<dyn TransportConnector>,
    link: Option<TransportLink>,
    reconnect: ReconnectPolicy,
    snapshot: Arc<RwLock<StatusSnapshot>>,
}

async fn next_event(link: &mut Option<TransportLink>) -> Option<TransportEvent> {
    match link {
        Some(link) => link.events.recv().await,
        None => std::future::pending().await,
    }
}

impl IoTask {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let (reconnect_tx, mut reconnect_rx) = mpsc::unbounded_channel::<ReconnectTicket>();
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                event = next_event(&mut self.link) => {
                    self.handle_transport_event(event, &reconnect_tx);
                }
                Some(ticket) = reconnect_rx.recv() => {
                    self.handle_reconnect(ticket, &reconnect_tx).await;
                }
                _ = ticker.tick() => self.engine.tick(Instant::now()),
            }
            self.flush(&reconnect_tx);
            self.publish_snapshot();
        }

        self.reconnect.cancel();
        self.shutdown_link("controller stopped");
        self.publish_snapshot();
        tracing::debug!("Controller task stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(reply) => {
                self.reconnect.cancel();
                let result = self.open().await;
                if let Err(e) = &result {
                    tracing::error!("Connect failed: {}", e);
                }
                let _ = reply.send(result);
            }
            Command::Close(reply) => {
                self.reconnect.cancel();
                self.shutdown_link("connection closed");
                let _ = reply.send(());
            }
            Command::Enqueue {
                instruction,
                priority,
                reply,
            } => {
                let _ = reply.send(self.engine.enqueue(instruction, priority));
            }
            Command::Control { code, reply } => {
                let _ = reply.send(self.engine.send_control(code));
            }
            Command::ClearError(reply) => {
                let _ = reply.send(self.engine.clear_error());
            }
            Command::WaitUntilSynced(reply) => {
                self.engine.wait_until_synced(reply, Instant::now());
            }
            Command::ExpectProbeReport(reply) => self.engine.expect_probe_report(reply),
            Command::SetSendingEnabled(enabled) => self.engine.set_sending_enabled(enabled),
            Command::BeginManualSequence(reply) => {
                let _ = reply.send(self.engine.begin_manual_sequence());
            }
            Command::RestoreSendingState(state) => self.engine.restore_sending_state(state),
            Command::SetProbeConvention(machine) => {
                self.engine.set_probe_uses_machine_coordinates(machine)
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.engine.snapshot());
            }
        }
    }

    async fn open(&mut self) -> std::result::Result<(), ConnectionError> {
        if self.link.is_some() {
            return Ok(());
        }
        let link = self.connector.open(&self.params).await?;
        tracing::info!("Opened {}", link.transport.name());
        self.link = Some(link);
        self.engine.connection_opened();
        Ok(())
    }

    fn handle_transport_event(
        &mut self,
        event: Option<TransportEvent>,
        reconnect_tx: &mpsc::UnboundedSender<ReconnectTicket>,
    ) {
        match event {
            Some(TransportEvent::Line(line)) => {
                if let Err(e) = self.engine.handle_line(&line) {
                    tracing::error!("Protocol error, closing connection: {}", e);
                    self.engine
                        .events()
                        .publish(ControllerEvent::Error(e.to_string()));
                    self.connection_lost(&format!("protocol error: {}", e), reconnect_tx);
                }
            }
            Some(TransportEvent::Error(e)) => {
                tracing::error!("Connection error: {}", e);
                self.engine
                    .events()
                    .publish(ControllerEvent::Error(e.to_string()));
                self.connection_lost(&e.to_string(), reconnect_tx);
            }
            Some(TransportEvent::Closed) | None => {
                self.connection_lost("connection closed", reconnect_tx);
            }
        }
    }

    fn connection_lost(
        &mut self,
        reason: &str,
        reconnect_tx: &mpsc::UnboundedSender<ReconnectTicket>,
    ) {
        if self.link.is_none() {
            return;
        }
        tracing::warn!("Connection lost: {}", reason);
        self.shutdown_link(reason);
        self.schedule_reconnect(reconnect_tx);
    }

    fn schedule_reconnect(&mut self, reconnect_tx: &mpsc::UnboundedSender<ReconnectTicket>) {
        let Some(ticket) = self.reconnect.schedule() else {
            return;
        };
        tracing::info!("Reconnecting in {:?}", ticket.delay);
        let tx = reconnect_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(ticket.delay).await;
            let _ = tx.send(ticket);
        });
    }

    async fn handle_reconnect(
        &mut self,
        ticket: ReconnectTicket,
        reconnect_tx: &mpsc::UnboundedSender<ReconnectTicket>,
    ) {
        if !self.reconnect.fire(ticket) || self.link.is_some() {
            return;
        }
        match self.open().await {
            Ok(()) => tracing::info!("Reconnected"),
            Err(e) => {
                tracing::warn!("Reconnect failed: {}", e);
                self.schedule_reconnect(reconnect_tx);
            }
        }
    }

    fn shutdown_link(&mut self, reason: &str) {
        if let Some(mut link) = self.link.take() {
            link.transport.close();
        }
        self.engine.connection_closed(reason);
    }

    fn flush(&mut self, reconnect_tx: &mpsc::UnboundedSender<ReconnectTicket>) {
        for bytes in self.engine.take_outbox() {
            let Some(link) = self.link.as_mut() else {
                break;
            };
            if let Err(e) = link.transport.write(&bytes) {
                tracing::error!("Write failed: {}", e);
                self.engine
                    .events()
                    .publish(ControllerEvent::Error(e.to_string()));
                self.connection_lost(&e.to_string(), reconnect_tx);
                break;
            }
        }
    }

    fn publish_snapshot(&self) {
        *self.snapshot.write() = self.engine.snapshot();
    }
}
