//! Probe sequencer
//!
//! A probe cycle is sequenced by hand: normal sending is disabled and
//! firmware error reports are downgraded to log lines for the whole
//! operation. Both go back to their earlier settings when the operation
//! ends, however it ends.
//!
//! Some firmware builds interpret `G38.2` targets in machine coordinates
//! rather than work coordinates. The first probe of a session with non-zero
//! work offsets runs a trial probe toward the current work position: in work
//! coordinates that is a zero-length move, so any machine motion reveals the
//! machine-coordinate convention. The answer is cached until the link closes.

use super::controller::{Command, TinyGController};
use super::engine::SendingState;
use super::instruction::{Instruction, Priority};
use super::response_parser::ProbeReport;
use tinylink_core::{AxisValues, ControllerError, Result};
use tokio::sync::{mpsc, oneshot};

/// Machine motion, in active units, that counts as having moved
const CONVENTION_TOLERANCE: f64 = 0.001;

/// Result of a probe operation
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProbeOutcome {
    /// Contact made; position in work coordinates
    Tripped(AxisValues),
    /// Reached the target without contact
    NotTripped,
}

impl ProbeOutcome {
    /// Contact position, if tripped
    pub fn position(&self) -> Option<AxisValues> {
        match self {
            ProbeOutcome::Tripped(position) => Some(*position),
            ProbeOutcome::NotTripped => None,
        }
    }

    /// True if the probe made contact
    pub fn is_tripped(&self) -> bool {
        matches!(self, ProbeOutcome::Tripped(_))
    }
}

/// Disables sending and error reporting while alive
struct ProbeGuard {
    commands: mpsc::UnboundedSender<Command>,
    prior: SendingState,
}

impl ProbeGuard {
    async fn engage(controller: &TinyGController) -> Result<Self> {
        let prior = controller.call(Command::BeginManualSequence).await?;
        Ok(Self {
            commands: controller.command_sender(),
            prior,
        })
    }
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::RestoreSendingState(self.prior));
    }
}

pub(crate) async fn run(
    controller: &TinyGController,
    target: &AxisValues,
    feed: f64,
) -> Result<ProbeOutcome> {
    if target.is_empty() {
        return Err(ControllerError::InvalidRequest {
            reason: "probe has no target axes".to_string(),
        }
        .into());
    }
    if feed <= 0.0 {
        return Err(ControllerError::InvalidRequest {
            reason: format!("probe feed rate must be positive, got {}", feed),
        }
        .into());
    }

    controller.wait_until_synced().await?;
    let _guard = ProbeGuard::engage(controller).await?;

    let status = controller.get_status().await?;
    let offset = status.state.work_offset();
    let offsets_zero = target
        .iter()
        .all(|(axis, _)| offset.get(axis).unwrap_or(0.0).abs() <= CONVENTION_TOLERANCE);

    let machine = match status.comms.probe_uses_machine_coordinates {
        Some(machine) => machine,
        None if offsets_zero => false,
        None => {
            let machine = test_convention(controller, target, feed).await?;
            controller.send(Command::SetProbeConvention(machine))?;
            machine
        }
    };

    let state = controller.get_status().await?.state;
    let wire_target = if machine {
        state.work_to_machine(target)
    } else {
        *target
    };
    tracing::info!("Probing toward {} at F{}", target, feed);
    let report = probe_cycle(controller, &wire_target, feed).await?;
    controller.wait_until_synced().await?;

    if !report.tripped {
        tracing::info!("Probe reached {} without contact", target);
        let clear = Instruction::from_text(controller.creator().clear_alarm());
        let mut handle = controller
            .send_with_priority(clear, Priority::Immediate)
            .await?;
        handle.acknowledged().await?;
        return Ok(ProbeOutcome::NotTripped);
    }

    let position = if machine {
        state.machine_to_work(&report.position)
    } else {
        report.position
    };
    tracing::info!("Probe tripped at {}", position);
    Ok(ProbeOutcome::Tripped(position))
}

/// Send one `G38.2` and wait for its probe report
async fn probe_cycle(
    controller: &TinyGController,
    target: &AxisValues,
    feed: f64,
) -> Result<ProbeReport> {
    let (tx, rx) = oneshot::channel();
    controller.send(Command::ExpectProbeReport(tx))?;
    let line = Instruction::from_text(controller.creator().probe(target, feed));
    let mut handle = controller
        .send_with_priority(line, Priority::Immediate)
        .await?;
    handle.acknowledged().await?;
    let report = rx.await.map_err(|_| ControllerError::ProbeFailed {
        reason: "no probe report received".to_string(),
    })?;
    Ok(report)
}

/// Trial probe to find out which coordinates the firmware expects
async fn test_convention(
    controller: &TinyGController,
    target: &AxisValues,
    feed: f64,
) -> Result<bool> {
    let state = controller.get_status().await?.state;
    let start = state.machine_position();
    let work = state.work_position();
    let trial: AxisValues = target
        .iter()
        .filter_map(|(axis, _)| work.get(axis).map(|v| (axis, v)))
        .collect();
    if trial.is_empty() {
        tracing::debug!("Work position unknown, assuming work coordinates for probing");
        return Ok(false);
    }

    tracing::debug!("Testing probe coordinate convention toward {}", trial);
    probe_cycle(controller, &trial, feed).await?;
    controller.wait_until_synced().await?;

    let after = controller.get_status().await?.state.machine_position();
    let moved = target.iter().any(|(axis, _)| match (start.get(axis), after.get(axis)) {
        (Some(before), Some(now)) => (before - now).abs() > CONVENTION_TOLERANCE,
        _ => false,
    });

    if moved {
        let back: AxisValues = target
            .iter()
            .filter_map(|(axis, _)| start.get(axis).map(|v| (axis, v)))
            .collect();
        tracing::debug!("Trial probe moved the machine, returning to {}", back);
        let line = Instruction::from_text(controller.creator().machine_rapid(&back));
        let mut handle = controller
            .send_with_priority(line, Priority::Immediate)
            .await?;
        handle.acknowledged().await?;
        controller.wait_until_synced().await?;
    }
    Ok(moved)
}
