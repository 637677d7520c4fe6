//! Send queue
//!
//! Ordered record of every instruction that has not yet retired. Entries are
//! kept sorted by [`LineId`] and carry their own wire stage, so the three
//! regions of the queue (acknowledged, sent and waiting for a response, not
//! yet sent) are contiguous and the positional cursors are derived from the
//! entries rather than stored. Removing entries from anywhere therefore can't
//! leave a cursor pointing at the wrong place.

use super::instruction::{Instruction, InstructionHandle, LineId, Priority, ProgressTracker};
use serde_json::Value;
use std::collections::VecDeque;
use tinylink_core::ControllerError;

/// Closest two ids may get before unsent entries are renumbered
const MIN_ID_GAP: f64 = 1e-6;

/// Wire stage of a queue entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireStage {
    /// Not yet written
    Pending,
    /// Written, waiting for a response
    Sent,
    /// Response received; waiting to retire from the planner
    Acked,
}

/// One queued instruction
#[derive(Debug)]
pub struct QueueEntry {
    /// Ordering key
    pub id: LineId,
    /// The instruction
    pub instruction: Instruction,
    /// Enqueue priority
    pub priority: Priority,
    /// Wire stage
    pub stage: WireStage,
    /// Assigned to a planner mirror slot
    pub in_planner: bool,
    tracker: ProgressTracker,
}

/// What happened to an instruction when its response arrived
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Stays queued until the planner retires it
    AwaitingPlanner(LineId),
    /// Never touched the planner; retired immediately
    Retired(LineId),
    /// Firmware rejected it; removed
    Rejected(LineId),
}

/// Ordered queue of unretired instructions
#[derive(Debug, Default)]
pub struct SendQueue {
    entries: VecDeque<QueueEntry>,
    next_id: u64,
    max_sent: Option<LineId>,
    sent_at_last_report: Option<LineId>,
}

impl SendQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Self::default()
        }
    }

    /// Number of unretired entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no entries remain
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Index of the next entry waiting for a response
    pub fn to_receive(&self) -> usize {
        self.entries
            .iter()
            .take_while(|e| e.stage == WireStage::Acked)
            .count()
    }

    /// Index of the next entry to write
    pub fn to_send(&self) -> usize {
        self.entries
            .iter()
            .take_while(|e| e.stage != WireStage::Pending)
            .count()
    }

    /// Sent entries still waiting for a response
    pub fn unacked_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.stage == WireStage::Sent)
            .count()
    }

    /// Entries not yet written
    pub fn pending_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.stage == WireStage::Pending)
            .count()
    }

    /// Iterate over all entries in order
    pub fn iter(&self) -> impl Iterator<Item = &QueueEntry> {
        self.entries.iter()
    }

    /// Add an instruction.
    ///
    /// `Normal` appends with the next integer id. `Immediate` is placed right
    /// after everything already written, with an id between the highest id
    /// ever written and the first unsent entry.
    pub fn push(&mut self, instruction: Instruction, priority: Priority) -> InstructionHandle {
        let position = match priority {
            Priority::Normal => self.entries.len(),
            Priority::Immediate => self.to_send(),
        };

        let id = match self.entries.get(position) {
            None => self.allocate_id(),
            Some(_) => self.splice_id(position),
        };

        let (tracker, handle) = ProgressTracker::new(id);
        self.entries.insert(
            position,
            QueueEntry {
                id,
                instruction,
                priority,
                stage: WireStage::Pending,
                in_planner: false,
                tracker,
            },
        );
        handle
    }

    fn allocate_id(&mut self) -> LineId {
        let id = LineId::new(self.next_id as f64);
        self.next_id += 1;
        id
    }

    fn splice_id(&mut self, position: usize) -> LineId {
        let lower = |queue: &Self| {
            let next = queue.entries[position].id;
            queue
                .max_sent
                .unwrap_or_else(|| LineId::new(next.value() - 1.0))
        };
        let mut next = self.entries[position].id;
        if next.value() - lower(self).value() < MIN_ID_GAP {
            self.renumber_from(position);
            next = self.entries[position].id;
        }
        lower(self).midpoint(next)
    }

    /// Give unsent entries from `position` on fresh integer ids
    fn renumber_from(&mut self, position: usize) {
        tracing::debug!(
            "Renumbering {} unsent entries",
            self.entries.len() - position
        );
        for i in position..self.entries.len() {
            let id = self.allocate_id();
            let entry = &mut self.entries[i];
            entry.id = id;
            entry.tracker.set_id(id);
        }
    }

    /// Next entry to write
    pub fn next_to_send(&self) -> Option<&QueueEntry> {
        self.entries.get(self.to_send())
    }

    /// Mark the next entry as written and return it
    pub fn mark_next_sent(&mut self) -> Option<&QueueEntry> {
        let index = self.to_send();
        let entry = self.entries.get_mut(index)?;
        entry.stage = WireStage::Sent;
        entry.tracker.sent();
        if self.max_sent.is_none_or(|max| entry.id > max) {
            self.max_sent = Some(entry.id);
        }
        Some(&self.entries[index])
    }

    /// Oldest entry waiting for a response
    pub fn oldest_unacked(&self) -> Option<&QueueEntry> {
        self.entries
            .get(self.to_receive())
            .filter(|e| e.stage == WireStage::Sent)
    }

    /// Apply a response to the oldest unacked entry.
    ///
    /// A rejected entry is removed and its handle errors. An accepted entry
    /// that uses planner slots stays queued; one that doesn't is retired
    /// immediately.
    pub fn acknowledge(
        &mut self,
        response: Value,
        rejection: Option<ControllerError>,
    ) -> Option<AckOutcome> {
        let index = self.to_receive();
        if self.entries.get(index)?.stage != WireStage::Sent {
            return None;
        }

        let entry = &self.entries[index];
        let id = entry.id;
        let uses_planner = entry.instruction.planner_slots > 0;

        if let Some(error) = rejection {
            if let Some(entry) = self.entries.remove(index) {
                entry.tracker.errored(error);
            }
            return Some(AckOutcome::Rejected(id));
        }

        self.entries[index].tracker.acknowledged(response);

        if uses_planner {
            self.entries[index].stage = WireStage::Acked;
            return Some(AckOutcome::AwaitingPlanner(id));
        }

        if let Some(entry) = self.entries.remove(index) {
            entry.tracker.executing();
            entry.tracker.executed();
        }
        Some(AckOutcome::Retired(id))
    }

    /// Acked entries not yet assigned to a planner slot, in order
    pub fn unassigned_acked(&self) -> Vec<LineId> {
        self.entries
            .iter()
            .take_while(|e| e.stage == WireStage::Acked)
            .filter(|e| !e.in_planner)
            .map(|e| e.id)
            .collect()
    }

    /// Mark acked entries up to and including `max` as assigned to the planner
    pub fn assign_to_planner(&mut self, max: LineId) {
        for entry in self
            .entries
            .iter_mut()
            .take_while(|e| e.stage == WireStage::Acked)
        {
            if entry.id <= max {
                entry.in_planner = true;
            }
        }
    }

    /// Fire `executing` for acked entries up to and including `max`
    pub fn mark_executing_through(&mut self, max: LineId) {
        for entry in self
            .entries
            .iter()
            .take_while(|e| e.stage == WireStage::Acked && e.id <= max)
        {
            entry.tracker.executing();
        }
    }

    /// Retire acked entries up to and including `max`. Returns how many.
    pub fn retire_through(&mut self, max: LineId) -> usize {
        let mut retired = 0;
        while self
            .entries
            .front()
            .is_some_and(|e| e.stage == WireStage::Acked && e.id <= max)
        {
            if let Some(entry) = self.entries.pop_front() {
                entry.tracker.executing();
                entry.tracker.executed();
                retired += 1;
            }
        }
        retired
    }

    /// Retire every acked entry. Returns how many.
    pub fn retire_all_acked(&mut self) -> usize {
        let mut retired = 0;
        while self
            .entries
            .front()
            .is_some_and(|e| e.stage == WireStage::Acked)
        {
            if let Some(entry) = self.entries.pop_front() {
                entry.tracker.executing();
                entry.tracker.executed();
                retired += 1;
            }
        }
        retired
    }

    /// Remember the current send position as of a queue report
    pub fn mark_report(&mut self) {
        self.sent_at_last_report = self.max_sent;
    }

    /// Worst-case planner slots of everything written since the last queue report
    pub fn slots_sent_since_report(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.stage != WireStage::Pending)
            .filter(|e| self.sent_at_last_report.is_none_or(|mark| e.id > mark))
            .map(|e| e.instruction.planner_slots as usize)
            .sum()
    }

    /// True if full-sync rules forbid sending the next entry now.
    ///
    /// A full-sync entry is only written once everything before it has
    /// retired, and nothing is written while a full-sync entry is outstanding.
    pub fn blocked_by_full_sync(&self) -> bool {
        let index = self.to_send();
        let Some(next) = self.entries.get(index) else {
            return false;
        };
        if next.instruction.full_sync && index > 0 {
            return true;
        }
        self.entries
            .iter()
            .take(index)
            .any(|e| e.instruction.full_sync)
    }

    /// Remove every entry, rejecting each handle with `error`
    pub fn cancel_all(&mut self, error: &ControllerError) -> usize {
        let count = self.entries.len();
        for entry in self.entries.drain(..) {
            entry.tracker.errored(error.clone());
        }
        self.sent_at_last_report = self.max_sent;
        count
    }

    /// Check the ordering and partition invariants
    pub fn check_invariants(&self) -> bool {
        let sorted = self
            .entries
            .iter()
            .zip(self.entries.iter().skip(1))
            .all(|(a, b)| a.id < b.id);
        let to_receive = self.to_receive();
        let to_send = self.to_send();
        let partitioned = self.entries.iter().enumerate().all(|(i, e)| match e.stage {
            WireStage::Acked => i < to_receive,
            WireStage::Sent => i >= to_receive && i < to_send,
            WireStage::Pending => i >= to_send,
        });
        sorted && partitioned && to_receive <= to_send && to_send <= self.entries.len()
    }
}
