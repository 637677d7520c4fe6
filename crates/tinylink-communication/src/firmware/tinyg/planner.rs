//! Planner mirror
//!
//! The firmware's planner buffer can't be read directly. Each queue report
//! says how many slots were filled and vacated since the previous one; the
//! mirror replays those deltas against the acknowledged instructions to know
//! which instructions occupy which slot. Retiring a slot is what finally
//! marks its instructions executed.
//!
//! The accounting is approximate (reports coalesce, and some commands take a
//! slot without us knowing), so after every report the mirror length is
//! forced to match `capacity - free`.

use super::instruction::LineId;
use super::response_parser::QueueReport;
use super::send_queue::SendQueue;
use std::collections::VecDeque;

/// Inclusive range of instruction ids occupying one planner slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineRange {
    /// Lowest id
    pub min: LineId,
    /// Highest id
    pub max: LineId,
    /// Number of instructions in the range
    pub count: usize,
}

impl LineRange {
    fn from_ids(ids: &[LineId]) -> Option<Self> {
        Some(Self {
            min: *ids.first()?,
            max: *ids.last()?,
            count: ids.len(),
        })
    }

    fn extend(&mut self, ids: &[LineId]) {
        if let Some(last) = ids.last() {
            self.max = *last;
            self.count += ids.len();
        }
    }
}

/// Result of applying one queue report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReportOutcome {
    /// Instructions retired
    pub retired: usize,
    /// Slots shifted or padded to match the reported occupancy
    pub corrected: usize,
}

/// Reconstruction of the firmware planner buffer
#[derive(Debug, Clone)]
pub struct PlannerMirror {
    slots: VecDeque<Option<LineRange>>,
    capacity: usize,
    last_free: usize,
    /// Pops owed to slots we created without a visible push
    pending_pops: usize,
}

impl PlannerMirror {
    /// Create an empty mirror for a planner of `capacity` slots
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: VecDeque::new(),
            capacity,
            last_free: capacity,
            pending_pops: 0,
        }
    }

    /// Planner size in slots
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free slots as of the last report
    pub fn last_free(&self) -> usize {
        self.last_free
    }

    /// Number of slots believed occupied
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True if no slot is believed occupied
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Iterate over the mirrored slots, head first
    pub fn iter(&self) -> impl Iterator<Item = &Option<LineRange>> {
        self.slots.iter()
    }

    /// Instructions held across all slots
    pub fn instruction_count(&self) -> usize {
        self.slots.iter().flatten().map(|range| range.count).sum()
    }

    /// Range at the head of the planner
    pub fn head(&self) -> Option<LineRange> {
        self.slots.front().copied().flatten()
    }

    /// Apply a queue report, retiring instructions from `queue` as slots vacate
    pub fn apply_report(&mut self, report: QueueReport, queue: &mut SendQueue) -> ReportOutcome {
        let mut outcome = ReportOutcome::default();

        if report.free > self.capacity {
            tracing::debug!(
                "Planner capacity raised from {} to {}",
                self.capacity,
                report.free
            );
            self.capacity = report.free;
        }

        let window = queue.unassigned_acked();
        let owed = std::mem::take(&mut self.pending_pops);
        let pushed = report.pushed.min(self.capacity);
        let mut pops = report.popped.min(self.capacity) + owed;

        if pushed > 0 {
            self.distribute(&window, pushed);
        } else if !window.is_empty() {
            // Acked lines with no visible push: the firmware batched them
            // into a slot we already know about, or already ran them.
            match self.slots.back_mut() {
                Some(Some(range)) => range.extend(&window),
                Some(slot) => *slot = LineRange::from_ids(&window),
                // The slot is popped on a later report
                None => {
                    self.slots.push_back(LineRange::from_ids(&window));
                    self.pending_pops = 1;
                    pops = 0;
                }
            }
        }
        if let Some(last) = window.last() {
            queue.assign_to_planner(*last);
        }

        for _ in 0..pops {
            match self.slots.pop_front() {
                Some(slot) => outcome.retired += retire(slot, queue),
                None => break,
            }
        }

        let occupied = self.capacity.saturating_sub(report.free);
        while self.slots.len() > occupied {
            if let Some(slot) = self.slots.pop_front() {
                outcome.retired += retire(slot, queue);
                outcome.corrected += 1;
            }
        }
        while self.slots.len() < occupied {
            self.slots.push_back(None);
            outcome.corrected += 1;
        }
        self.pending_pops = self.pending_pops.min(self.slots.len());
        if outcome.corrected > 0 {
            tracing::warn!(
                "Planner mirror resynchronized by {} slots (free {}, capacity {})",
                outcome.corrected,
                report.free,
                self.capacity
            );
        }

        self.last_free = report.free;
        self.mark_head_executing(queue);

        tracing::debug!(
            "Queue report free={} pushed={} popped={}: mirror {} slots, retired {}",
            report.free,
            report.pushed,
            report.popped,
            self.slots.len(),
            outcome.retired
        );
        outcome
    }

    /// Spread `ids` across `pushed` new slots; earlier slots take the remainder
    fn distribute(&mut self, ids: &[LineId], pushed: usize) {
        let base = ids.len() / pushed;
        let remainder = ids.len() % pushed;
        let mut start = 0;
        for slot in 0..pushed {
            let count = base + usize::from(slot < remainder);
            self.slots
                .push_back(LineRange::from_ids(&ids[start..start + count]));
            start += count;
        }
    }

    /// Fire `executing` for the instructions in the head slot
    pub fn mark_head_executing(&self, queue: &mut SendQueue) {
        if let Some(head) = self.head() {
            queue.mark_executing_through(head.max);
        }
    }

    /// Empty the mirror and retire every acked instruction.
    ///
    /// Used when the machine is known to be idle, so nothing can still be in
    /// the planner and every slot is free.
    pub fn drain(&mut self, queue: &mut SendQueue) -> usize {
        self.slots.clear();
        self.pending_pops = 0;
        self.last_free = self.capacity;
        let retired = queue.retire_all_acked();
        queue.mark_report();
        retired
    }

    /// Forget all state, keeping the learnt capacity
    pub fn clear(&mut self) {
        self.slots.clear();
        self.pending_pops = 0;
        self.last_free = self.capacity;
    }
}

fn retire(slot: Option<LineRange>, queue: &mut SendQueue) -> usize {
    match slot {
        Some(range) => queue.retire_through(range.max),
        None => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firmware::tinyg::instruction::{Instruction, Priority, Stage};
    use serde_json::json;

    fn report(free: usize, pushed: usize, popped: usize) -> QueueReport {
        QueueReport {
            free,
            pushed,
            popped,
        }
    }

    fn send_and_ack(queue: &mut SendQueue, count: usize) -> Vec<crate::InstructionHandle> {
        let handles: Vec<_> = (0..count)
            .map(|i| queue.push(Instruction::from_text(format!("G1 X{}", i)), Priority::Normal))
            .collect();
        for _ in 0..count {
            queue.mark_next_sent();
            queue.acknowledge(json!({}), None);
        }
        handles
    }

    #[test]
    fn test_push_then_pop() {
        let mut queue = SendQueue::new();
        let mut mirror = PlannerMirror::new(28);
        let handles = send_and_ack(&mut queue, 1);

        mirror.apply_report(report(27, 1, 0), &mut queue);
        assert_eq!(handles[0].stage(), Stage::Executing);
        assert_eq!(queue.len(), 1);
        assert_eq!(mirror.len(), 1);

        let outcome = mirror.apply_report(report(28, 0, 1), &mut queue);
        assert_eq!(outcome.retired, 1);
        assert_eq!(handles[0].stage(), Stage::Executed);
        assert!(queue.is_empty());
        assert!(mirror.is_empty());
    }

    #[test]
    fn test_distribution_remainder_goes_first() {
        let mut queue = SendQueue::new();
        let mut mirror = PlannerMirror::new(28);
        send_and_ack(&mut queue, 5);

        mirror.apply_report(report(25, 3, 0), &mut queue);
        let counts: Vec<usize> = mirror.iter().map(|s| s.map_or(0, |r| r.count)).collect();
        assert_eq!(counts, vec![2, 2, 1]);
        assert_eq!(mirror.instruction_count(), 5);
    }

    #[test]
    fn test_more_slots_than_lines() {
        let mut queue = SendQueue::new();
        let mut mirror = PlannerMirror::new(28);
        send_and_ack(&mut queue, 1);

        // One arc split into three segments
        mirror.apply_report(report(25, 3, 0), &mut queue);
        let slots: Vec<bool> = mirror.iter().map(Option::is_some).collect();
        assert_eq!(slots, vec![true, false, false]);
    }

    #[test]
    fn test_unseen_push_merges_into_tail() {
        let mut queue = SendQueue::new();
        let mut mirror = PlannerMirror::new(28);
        send_and_ack(&mut queue, 1);
        mirror.apply_report(report(27, 1, 0), &mut queue);

        send_and_ack(&mut queue, 2);
        mirror.apply_report(report(27, 0, 0), &mut queue);
        assert_eq!(mirror.len(), 1);
        assert_eq!(mirror.head().map(|r| r.count), Some(3));
    }

    #[test]
    fn test_unseen_push_with_empty_mirror_retires() {
        let mut queue = SendQueue::new();
        let mut mirror = PlannerMirror::new(28);
        let handles = send_and_ack(&mut queue, 2);

        let outcome = mirror.apply_report(report(28, 0, 0), &mut queue);
        assert_eq!(outcome.retired, 2);
        assert!(handles.iter().all(|h| h.stage() == Stage::Executed));
        assert!(mirror.is_empty());
    }

    #[test]
    fn test_unseen_push_into_busy_planner_waits_for_next_report() {
        let mut queue = SendQueue::new();
        let mut mirror = PlannerMirror::new(28);
        let handles = send_and_ack(&mut queue, 1);

        let outcome = mirror.apply_report(report(27, 0, 0), &mut queue);
        assert_eq!(outcome.retired, 0);
        assert_eq!(handles[0].stage(), Stage::Executing);
        assert_eq!(mirror.len(), 1);
        assert_eq!(mirror.head().map(|r| r.count), Some(1));

        // The owed pop lands on the following report
        let outcome = mirror.apply_report(report(27, 0, 0), &mut queue);
        assert_eq!(outcome.retired, 1);
        assert_eq!(handles[0].stage(), Stage::Executed);
        assert!(queue.is_empty());
        assert_eq!(mirror.len(), 1);
        assert_eq!(mirror.head(), None);
    }

    #[test]
    fn test_oversized_deltas_are_clamped() {
        let mut queue = SendQueue::new();
        let mut mirror = PlannerMirror::new(28);
        send_and_ack(&mut queue, 2);

        mirror.apply_report(report(26, 60_000, 0), &mut queue);
        assert_eq!(mirror.len(), 2);
        mirror.apply_report(report(28, 0, 60_000), &mut queue);
        assert!(mirror.is_empty());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_resync_to_reported_occupancy() {
        let mut queue = SendQueue::new();
        let mut mirror = PlannerMirror::new(28);
        send_and_ack(&mut queue, 4);
        mirror.apply_report(report(24, 4, 0), &mut queue);

        // Firmware says two slots are in use but only reported one pop
        let outcome = mirror.apply_report(report(26, 0, 1), &mut queue);
        assert_eq!(mirror.len(), 2);
        assert_eq!(outcome.retired, 2);
        assert_eq!(outcome.corrected, 1);

        // Firmware is busier than we thought
        let outcome = mirror.apply_report(report(23, 0, 0), &mut queue);
        assert_eq!(mirror.len(), 5);
        assert_eq!(outcome.corrected, 3);
    }

    #[test]
    fn test_capacity_learnt_upward() {
        let mut queue = SendQueue::new();
        let mut mirror = PlannerMirror::new(24);
        mirror.apply_report(report(28, 0, 0), &mut queue);
        assert_eq!(mirror.capacity(), 28);
        assert!(mirror.is_empty());
    }

    #[test]
    fn test_drain_retires_everything_acked() {
        let mut queue = SendQueue::new();
        let mut mirror = PlannerMirror::new(32);
        let handles = send_and_ack(&mut queue, 3);
        mirror.apply_report(report(31, 1, 0), &mut queue);
        mirror.apply_report(report(28, 0, 0), &mut queue);

        assert_eq!(mirror.drain(&mut queue), 3);
        assert!(handles.iter().all(|h| h.stage() == Stage::Executed));
        assert!(mirror.is_empty());
        assert_eq!(mirror.last_free(), 32);
        assert_eq!(queue.slots_sent_since_report(), 0);
    }
}
