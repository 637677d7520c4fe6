use proptest::prelude::*;
use serde_json::json;
use tinylink_communication::{
    Instruction, InstructionHandle, PlannerMirror, Priority, QueueReport, SendQueue, WireStage,
};
use tinylink_core::ControllerError;

const CAPACITY: usize = 8;

#[derive(Debug, Clone)]
enum Op {
    Push { slots: u8, immediate: bool },
    Send,
    Ack { reject: bool },
    Report { pushed: usize, popped: usize, free: usize },
    Drain,
    Cancel,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0u8..3, prop::bool::weighted(0.2))
            .prop_map(|(slots, immediate)| Op::Push { slots, immediate }),
        4 => Just(Op::Send),
        3 => prop::bool::weighted(0.1).prop_map(|reject| Op::Ack { reject }),
        3 => (0usize..3, 0usize..3, 0usize..=CAPACITY)
            .prop_map(|(pushed, popped, free)| Op::Report { pushed, popped, free }),
        1 => Just(Op::Drain),
        1 => Just(Op::Cancel),
    ]
}

struct Model {
    queue: SendQueue,
    planner: PlannerMirror,
    handles: Vec<InstructionHandle>,
}

impl Model {
    fn new() -> Self {
        Self {
            queue: SendQueue::new(),
            planner: PlannerMirror::new(CAPACITY),
            handles: Vec::new(),
        }
    }

    fn apply(&mut self, op: Op) {
        match op {
            Op::Push { slots, immediate } => {
                let priority = if immediate {
                    Priority::Immediate
                } else {
                    Priority::Normal
                };
                let instruction = Instruction::from_text("G1 X1").with_planner_slots(slots);
                self.handles.push(self.queue.push(instruction, priority));
            }
            Op::Send => {
                self.queue.mark_next_sent();
            }
            Op::Ack { reject } => {
                let rejection = reject.then(|| ControllerError::RequestRejected {
                    code: 100,
                    message: "Unrecognized command".to_string(),
                });
                self.queue.acknowledge(json!({}), rejection);
            }
            Op::Report {
                pushed,
                popped,
                free,
            } => {
                let report = QueueReport {
                    free,
                    pushed,
                    popped,
                };
                self.planner.apply_report(report, &mut self.queue);
                self.queue.mark_report();
            }
            Op::Drain => {
                self.planner.drain(&mut self.queue);
            }
            Op::Cancel => {
                self.queue.cancel_all(&ControllerError::Cancelled {
                    reason: "cancelled".to_string(),
                });
                self.planner.clear();
            }
        }
    }
}

proptest! {
    #[test]
    fn queue_partitions_hold(ops in prop::collection::vec(op(), 0..120)) {
        let mut model = Model::new();
        for op in ops {
            model.apply(op);
            let queue = &model.queue;
            prop_assert!(queue.check_invariants());
            prop_assert_eq!(queue.unacked_count(), queue.to_send() - queue.to_receive());
            prop_assert_eq!(queue.pending_count(), queue.len() - queue.to_send());
        }
    }

    #[test]
    fn planner_mirror_accounts_for_assigned_lines(ops in prop::collection::vec(op(), 0..120)) {
        let mut model = Model::new();
        for op in ops {
            model.apply(op);
            let assigned = model.queue.iter().filter(|e| e.in_planner).count();
            prop_assert_eq!(model.planner.instruction_count(), assigned);
            prop_assert!(model.planner.len() <= model.planner.capacity());
        }
    }

    #[test]
    fn handles_finish_exactly_when_entries_leave(ops in prop::collection::vec(op(), 0..120)) {
        let mut model = Model::new();
        for op in ops {
            model.apply(op);
        }
        for handle in &model.handles {
            let queued = model.queue.iter().any(|e| e.id == handle.id());
            prop_assert_eq!(queued, !handle.is_finished(), "line {}", handle.id());
        }
    }

    #[test]
    fn slots_since_report_never_exceed_sent_slots(ops in prop::collection::vec(op(), 0..120)) {
        let mut model = Model::new();
        for op in ops {
            model.apply(op);
            let sent: usize = model
                .queue
                .iter()
                .filter(|e| e.stage != WireStage::Pending)
                .map(|e| e.instruction.planner_slots as usize)
                .sum();
            prop_assert!(model.queue.slots_sent_since_report() <= sent);
        }
    }
}
