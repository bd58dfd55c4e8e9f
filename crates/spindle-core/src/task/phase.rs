//! TaskPhase - タスクの状態遷移
//!
//! ```text
//! Fresh ──Start──▶ Running ──Park──▶ Parked ──Arm──▶ Armed
//!                   │  ▲                │               │
//!                   │  └─────Start──────┴───────────────┘
//!                   ├──Bounce──▶ Queued ──Start──▶ Running
//!                   └──Answer──▶ Answered (final)
//! ```
//!
//! Answer is accepted from every phase; nothing leaves Answered.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    /// Never executed.
    Fresh,
    /// Executing an attempt on a worker.
    Running,
    /// Resubmitted without parking (the wait store refused it).
    Queued,
    /// Waiting in the wait store.
    Parked,
    /// Waiting in the wait store and registered for its deadline.
    Armed,
    /// An answer was delivered.
    Answered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    Start,
    Park,
    Arm,
    Bounce,
    Answer,
}

impl TaskPhase {
    /// Next phase, or None if `event` is not valid in this phase.
    pub fn next(self, event: PhaseEvent) -> Option<TaskPhase> {
        use PhaseEvent as E;
        use TaskPhase as P;
        match (self, event) {
            (P::Answered, _) => None,
            (_, E::Answer) => Some(P::Answered),
            (P::Fresh | P::Queued | P::Parked | P::Armed, E::Start) => Some(P::Running),
            (P::Running, E::Park) => Some(P::Parked),
            (P::Parked, E::Arm) => Some(P::Armed),
            (P::Running, E::Bounce) => Some(P::Queued),
            _ => None,
        }
    }

    pub fn is_answered(self) -> bool {
        self == TaskPhase::Answered
    }

    /// The wait store may still hold the task.
    pub fn may_be_parked(self) -> bool {
        matches!(self, TaskPhase::Parked | TaskPhase::Armed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(TaskPhase::Fresh, PhaseEvent::Start, Some(TaskPhase::Running))]
    #[case(TaskPhase::Running, PhaseEvent::Park, Some(TaskPhase::Parked))]
    #[case(TaskPhase::Parked, PhaseEvent::Arm, Some(TaskPhase::Armed))]
    #[case(TaskPhase::Armed, PhaseEvent::Start, Some(TaskPhase::Running))]
    #[case(TaskPhase::Running, PhaseEvent::Bounce, Some(TaskPhase::Queued))]
    #[case(TaskPhase::Queued, PhaseEvent::Start, Some(TaskPhase::Running))]
    #[case(TaskPhase::Parked, PhaseEvent::Answer, Some(TaskPhase::Answered))]
    #[case(TaskPhase::Fresh, PhaseEvent::Park, None)]
    #[case(TaskPhase::Running, PhaseEvent::Arm, None)]
    #[case(TaskPhase::Answered, PhaseEvent::Start, None)]
    #[case(TaskPhase::Answered, PhaseEvent::Answer, None)]
    fn transitions(
        #[case] from: TaskPhase,
        #[case] event: PhaseEvent,
        #[case] expected: Option<TaskPhase>,
    ) {
        assert_eq!(from.next(event), expected);
    }

    #[test]
    fn only_parked_phases_may_be_in_the_store() {
        assert!(TaskPhase::Parked.may_be_parked());
        assert!(TaskPhase::Armed.may_be_parked());
        assert!(!TaskPhase::Queued.may_be_parked());
        assert!(!TaskPhase::Answered.may_be_parked());
    }
}
