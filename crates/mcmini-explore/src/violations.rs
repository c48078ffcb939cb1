//! Violation records accumulated across the whole exploration.
//!
//! Data races are deduplicated per unordered access pair so that the two
//! explored orders of one conflicting pair produce a single report.

use mcmini_model::Tid;
use serde::Serialize;
use std::collections::BTreeSet;

/// One property violation found during exploration.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    Deadlock {
        trace_id: u64,
        /// Each blocked thread with a rendering of the operation it is
        /// stuck on.
        blocked: Vec<(Tid, String)>,
    },
    DataRace {
        trace_id: u64,
        addr: u64,
        first_thread: Tid,
        second_thread: Tid,
    },
    ForwardProgress {
        trace_id: u64,
        thread: Tid,
        steps_since_goal: u64,
    },
    UndefinedBehavior {
        trace_id: u64,
        thread: Tid,
        reason: String,
    },
}

impl Violation {
    pub fn headline(&self) -> &'static str {
        match self {
            Violation::Deadlock { .. } => "DEADLOCK DETECTED",
            Violation::DataRace { .. } => "DATA RACE DETECTED",
            Violation::ForwardProgress { .. } => "FORWARD PROGRESS VIOLATION DETECTED",
            Violation::UndefinedBehavior { .. } => "UNDEFINED BEHAVIOR DETECTED",
        }
    }
}

/// The accumulating log of violations.
#[derive(Debug, Default)]
pub struct ViolationLog {
    violations: Vec<Violation>,
    /// (addr, lower tid, higher tid) triples already reported.
    race_keys: BTreeSet<(u64, Tid, Tid)>,
    /// (thread, goal index) pairs already reported as starving.
    starvation_keys: BTreeSet<(Tid, Option<usize>)>,
}

impl ViolationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_deadlock(&mut self, trace_id: u64, blocked: Vec<(Tid, String)>) {
        self.violations.push(Violation::Deadlock { trace_id, blocked });
    }

    /// Record a race between two threads on one address. Returns false
    /// if this unordered pair was already reported.
    pub fn record_data_race(&mut self, trace_id: u64, addr: u64, a: Tid, b: Tid) -> bool {
        let key = (addr, a.min(b), a.max(b));
        if !self.race_keys.insert(key) {
            return false;
        }
        self.violations.push(Violation::DataRace {
            trace_id,
            addr,
            first_thread: key.1,
            second_thread: key.2,
        });
        true
    }

    /// Record a starving thread. Returns false if this thread was
    /// already reported for the same goal.
    pub fn record_forward_progress(
        &mut self,
        trace_id: u64,
        thread: Tid,
        goal_index: Option<usize>,
        steps_since_goal: u64,
    ) -> bool {
        if !self.starvation_keys.insert((thread, goal_index)) {
            return false;
        }
        self.violations.push(Violation::ForwardProgress {
            trace_id,
            thread,
            steps_since_goal,
        });
        true
    }

    pub fn record_undefined_behavior(&mut self, trace_id: u64, thread: Tid, reason: String) {
        self.violations.push(Violation::UndefinedBehavior {
            trace_id,
            thread,
            reason,
        });
    }

    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }

    pub fn is_empty(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn deadlocks(&self) -> usize {
        self.violations
            .iter()
            .filter(|v| matches!(v, Violation::Deadlock { .. }))
            .count()
    }

    pub fn data_races(&self) -> usize {
        self.violations
            .iter()
            .filter(|v| matches!(v, Violation::DataRace { .. }))
            .count()
    }

    pub fn has_undefined_behavior(&self) -> bool {
        self.violations
            .iter()
            .any(|v| matches!(v, Violation::UndefinedBehavior { .. }))
    }

    pub fn into_violations(self) -> Vec<Violation> {
        self.violations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_race_pairs_deduplicate_in_both_orders() {
        let mut log = ViolationLog::new();
        assert!(log.record_data_race(0, 0x10, 2, 1));
        assert!(!log.record_data_race(1, 0x10, 1, 2));
        assert!(log.record_data_race(1, 0x20, 1, 2));
        assert_eq!(log.data_races(), 2);
    }

    #[test]
    fn starvation_deduplicates_per_goal() {
        let mut log = ViolationLog::new();
        assert!(log.record_forward_progress(0, 1, Some(4), 8));
        assert!(!log.record_forward_progress(0, 1, Some(4), 9));
        assert!(log.record_forward_progress(1, 1, Some(12), 8));
    }

    #[test]
    fn headline_names_the_violation() {
        let mut log = ViolationLog::new();
        log.record_deadlock(0, vec![(0, "thread 0: mutex_lock(0x10)".into())]);
        assert_eq!(log.violations()[0].headline(), "DEADLOCK DETECTED");
    }
}
