//! Human-readable rendering of exploration results.

use crate::engine::ExplorationReport;
use crate::violations::Violation;
use mcmini_model::sequence::StateSequence;
use std::fmt::Write as _;

/// Render the executed transition stack, oldest first.
pub fn format_transition_stack(sequence: &StateSequence) -> String {
    let mut out = String::from("transition stack:\n");
    if sequence.transition_count() == 0 {
        out.push_str("  (empty)\n");
        return out;
    }
    for i in 0..sequence.transition_count() {
        if let Some(t) = sequence.transition_at(i) {
            let _ = writeln!(out, "  {i:4}  {t}");
        }
    }
    out
}

/// Render what every live thread would execute next.
pub fn format_pending_table(sequence: &StateSequence) -> String {
    let mut out = String::from("next transitions:\n");
    let mut any = false;
    for (tid, t) in sequence.pending_table() {
        any = true;
        let state = if sequence.transition_enabled(t) {
            "enabled"
        } else {
            "blocked"
        };
        let _ = writeln!(out, "  thread {tid}: {t} [{state}]");
    }
    if !any {
        out.push_str("  (no live threads)\n");
    }
    out
}

/// Format the final report for human consumption.
pub fn format_report(report: &ExplorationReport) -> String {
    let mut out = String::new();
    out.push_str("═══════════════════════════════════════════════════════════\n");
    out.push_str("  Model checking completed\n");
    out.push_str("═══════════════════════════════════════════════════════════\n");
    let _ = writeln!(out, "Number of transitions: {}", report.transitions);
    let _ = writeln!(out, "Number of traces:      {}", report.traces);
    if report.stopped_early {
        out.push_str("Exploration stopped at a configured stopping point.\n");
    }
    out.push('\n');

    if report.violations.is_empty() {
        out.push_str("No violations detected.\n");
        return out;
    }

    let _ = writeln!(out, "Violations ({}):", report.violations.len());
    for violation in &report.violations {
        match violation {
            Violation::Deadlock { trace_id, blocked } => {
                let _ = writeln!(out, "  [trace {trace_id}] deadlock:");
                for (tid, op) in blocked {
                    let _ = writeln!(out, "      thread {tid} blocked at {op}");
                }
            }
            Violation::DataRace {
                trace_id,
                addr,
                first_thread,
                second_thread,
            } => {
                let _ = writeln!(
                    out,
                    "  [trace {trace_id}] data race on 0x{addr:x} between threads \
                     {first_thread} and {second_thread}"
                );
            }
            Violation::ForwardProgress {
                trace_id,
                thread,
                steps_since_goal,
            } => {
                let _ = writeln!(
                    out,
                    "  [trace {trace_id}] thread {thread} starved for \
                     {steps_since_goal} transitions"
                );
            }
            Violation::UndefinedBehavior {
                trace_id,
                thread,
                reason,
            } => {
                let _ = writeln!(
                    out,
                    "  [trace {trace_id}] undefined behavior by thread {thread}: {reason}"
                );
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcmini_model::config::CheckerConfig;
    use mcmini_protocol::WireOp;

    #[test]
    fn stack_rendering_numbers_transitions() {
        let mut seq = StateSequence::new(CheckerConfig::default());
        seq.start(0x1000);
        seq.execute_pending(0, Some(WireOp::MutexInit { addr: 0x10, attrs: 0 }))
            .unwrap();
        let text = format_transition_stack(&seq);
        assert!(text.contains("0  thread 0: starts"));

        let pending = format_pending_table(&seq);
        assert!(pending.contains("mutex_init(0x10)"));
        assert!(pending.contains("[enabled]"));
    }

    #[test]
    fn report_without_violations_says_so() {
        let report = ExplorationReport {
            traces: 3,
            transitions: 17,
            violations: Vec::new(),
            stopped_early: false,
        };
        let text = format_report(&report);
        assert!(text.contains("Number of transitions: 17"));
        assert!(text.contains("Number of traces:      3"));
        assert!(text.contains("No violations detected"));
    }

    #[test]
    fn report_lists_deadlocks() {
        let report = ExplorationReport {
            traces: 2,
            transitions: 9,
            violations: vec![Violation::Deadlock {
                trace_id: 1,
                blocked: vec![(0, "thread 0: mutex_lock(0x10)".into())],
            }],
            stopped_early: true,
        };
        let text = format_report(&report);
        assert!(text.contains("deadlock"));
        assert!(text.contains("thread 0 blocked at"));
    }
}
