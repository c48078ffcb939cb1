//! The main exploration loop.
//!
//! One *trace* is a complete execution of the checked program under one
//! schedule. After each trace the engine pops the state stack back to
//! the deepest state with an unexplored backtrack thread, restores the
//! model to that depth, restarts the program through the runner, replays
//! the transition prefix, and runs to completion from the chosen thread.
//! Exploration ends when every state's backtrack set is exhausted.

use crate::report::{format_pending_table, format_transition_stack};
use crate::violations::{Violation, ViolationLog};
use crate::ExploreError;
use log::{debug, info, warn};
use mcmini_model::config::CheckerConfig;
use mcmini_model::sequence::StateSequence;
use mcmini_model::{ModelError, Tid};
use mcmini_runner::Runner;
use serde::Serialize;

/// Parameters of one exploration session.
#[derive(Debug, Clone, Default)]
pub struct ExplorerConfig {
    /// Model-checking parameters (depth cap, liveness budgets, ...).
    pub checker: CheckerConfig,
    /// Safety limit on the number of traces; `None` is exhaustive.
    pub max_traces: Option<u64>,
}

/// The exploration engine, generic over how the program is driven.
pub struct Explorer<R: Runner> {
    config: ExplorerConfig,
    sequence: StateSequence,
    runner: R,
    main_handle: u64,
    trace_id: u64,
    transition_id: u64,
    violations: ViolationLog,
}

/// Why one trace ended.
enum TraceOutcome {
    /// Keep exploring further schedules.
    Continue,
    /// A configured stopping point was reached.
    Stop,
    /// The program performed an undefined operation; exploration cannot
    /// meaningfully continue.
    Fatal,
}

/// Final result of an exploration session.
#[derive(Debug, Serialize)]
pub struct ExplorationReport {
    /// Number of complete schedules executed.
    pub traces: u64,
    /// Number of transitions executed across all schedules.
    pub transitions: u64,
    pub violations: Vec<Violation>,
    /// Exploration ended at a configured stop (first deadlock or a
    /// trace dump) rather than by exhaustion.
    pub stopped_early: bool,
}

impl ExplorationReport {
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

    pub fn forward_progress_violations(&self) -> usize {
        self.violations
            .iter()
            .filter(|v| matches!(v, Violation::ForwardProgress { .. }))
            .count()
    }

    pub fn has_undefined_behavior(&self) -> bool {
        self.violations
            .iter()
            .any(|v| matches!(v, Violation::UndefinedBehavior { .. }))
    }
}

impl<R: Runner> Explorer<R> {
    /// `main_handle` is the system identity the runner reports for the
    /// program's main thread.
    pub fn new(config: ExplorerConfig, runner: R, main_handle: u64) -> Self {
        let sequence = StateSequence::new(config.checker.clone());
        Self {
            config,
            sequence,
            runner,
            main_handle,
            trace_id: 0,
            transition_id: 0,
            violations: ViolationLog::new(),
        }
    }

    /// Run the full exploration and produce the report.
    pub fn run(mut self) -> Result<ExplorationReport, ExploreError> {
        self.sequence.start(self.main_handle);

        let mut stopped_early = false;
        let mut depth = self.sequence.state_count();
        while depth > 0 {
            let idx = depth - 1;
            let Some(chosen) = self.sequence.select_backtrack_thread(idx) else {
                depth -= 1;
                continue;
            };

            if self.trace_id > 0 && self.trace_id % 1000 == 0 {
                info!("trace {}", self.trace_id);
            }
            if let Some(limit) = self.config.max_traces {
                if self.trace_id >= limit {
                    warn!("stopping after {limit} traces");
                    stopped_early = true;
                    break;
                }
            }

            self.sequence.reflect_at(idx)?;
            self.runner.start()?;
            self.replay_prefix(idx)?;

            let outcome = self.exhaust(chosen)?;
            let finished_trace = self.trace_id;
            self.trace_id += 1;

            if self.config.checker.print_at_trace == Some(finished_trace) {
                println!("{}", format_transition_stack(&self.sequence));
                println!("{}", format_pending_table(&self.sequence));
                stopped_early = true;
                break;
            }
            if self.config.checker.debug_at_trace == Some(finished_trace) {
                info!("trace {finished_trace} reached; attach a debugger to replay it");
            }
            match outcome {
                TraceOutcome::Continue => {}
                TraceOutcome::Stop => {
                    stopped_early = true;
                    break;
                }
                TraceOutcome::Fatal => {
                    stopped_early = true;
                    break;
                }
            }

            self.sequence.sleep_thread_at(idx, chosen);
            depth = self.sequence.state_count();
        }

        self.runner.kill();
        info!(
            "exploration complete: {} traces, {} transitions",
            self.trace_id, self.transition_id
        );
        Ok(ExplorationReport {
            traces: self.trace_id,
            transitions: self.transition_id,
            violations: self.violations.into_violations(),
            stopped_early,
        })
    }

    /// Re-execute the recorded prefix in a fresh child. The descriptors
    /// the runner produces are identical to the recorded ones by the
    /// determinism assumption, so they are not re-decoded.
    fn replay_prefix(&mut self, depth: usize) -> Result<(), ExploreError> {
        for i in 0..depth {
            let Some(t) = self.sequence.transition_at(i) else {
                return Err(ModelError::InvalidState("replay past recorded stack").into());
            };
            let executor = t.executor;
            if t.ends_thread() {
                self.runner.release(executor)?;
            } else {
                self.runner.advance(executor)?;
            }
        }
        debug!("replayed {depth} transitions");
        Ok(())
    }

    /// Run the program to completion starting with `first`'s pending
    /// transition, growing backtrack sets and checking violations after
    /// every step.
    fn exhaust(&mut self, first: Tid) -> Result<TraceOutcome, ExploreError> {
        let mut next = self
            .sequence
            .pending_transition(first)
            .cloned()
            .ok_or(ModelError::NoPending(first))?;
        if !self.sequence.transition_schedulable(&next) {
            // Backtrack sets only ever receive threads enabled in their
            // state, so a disabled selection is a bookkeeping bug.
            return Err(ModelError::InvalidState("backtracked onto a disabled thread").into());
        }

        loop {
            let tid = next.executor;
            let descriptor = if next.ends_thread() {
                self.runner.release(tid)?;
                None
            } else {
                Some(self.runner.advance(tid)?)
            };
            self.transition_id += 1;

            match self.sequence.execute_pending(tid, descriptor.map(|d| d.op)) {
                Ok(()) => {}
                Err(ModelError::UndefinedBehavior { executor, reason }) => {
                    warn!("*** UNDEFINED BEHAVIOR DETECTED ***");
                    warn!("thread {executor}: {reason}");
                    warn!("{}", format_transition_stack(&self.sequence));
                    self.violations
                        .record_undefined_behavior(self.trace_id, executor, reason);
                    self.runner.kill();
                    return Ok(TraceOutcome::Fatal);
                }
                Err(e) => return Err(e.into()),
            }
            self.sequence.update_backtrack_sets();
            self.check_data_races(tid);
            self.check_forward_progress();

            match self.sequence.first_enabled_pending() {
                Some(t) => next = t,
                None => break,
            }
        }

        let outcome = if self.sequence.is_in_deadlock() {
            let blocked = self
                .sequence
                .pending_table()
                .map(|(tid, t)| (tid, t.to_string()))
                .collect::<Vec<_>>();
            warn!("*** DEADLOCK DETECTED ***");
            warn!("{}", format_transition_stack(&self.sequence));
            warn!("{}", format_pending_table(&self.sequence));
            self.violations.record_deadlock(self.trace_id, blocked);
            if self.config.checker.stop_at_first_deadlock {
                TraceOutcome::Stop
            } else {
                TraceOutcome::Continue
            }
        } else {
            TraceOutcome::Continue
        };

        self.runner.kill();
        Ok(outcome)
    }

    /// Report races between the executing thread's new pending access
    /// and unordered accesses already in the stack.
    fn check_data_races(&mut self, tid: Tid) {
        let races = self.sequence.data_races_with_pending(tid);
        if races.is_empty() {
            return;
        }
        let Some((addr, _)) = self
            .sequence
            .pending_transition(tid)
            .and_then(|t| t.memory_access())
        else {
            return;
        };
        for i in races {
            let Some(other) = self.sequence.executor_at(i) else {
                continue;
            };
            if self.violations.record_data_race(self.trace_id, addr, other, tid) {
                warn!("*** DATA RACE DETECTED ***");
                warn!(
                    "threads {other} and {tid} access 0x{addr:x} with no ordering between them"
                );
                warn!("{}", format_transition_stack(&self.sequence));
            }
        }
    }

    fn check_forward_progress(&mut self) {
        for thread in self.sequence.forward_progress_violations() {
            let (goal_index, steps) = self
                .sequence
                .thread_data(thread)
                .map(|td| (td.last_goal_index, td.steps_since_goal))
                .unwrap_or((None, 0));
            if self
                .violations
                .record_forward_progress(self.trace_id, thread, goal_index, steps)
            {
                warn!("*** FORWARD PROGRESS VIOLATION DETECTED ***");
                warn!("thread {thread} ran {steps} transitions without reaching a goal");
                warn!("{}", format_transition_stack(&self.sequence));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcmini_runner::scripted::{Op, ScriptedProgram, ScriptedRunner};

    fn explore(program: ScriptedProgram, config: ExplorerConfig) -> ExplorationReport {
        let runner = ScriptedRunner::new(&program);
        let main_handle = runner.main_handle();
        Explorer::new(config, runner, main_handle).run().unwrap()
    }

    #[test]
    fn single_thread_program_explores_once() {
        let program = ScriptedProgram::new(vec![vec![
            Op::MutexInit(0x10),
            Op::MutexLock(0x10),
            Op::MutexUnlock(0x10),
        ]]);
        let report = explore(program, ExplorerConfig::default());
        assert_eq!(report.traces, 1);
        assert!(report.violations.is_empty());
        // start + init + lock + unlock + finish
        assert_eq!(report.transitions, 5);
    }

    #[test]
    fn conflicting_writes_explore_both_orders() {
        let program = ScriptedProgram::new(vec![
            vec![Op::Spawn(1), Op::Spawn(2)],
            vec![Op::Write(0x99)],
            vec![Op::Write(0x99)],
        ]);
        let report = explore(program, ExplorerConfig::default());
        // The write pair is unordered, so at least both of its orders
        // must have been executed, and the race reported exactly once.
        assert!(report.traces >= 2, "explored only {} traces", report.traces);
        assert_eq!(report.data_races(), 1);
        assert_eq!(report.deadlocks(), 0);
    }

    #[test]
    fn independent_writes_explore_one_trace() {
        let program = ScriptedProgram::new(vec![
            vec![Op::Spawn(1), Op::Write(0x11)],
            vec![Op::Write(0x22)],
        ]);
        let report = explore(program, ExplorerConfig::default());
        assert_eq!(report.traces, 1);
        assert!(report.violations.is_empty());
    }

    #[test]
    fn exploration_is_idempotent() {
        let program = ScriptedProgram::new(vec![
            vec![Op::Spawn(1), Op::Write(0x99)],
            vec![Op::Write(0x99)],
        ]);
        let first = explore(program.clone(), ExplorerConfig::default());
        let second = explore(program, ExplorerConfig::default());
        assert_eq!(first.traces, second.traces);
        assert_eq!(first.transitions, second.transitions);
    }

    #[test]
    fn undefined_behavior_halts_exploration() {
        let program = ScriptedProgram::new(vec![vec![
            Op::MutexInit(0x10),
            Op::MutexInit(0x10),
        ]]);
        let report = explore(program, ExplorerConfig::default());
        assert!(report.has_undefined_behavior());
        assert!(report.stopped_early);
    }

    #[test]
    fn max_traces_bounds_exploration() {
        let program = ScriptedProgram::new(vec![
            vec![Op::Spawn(1), Op::Spawn(2), Op::Write(0x99)],
            vec![Op::Write(0x99)],
            vec![Op::Write(0x99)],
        ]);
        let report = explore(
            program,
            ExplorerConfig {
                max_traces: Some(2),
                ..Default::default()
            },
        );
        assert!(report.traces <= 2);
        assert!(report.stopped_early);
    }
}
