//! An in-process runner playing back a scripted program.
//!
//! A [`ScriptedProgram`] describes each thread as a list of high-level
//! operations. The runner lowers them into the same descriptor stream a
//! real intercepted program would produce: blocking primitives become
//! their enqueue/wait transition pairs, and every thread's stream ends
//! with a finish descriptor. Replay after a restart is byte-identical by
//! construction, which is exactly the determinism the engine assumes of
//! real programs.

use crate::{Runner, RunnerError};
use mcmini_model::Tid;
use mcmini_protocol::{Descriptor, WireOp};

/// Base value for fake thread handles; thread `i` gets `HANDLE_BASE + i`.
pub const HANDLE_BASE: u64 = 0x1000;

/// One high-level operation of a scripted thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    MutexInit(u64),
    MutexLock(u64),
    MutexUnlock(u64),
    SemInit(u64, u32),
    SemPost(u64),
    SemWait(u64),
    CondInit(u64),
    CondWait { cond: u64, mutex: u64 },
    CondSignal(u64),
    CondBroadcast(u64),
    BarrierInit { addr: u64, threshold: u32 },
    BarrierWait(u64),
    /// Create the thread at the given index of the program.
    Spawn(usize),
    /// Join the thread at the given index of the program.
    Join(usize),
    Read(u64),
    Write(u64),
    ReachGoal,
    RequestNewGoal,
    EnterGoalCritical,
    ExitGoalCritical,
    Exit(i32),
}

/// A whole program: one op list per thread, index 0 being main.
#[derive(Debug, Clone, Default)]
pub struct ScriptedProgram {
    pub threads: Vec<Vec<Op>>,
}

impl ScriptedProgram {
    pub fn new(threads: Vec<Vec<Op>>) -> Self {
        Self { threads }
    }

    /// The fake system handle of thread `index`.
    pub fn handle(index: usize) -> u64 {
        HANDLE_BASE + index as u64
    }

    /// Lower one thread's ops into its wire-descriptor stream.
    fn lower(ops: &[Op]) -> Vec<WireOp> {
        let mut stream = Vec::with_capacity(ops.len() + 1);
        for op in ops {
            match *op {
                Op::MutexInit(addr) => stream.push(WireOp::MutexInit { addr, attrs: 0 }),
                Op::MutexLock(addr) => stream.push(WireOp::MutexLock { addr }),
                Op::MutexUnlock(addr) => stream.push(WireOp::MutexUnlock { addr }),
                Op::SemInit(addr, initial) => stream.push(WireOp::SemInit { addr, initial }),
                Op::SemPost(addr) => stream.push(WireOp::SemPost { addr }),
                Op::SemWait(addr) => {
                    stream.push(WireOp::SemEnqueue { addr });
                    stream.push(WireOp::SemWait { addr });
                }
                Op::CondInit(addr) => stream.push(WireOp::CondInit { addr }),
                Op::CondWait { cond, mutex } => {
                    stream.push(WireOp::CondEnqueue { cond, mutex });
                    stream.push(WireOp::CondWait { cond, mutex });
                }
                Op::CondSignal(addr) => stream.push(WireOp::CondSignal { addr }),
                Op::CondBroadcast(addr) => stream.push(WireOp::CondBroadcast { addr }),
                Op::BarrierInit { addr, threshold } => {
                    stream.push(WireOp::BarrierInit { addr, threshold })
                }
                Op::BarrierWait(addr) => {
                    stream.push(WireOp::BarrierEnqueue { addr });
                    stream.push(WireOp::BarrierWait { addr });
                }
                Op::Spawn(index) => stream.push(WireOp::ThreadCreate {
                    child_handle: Self::handle(index),
                }),
                Op::Join(index) => stream.push(WireOp::ThreadJoin {
                    target_handle: Self::handle(index),
                }),
                Op::Read(addr) => stream.push(WireOp::GlobalRead { addr }),
                Op::Write(addr) => stream.push(WireOp::GlobalWrite { addr }),
                Op::ReachGoal => stream.push(WireOp::ReachGoal),
                Op::RequestNewGoal => stream.push(WireOp::RequestNewGoal),
                Op::EnterGoalCritical => stream.push(WireOp::EnterGoalCritical),
                Op::ExitGoalCritical => stream.push(WireOp::ExitGoalCritical),
                Op::Exit(code) => stream.push(WireOp::Exit { code }),
            }
        }
        stream.push(WireOp::ThreadFinish);
        stream
    }
}

/// Deterministic in-process [`Runner`] over a [`ScriptedProgram`].
pub struct ScriptedRunner {
    streams: Vec<Vec<WireOp>>,
    cursors: Vec<usize>,
    started: bool,
}

impl ScriptedRunner {
    pub fn new(program: &ScriptedProgram) -> Self {
        let streams = program
            .threads
            .iter()
            .map(|ops| ScriptedProgram::lower(ops))
            .collect::<Vec<_>>();
        let cursors = vec![0; streams.len()];
        Self {
            streams,
            cursors,
            started: false,
        }
    }

    /// The main thread's fake handle, for seeding the state sequence.
    pub fn main_handle(&self) -> u64 {
        ScriptedProgram::handle(0)
    }
}

impl Runner for ScriptedRunner {
    fn start(&mut self) -> Result<(), RunnerError> {
        for cursor in &mut self.cursors {
            *cursor = 0;
        }
        self.started = true;
        Ok(())
    }

    fn advance(&mut self, tid: Tid) -> Result<Descriptor, RunnerError> {
        if !self.started {
            return Err(RunnerError::NotStarted);
        }
        let index = tid as usize;
        let stream = self
            .streams
            .get(index)
            .ok_or(RunnerError::ScriptExhausted(tid))?;
        let cursor = self.cursors[index];
        let op = *stream
            .get(cursor)
            .ok_or(RunnerError::ScriptExhausted(tid))?;
        self.cursors[index] = cursor + 1;
        Ok(Descriptor {
            executor: tid,
            op,
        })
    }

    fn release(&mut self, tid: Tid) -> Result<(), RunnerError> {
        if !self.started {
            return Err(RunnerError::NotStarted);
        }
        let _ = tid;
        Ok(())
    }

    fn kill(&mut self) {
        self.started = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocking_ops_lower_to_enqueue_wait_pairs() {
        let stream = ScriptedProgram::lower(&[Op::SemWait(0x10), Op::BarrierWait(0x20)]);
        assert_eq!(
            stream,
            vec![
                WireOp::SemEnqueue { addr: 0x10 },
                WireOp::SemWait { addr: 0x10 },
                WireOp::BarrierEnqueue { addr: 0x20 },
                WireOp::BarrierWait { addr: 0x20 },
                WireOp::ThreadFinish,
            ]
        );
    }

    #[test]
    fn every_stream_ends_with_finish() {
        let stream = ScriptedProgram::lower(&[]);
        assert_eq!(stream, vec![WireOp::ThreadFinish]);
    }

    #[test]
    fn advance_walks_the_stream_in_order() {
        let program = ScriptedProgram::new(vec![vec![Op::MutexInit(0x10), Op::MutexLock(0x10)]]);
        let mut runner = ScriptedRunner::new(&program);
        runner.start().unwrap();

        assert_eq!(
            runner.advance(0).unwrap().op,
            WireOp::MutexInit { addr: 0x10, attrs: 0 }
        );
        assert_eq!(
            runner.advance(0).unwrap().op,
            WireOp::MutexLock { addr: 0x10 }
        );
        assert_eq!(runner.advance(0).unwrap().op, WireOp::ThreadFinish);
        assert!(matches!(
            runner.advance(0),
            Err(RunnerError::ScriptExhausted(0))
        ));
    }

    #[test]
    fn restart_replays_identically() {
        let program = ScriptedProgram::new(vec![
            vec![Op::Spawn(1), Op::Join(1)],
            vec![Op::Write(0x99)],
        ]);
        let mut runner = ScriptedRunner::new(&program);
        runner.start().unwrap();
        let first: Vec<_> = (0..3).map(|_| runner.advance(0).unwrap().op).collect();

        runner.start().unwrap();
        let second: Vec<_> = (0..3).map(|_| runner.advance(0).unwrap().op).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn advance_before_start_is_rejected() {
        let program = ScriptedProgram::new(vec![vec![]]);
        let mut runner = ScriptedRunner::new(&program);
        assert!(matches!(runner.advance(0), Err(RunnerError::NotStarted)));
    }
}
