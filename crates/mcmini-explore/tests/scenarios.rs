//! End-to-end checking scenarios driven through the scripted runner.

use mcmini_explore::engine::{ExplorationReport, Explorer, ExplorerConfig};
use mcmini_model::config::CheckerConfig;
use mcmini_runner::scripted::{Op, ScriptedProgram, ScriptedRunner};

fn explore(program: ScriptedProgram, config: ExplorerConfig) -> ExplorationReport {
    let runner = ScriptedRunner::new(&program);
    let main_handle = runner.main_handle();
    Explorer::new(config, runner, main_handle).run().unwrap()
}

fn stop_at_first_deadlock() -> ExplorerConfig {
    ExplorerConfig {
        checker: CheckerConfig {
            stop_at_first_deadlock: true,
            ..Default::default()
        },
        ..Default::default()
    }
}

const M1: u64 = 0x100;
const M2: u64 = 0x200;
const SEM: u64 = 0x300;
const COND: u64 = 0x400;
const BARRIER: u64 = 0x500;
const CELL: u64 = 0x600;

/// Two threads acquire two mutexes in opposite orders.
fn lock_ordering_program() -> ScriptedProgram {
    ScriptedProgram::new(vec![
        vec![
            Op::MutexInit(M1),
            Op::MutexInit(M2),
            Op::Spawn(1),
            Op::Spawn(2),
            Op::Join(1),
            Op::Join(2),
        ],
        vec![
            Op::MutexLock(M1),
            Op::MutexLock(M2),
            Op::MutexUnlock(M2),
            Op::MutexUnlock(M1),
        ],
        vec![
            Op::MutexLock(M2),
            Op::MutexLock(M1),
            Op::MutexUnlock(M1),
            Op::MutexUnlock(M2),
        ],
    ])
}

#[test]
fn lock_ordering_deadlocks() {
    let report = explore(lock_ordering_program(), ExplorerConfig::default());
    assert!(
        report.deadlocks() >= 1,
        "no deadlocking schedule found in {} traces",
        report.traces
    );
    assert!(!report.has_undefined_behavior());
}

#[test]
fn lock_ordering_stops_at_first_deadlock() {
    let report = explore(lock_ordering_program(), stop_at_first_deadlock());
    assert_eq!(report.deadlocks(), 1);
    assert!(report.stopped_early);
}

/// Workers lock, post a semaphore, and wait on a condition variable;
/// main consumes `waits` posts, then broadcasts under the lock.
fn producer_consumer_program(workers: usize, waits: usize) -> ScriptedProgram {
    let mut main = vec![Op::MutexInit(M1), Op::SemInit(SEM, 0), Op::CondInit(COND)];
    for i in 1..=workers {
        main.push(Op::Spawn(i));
    }
    for _ in 0..waits {
        main.push(Op::SemWait(SEM));
    }
    main.push(Op::MutexLock(M1));
    main.push(Op::CondBroadcast(COND));
    main.push(Op::MutexUnlock(M1));
    for i in 1..=workers {
        main.push(Op::Join(i));
    }

    let worker = vec![
        Op::MutexLock(M1),
        Op::SemPost(SEM),
        Op::CondWait {
            cond: COND,
            mutex: M1,
        },
        Op::MutexUnlock(M1),
    ];
    let mut threads = vec![main];
    threads.extend(std::iter::repeat(worker).take(workers));
    ScriptedProgram::new(threads)
}

#[test]
fn producer_consumer_with_enough_waits_never_deadlocks() {
    // A broadcast can only run once every poster has parked on the
    // condition variable, so no wakeup is ever lost.
    let report = explore(producer_consumer_program(3, 3), ExplorerConfig::default());
    assert_eq!(report.deadlocks(), 0, "after {} traces", report.traces);
    assert!(!report.has_undefined_behavior());
}

#[test]
fn producer_consumer_with_one_missing_wait_deadlocks() {
    // With one fewer consume, the broadcast can fire before the last
    // worker parks; that worker then sleeps forever and the final join
    // hangs.
    let report = explore(producer_consumer_program(5, 4), stop_at_first_deadlock());
    assert_eq!(report.deadlocks(), 1);
}

/// `participants` threads (main included) wait on one barrier.
fn barrier_program(participants: usize, threshold: u32) -> ScriptedProgram {
    let mut main = vec![Op::BarrierInit {
        addr: BARRIER,
        threshold,
    }];
    for i in 1..participants {
        main.push(Op::Spawn(i));
    }
    main.push(Op::BarrierWait(BARRIER));
    for i in 1..participants {
        main.push(Op::Join(i));
    }
    let mut threads = vec![main];
    threads.extend(std::iter::repeat(vec![Op::BarrierWait(BARRIER)]).take(participants - 1));
    ScriptedProgram::new(threads)
}

#[test]
fn full_barrier_releases_everyone() {
    let report = explore(barrier_program(3, 3), ExplorerConfig::default());
    assert_eq!(report.deadlocks(), 0, "after {} traces", report.traces);
}

#[test]
fn short_barrier_deadlocks_with_all_threads_enqueued() {
    // Five arrivals can never satisfy a threshold of six.
    let report = explore(barrier_program(5, 6), stop_at_first_deadlock());
    assert_eq!(report.deadlocks(), 1);
}

#[test]
fn unsynchronized_writes_race_exactly_once_per_pair() {
    let program = ScriptedProgram::new(vec![
        vec![Op::Spawn(1), Op::Spawn(2), Op::Join(1), Op::Join(2)],
        vec![Op::Write(CELL)],
        vec![Op::Write(CELL)],
    ]);
    let report = explore(program, ExplorerConfig::default());
    // Both orders of the write pair are explored, but the unordered
    // pair is reported once.
    assert_eq!(report.data_races(), 1);
    assert!(report.traces >= 2);
}

#[test]
fn goalless_thread_starves_while_the_other_progresses() {
    let mut spinner = vec![Op::Spawn(1)];
    for i in 0..9 {
        spinner.push(Op::Write(CELL + 0x10 + i));
    }
    let program = ScriptedProgram::new(vec![
        spinner,
        vec![Op::ReachGoal, Op::ReachGoal],
    ]);
    let report = explore(
        program,
        ExplorerConfig {
            checker: CheckerConfig {
                extra_liveness_transitions: Some(8),
                ..Default::default()
            },
            ..Default::default()
        },
    );
    assert!(report.forward_progress_violations() >= 1);
}

#[test]
fn depth_cap_bounds_exploration_without_false_deadlocks() {
    let program = ScriptedProgram::new(vec![
        vec![Op::Spawn(1), Op::Write(CELL), Op::Write(CELL), Op::Write(CELL)],
        vec![Op::Write(CELL), Op::Write(CELL), Op::Write(CELL)],
    ]);
    let report = explore(
        program,
        ExplorerConfig {
            checker: CheckerConfig {
                max_thread_execution_depth: Some(2),
                ..Default::default()
            },
            ..Default::default()
        },
    );
    assert_eq!(report.deadlocks(), 0);
    assert!(!report.has_undefined_behavior());
}

#[test]
fn repeated_exploration_is_idempotent() {
    let program = lock_ordering_program();
    let first = explore(program.clone(), ExplorerConfig::default());
    let second = explore(program, ExplorerConfig::default());
    assert_eq!(first.traces, second.traces);
    assert_eq!(first.transitions, second.transitions);
    assert_eq!(first.deadlocks(), second.deadlocks());
}
