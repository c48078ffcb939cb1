//! Visible-object state variants.
//!
//! The checker only ever sees a visible object through a sequence of these
//! immutable snapshots; transitions append new snapshots rather than
//! mutating in place.

use crate::Tid;
use std::collections::VecDeque;
use std::fmt;

/// Lock state of a mutex shadow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexStatus {
    Unlocked,
    Locked,
}

/// Lifecycle of a thread shadow.
///
/// `Embryo` is created-but-not-started; `Sleeping` is parked on a
/// condition variable between enqueue and wakeup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadLifecycle {
    Embryo,
    Alive,
    Sleeping,
    Dead,
}

impl ThreadLifecycle {
    /// Whether the thread still participates in scheduling.
    pub fn is_live(self) -> bool {
        !matches!(self, ThreadLifecycle::Dead)
    }
}

/// One snapshot of a visible object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VisibleObjectState {
    Mutex {
        status: MutexStatus,
        owner: Option<Tid>,
    },
    Semaphore {
        count: u32,
        waiting: VecDeque<Tid>,
    },
    Condvar {
        waiting: VecDeque<Tid>,
        /// Threads released by a signal/broadcast but not yet reacquired
        /// their mutex.
        wakeable: Vec<Tid>,
    },
    Barrier {
        threshold: u32,
        arrived: Vec<Tid>,
    },
    Thread {
        lifecycle: ThreadLifecycle,
        handle: u64,
    },
    /// A plain shared-memory cell accessed by global reads/writes. Only
    /// the version counter is modeled; values are invisible to the
    /// checker.
    GlobalCell { version: u64 },
}

impl VisibleObjectState {
    pub fn unlocked_mutex() -> Self {
        VisibleObjectState::Mutex {
            status: MutexStatus::Unlocked,
            owner: None,
        }
    }

    pub fn locked_mutex(owner: Tid) -> Self {
        VisibleObjectState::Mutex {
            status: MutexStatus::Locked,
            owner: Some(owner),
        }
    }

    pub fn semaphore(count: u32) -> Self {
        VisibleObjectState::Semaphore {
            count,
            waiting: VecDeque::new(),
        }
    }

    pub fn condvar() -> Self {
        VisibleObjectState::Condvar {
            waiting: VecDeque::new(),
            wakeable: Vec::new(),
        }
    }

    pub fn barrier(threshold: u32) -> Self {
        VisibleObjectState::Barrier {
            threshold,
            arrived: Vec::new(),
        }
    }

    pub fn thread(lifecycle: ThreadLifecycle, handle: u64) -> Self {
        VisibleObjectState::Thread { lifecycle, handle }
    }

    /// The lifecycle if this snapshot is a thread.
    pub fn thread_lifecycle(&self) -> Option<ThreadLifecycle> {
        match self {
            VisibleObjectState::Thread { lifecycle, .. } => Some(*lifecycle),
            _ => None,
        }
    }
}

impl fmt::Display for VisibleObjectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VisibleObjectState::Mutex { status, owner } => match (status, owner) {
                (MutexStatus::Locked, Some(t)) => write!(f, "mutex(locked by {t})"),
                _ => write!(f, "mutex(unlocked)"),
            },
            VisibleObjectState::Semaphore { count, waiting } => {
                write!(f, "semaphore(count {count}, {} waiting)", waiting.len())
            }
            VisibleObjectState::Condvar { waiting, wakeable } => write!(
                f,
                "condvar({} waiting, {} wakeable)",
                waiting.len(),
                wakeable.len()
            ),
            VisibleObjectState::Barrier { threshold, arrived } => {
                write!(f, "barrier({}/{threshold})", arrived.len())
            }
            VisibleObjectState::Thread { lifecycle, .. } => write!(f, "thread({lifecycle:?})"),
            VisibleObjectState::GlobalCell { version } => write!(f, "global(v{version})"),
        }
    }
}
