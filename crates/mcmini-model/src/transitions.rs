//! The visible-transition algebra.
//!
//! Every transition kind carries three judgments used by the exploration
//! engine: `enabled_in` (may it run from a state), `coenabled_with` (is
//! there any single state enabling both), and `dependent_with` (do they
//! conflict). Application is `modify`, which appends new snapshots to the
//! object store and reports success, disabledness, or undefined behavior.
//!
//! Blocking primitives are split in two: `sem_wait`, `cond_wait`, and
//! `barrier_wait` each consist of an always-enabled enqueue transition
//! followed by a wait transition that only becomes enabled once the
//! object state releases the thread.

use crate::objects::{MutexStatus, ThreadLifecycle, VisibleObjectState};
use crate::store::{ObjectKey, StoreView, VisibleObjectStore};
use crate::{ModelError, Tid};
use mcmini_protocol::WireOp;
use std::collections::HashMap;
use std::fmt;

/// Outcome of applying a transition to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyStatus {
    /// The resulting state exists; the transition took effect.
    Exists,
    /// The transition turned out not to be applicable.
    Disabled,
    /// The program performed an operation with undefined semantics.
    UndefinedBehavior(String),
}

/// The tagged union of visible operations, with raw addresses resolved
/// lazily against the store and thread handles resolved to dense ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionKind {
    /// Synthetic first transition of every thread.
    ThreadStart,
    ThreadFinish,
    ThreadCreate {
        child_handle: u64,
        /// Dense id of the created thread; assigned when the transition
        /// is applied.
        child: Option<Tid>,
    },
    ThreadJoin {
        target: Tid,
    },
    Exit {
        code: i32,
    },
    MutexInit { addr: u64 },
    MutexLock { addr: u64 },
    MutexUnlock { addr: u64 },
    SemInit { addr: u64, initial: u32 },
    SemPost { addr: u64 },
    SemEnqueue { addr: u64 },
    SemWait { addr: u64 },
    CondInit { addr: u64 },
    CondEnqueue { cond: u64, mutex: u64 },
    CondWait { cond: u64, mutex: u64 },
    CondSignal { addr: u64 },
    CondBroadcast { addr: u64 },
    BarrierInit { addr: u64, threshold: u32 },
    BarrierEnqueue { addr: u64 },
    BarrierWait { addr: u64 },
    GlobalRead { addr: u64 },
    GlobalWrite { addr: u64 },
    ReachGoal,
    RequestNewGoal,
    EnterGoalCritical,
    ExitGoalCritical,
}

/// A visible transition: who executes what.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub executor: Tid,
    pub kind: TransitionKind,
}

/// Resource families used for conflict detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Mutex,
    Sem,
    Cond,
    Barrier,
    Global,
    Thread,
}

/// (family, key, mutates) triple; at most two per transition.
type Footprint = [Option<(Family, u64, bool)>; 2];

impl Transition {
    pub fn new(executor: Tid, kind: TransitionKind) -> Self {
        Self { executor, kind }
    }

    /// Build a transition from a wire descriptor, resolving thread
    /// handles against the ids already known to the sequence.
    pub fn from_wire(
        executor: Tid,
        op: WireOp,
        handles: &HashMap<u64, Tid>,
    ) -> Result<Transition, ModelError> {
        let kind = match op {
            WireOp::ThreadFinish => TransitionKind::ThreadFinish,
            WireOp::ThreadCreate { child_handle } => TransitionKind::ThreadCreate {
                child_handle,
                child: None,
            },
            WireOp::ThreadJoin { target_handle } => TransitionKind::ThreadJoin {
                target: *handles
                    .get(&target_handle)
                    .ok_or(ModelError::UnknownThreadHandle(target_handle))?,
            },
            WireOp::Exit { code } => TransitionKind::Exit { code },
            WireOp::MutexInit { addr, .. } => TransitionKind::MutexInit { addr },
            WireOp::MutexLock { addr } => TransitionKind::MutexLock { addr },
            WireOp::MutexUnlock { addr } => TransitionKind::MutexUnlock { addr },
            WireOp::SemInit { addr, initial } => TransitionKind::SemInit { addr, initial },
            WireOp::SemPost { addr } => TransitionKind::SemPost { addr },
            WireOp::SemEnqueue { addr } => TransitionKind::SemEnqueue { addr },
            WireOp::SemWait { addr } => TransitionKind::SemWait { addr },
            WireOp::CondInit { addr } => TransitionKind::CondInit { addr },
            WireOp::CondEnqueue { cond, mutex } => TransitionKind::CondEnqueue { cond, mutex },
            WireOp::CondWait { cond, mutex } => TransitionKind::CondWait { cond, mutex },
            WireOp::CondSignal { addr } => TransitionKind::CondSignal { addr },
            WireOp::CondBroadcast { addr } => TransitionKind::CondBroadcast { addr },
            WireOp::BarrierInit { addr, threshold } => {
                TransitionKind::BarrierInit { addr, threshold }
            }
            WireOp::BarrierEnqueue { addr } => TransitionKind::BarrierEnqueue { addr },
            WireOp::BarrierWait { addr } => TransitionKind::BarrierWait { addr },
            WireOp::GlobalRead { addr } => TransitionKind::GlobalRead { addr },
            WireOp::GlobalWrite { addr } => TransitionKind::GlobalWrite { addr },
            WireOp::ReachGoal => TransitionKind::ReachGoal,
            WireOp::RequestNewGoal => TransitionKind::RequestNewGoal,
            WireOp::EnterGoalCritical => TransitionKind::EnterGoalCritical,
            WireOp::ExitGoalCritical => TransitionKind::ExitGoalCritical,
        };
        Ok(Transition::new(executor, kind))
    }

    /// Whether the transition may run from the given state.
    pub fn enabled_in(&self, view: &StoreView<'_>) -> bool {
        use TransitionKind::*;
        match &self.kind {
            ThreadStart => matches!(
                view.thread_state(self.executor).and_then(|s| s.thread_lifecycle()),
                Some(ThreadLifecycle::Embryo)
            ),
            ThreadJoin { target } => matches!(
                view.thread_state(*target).and_then(|s| s.thread_lifecycle()),
                Some(ThreadLifecycle::Dead)
            ),
            MutexLock { addr } => matches!(
                view.state_at_addr(*addr),
                Some(VisibleObjectState::Mutex {
                    status: MutexStatus::Unlocked,
                    ..
                })
            ),
            MutexUnlock { addr } => view.state_at_addr(*addr).is_some(),
            SemPost { addr } | SemEnqueue { addr } => view.state_at_addr(*addr).is_some(),
            SemWait { addr } => match view.state_at_addr(*addr) {
                Some(VisibleObjectState::Semaphore { count, waiting }) => {
                    *count > 0 && waiting.front() == Some(&self.executor)
                }
                _ => false,
            },
            CondEnqueue { cond, mutex } => {
                view.state_at_addr(*cond).is_some() && view.state_at_addr(*mutex).is_some()
            }
            CondWait { cond, mutex } => {
                let released = match view.state_at_addr(*cond) {
                    Some(VisibleObjectState::Condvar { wakeable, .. }) => {
                        wakeable.contains(&self.executor)
                    }
                    _ => false,
                };
                let reacquirable = matches!(
                    view.state_at_addr(*mutex),
                    Some(VisibleObjectState::Mutex {
                        status: MutexStatus::Unlocked,
                        ..
                    })
                );
                released && reacquirable
            }
            CondSignal { addr } | CondBroadcast { addr } => view.state_at_addr(*addr).is_some(),
            BarrierEnqueue { addr } => view.state_at_addr(*addr).is_some(),
            BarrierWait { addr } => match view.state_at_addr(*addr) {
                Some(VisibleObjectState::Barrier { threshold, arrived }) => {
                    arrived.len() as u32 >= *threshold
                }
                _ => false,
            },
            // Inits, lifecycle ends, memory accesses, and goal markers
            // run from any state.
            _ => true,
        }
    }

    /// Apply the transition to the store.
    pub fn modify(&self, store: &mut VisibleObjectStore) -> Result<ApplyStatus, ModelError> {
        use TransitionKind::*;
        let me = self.executor;
        match &self.kind {
            ThreadStart => {
                let Some(id) = store.thread_object(me) else {
                    return Ok(ApplyStatus::Disabled);
                };
                let handle = match store.current(id)? {
                    VisibleObjectState::Thread { handle, .. } => *handle,
                    _ => return Err(ModelError::InvalidState("thread object of wrong kind")),
                };
                store.record(id, VisibleObjectState::thread(ThreadLifecycle::Alive, handle))?;
            }
            ThreadFinish => {
                let Some(id) = store.thread_object(me) else {
                    return Ok(ApplyStatus::Disabled);
                };
                let handle = match store.current(id)? {
                    VisibleObjectState::Thread { handle, .. } => *handle,
                    _ => return Err(ModelError::InvalidState("thread object of wrong kind")),
                };
                store.record(id, VisibleObjectState::thread(ThreadLifecycle::Dead, handle))?;
            }
            ThreadCreate {
                child_handle,
                child,
            } => {
                let Some(child) = child else {
                    return Err(ModelError::InvalidState(
                        "thread_create applied before child id assignment",
                    ));
                };
                store.track(
                    ObjectKey::Thread(*child),
                    VisibleObjectState::thread(ThreadLifecycle::Embryo, *child_handle),
                );
            }
            ThreadJoin { .. } => {}
            Exit { .. } => {
                for tid in store.thread_ids() {
                    let Some(id) = store.thread_object(tid) else {
                        continue;
                    };
                    let handle = match store.current(id)? {
                        VisibleObjectState::Thread { handle, .. } => *handle,
                        _ => continue,
                    };
                    store.record(id, VisibleObjectState::thread(ThreadLifecycle::Dead, handle))?;
                }
            }
            MutexInit { addr } => {
                if store.object_at_addr(*addr).is_some() {
                    return Ok(ApplyStatus::UndefinedBehavior(format!(
                        "mutex at 0x{addr:x} initialized twice"
                    )));
                }
                store.track(ObjectKey::Addr(*addr), VisibleObjectState::unlocked_mutex());
            }
            MutexLock { addr } => {
                let Some(id) = store.object_at_addr(*addr) else {
                    return Ok(ApplyStatus::Disabled);
                };
                store.record(id, VisibleObjectState::locked_mutex(me))?;
            }
            MutexUnlock { addr } => {
                let Some(id) = store.object_at_addr(*addr) else {
                    return Ok(ApplyStatus::Disabled);
                };
                match store.current(id)? {
                    VisibleObjectState::Mutex {
                        status: MutexStatus::Locked,
                        owner: Some(owner),
                    } if *owner == me => {
                        store.record(id, VisibleObjectState::unlocked_mutex())?;
                    }
                    VisibleObjectState::Mutex { .. } => {
                        return Ok(ApplyStatus::UndefinedBehavior(format!(
                            "thread {me} unlocked mutex 0x{addr:x} it does not own"
                        )));
                    }
                    _ => return Err(ModelError::InvalidState("mutex object of wrong kind")),
                }
            }
            SemInit { addr, initial } => {
                if store.object_at_addr(*addr).is_some() {
                    return Ok(ApplyStatus::UndefinedBehavior(format!(
                        "semaphore at 0x{addr:x} initialized twice"
                    )));
                }
                store.track(ObjectKey::Addr(*addr), VisibleObjectState::semaphore(*initial));
            }
            SemPost { addr } => {
                let Some(id) = store.object_at_addr(*addr) else {
                    return Ok(ApplyStatus::Disabled);
                };
                match store.current(id)? {
                    VisibleObjectState::Semaphore { count, waiting } => {
                        let next = VisibleObjectState::Semaphore {
                            count: count + 1,
                            waiting: waiting.clone(),
                        };
                        store.record(id, next)?;
                    }
                    _ => return Err(ModelError::InvalidState("semaphore object of wrong kind")),
                }
            }
            SemEnqueue { addr } => {
                let Some(id) = store.object_at_addr(*addr) else {
                    return Ok(ApplyStatus::Disabled);
                };
                match store.current(id)? {
                    VisibleObjectState::Semaphore { count, waiting } => {
                        let mut waiting = waiting.clone();
                        waiting.push_back(me);
                        store.record(
                            id,
                            VisibleObjectState::Semaphore {
                                count: *count,
                                waiting,
                            },
                        )?;
                    }
                    _ => return Err(ModelError::InvalidState("semaphore object of wrong kind")),
                }
            }
            SemWait { addr } => {
                let Some(id) = store.object_at_addr(*addr) else {
                    return Ok(ApplyStatus::Disabled);
                };
                match store.current(id)? {
                    VisibleObjectState::Semaphore { count, waiting }
                        if *count > 0 && waiting.front() == Some(&me) =>
                    {
                        let mut waiting = waiting.clone();
                        waiting.pop_front();
                        store.record(
                            id,
                            VisibleObjectState::Semaphore {
                                count: count - 1,
                                waiting,
                            },
                        )?;
                    }
                    VisibleObjectState::Semaphore { .. } => return Ok(ApplyStatus::Disabled),
                    _ => return Err(ModelError::InvalidState("semaphore object of wrong kind")),
                }
            }
            CondInit { addr } => {
                if store.object_at_addr(*addr).is_some() {
                    return Ok(ApplyStatus::UndefinedBehavior(format!(
                        "condition variable at 0x{addr:x} initialized twice"
                    )));
                }
                store.track(ObjectKey::Addr(*addr), VisibleObjectState::condvar());
            }
            CondEnqueue { cond, mutex } => {
                let (Some(cid), Some(mid)) =
                    (store.object_at_addr(*cond), store.object_at_addr(*mutex))
                else {
                    return Ok(ApplyStatus::Disabled);
                };
                match store.current(mid)? {
                    VisibleObjectState::Mutex {
                        status: MutexStatus::Locked,
                        owner: Some(owner),
                    } if *owner == me => {}
                    _ => {
                        return Ok(ApplyStatus::UndefinedBehavior(format!(
                            "thread {me} waits on condvar 0x{cond:x} without holding mutex 0x{mutex:x}"
                        )));
                    }
                }
                store.record(mid, VisibleObjectState::unlocked_mutex())?;
                match store.current(cid)? {
                    VisibleObjectState::Condvar { waiting, wakeable } => {
                        let mut waiting = waiting.clone();
                        let wakeable = wakeable.clone();
                        waiting.push_back(me);
                        store.record(cid, VisibleObjectState::Condvar { waiting, wakeable })?;
                    }
                    _ => return Err(ModelError::InvalidState("condvar object of wrong kind")),
                }
                if let Some(tid_obj) = store.thread_object(me) {
                    let handle = match store.current(tid_obj)? {
                        VisibleObjectState::Thread { handle, .. } => *handle,
                        _ => 0,
                    };
                    store.record(
                        tid_obj,
                        VisibleObjectState::thread(ThreadLifecycle::Sleeping, handle),
                    )?;
                }
            }
            CondWait { cond, mutex } => {
                let (Some(cid), Some(mid)) =
                    (store.object_at_addr(*cond), store.object_at_addr(*mutex))
                else {
                    return Ok(ApplyStatus::Disabled);
                };
                match store.current(cid)? {
                    VisibleObjectState::Condvar { waiting, wakeable } => {
                        let waiting = waiting.clone();
                        let mut wakeable = wakeable.clone();
                        wakeable.retain(|t| *t != me);
                        store.record(cid, VisibleObjectState::Condvar { waiting, wakeable })?;
                    }
                    _ => return Err(ModelError::InvalidState("condvar object of wrong kind")),
                }
                store.record(mid, VisibleObjectState::locked_mutex(me))?;
                if let Some(tid_obj) = store.thread_object(me) {
                    let handle = match store.current(tid_obj)? {
                        VisibleObjectState::Thread { handle, .. } => *handle,
                        _ => 0,
                    };
                    store.record(
                        tid_obj,
                        VisibleObjectState::thread(ThreadLifecycle::Alive, handle),
                    )?;
                }
            }
            CondSignal { addr } => {
                let Some(id) = store.object_at_addr(*addr) else {
                    return Ok(ApplyStatus::Disabled);
                };
                match store.current(id)? {
                    VisibleObjectState::Condvar { waiting, wakeable } => {
                        let mut waiting = waiting.clone();
                        let mut wakeable = wakeable.clone();
                        if let Some(first) = waiting.pop_front() {
                            wakeable.push(first);
                        }
                        store.record(id, VisibleObjectState::Condvar { waiting, wakeable })?;
                    }
                    _ => return Err(ModelError::InvalidState("condvar object of wrong kind")),
                }
            }
            CondBroadcast { addr } => {
                let Some(id) = store.object_at_addr(*addr) else {
                    return Ok(ApplyStatus::Disabled);
                };
                match store.current(id)? {
                    VisibleObjectState::Condvar { waiting, wakeable } => {
                        let mut wakeable = wakeable.clone();
                        wakeable.extend(waiting.iter().copied());
                        store.record(
                            id,
                            VisibleObjectState::Condvar {
                                waiting: Default::default(),
                                wakeable,
                            },
                        )?;
                    }
                    _ => return Err(ModelError::InvalidState("condvar object of wrong kind")),
                }
            }
            BarrierInit { addr, threshold } => {
                if store.object_at_addr(*addr).is_some() {
                    return Ok(ApplyStatus::UndefinedBehavior(format!(
                        "barrier at 0x{addr:x} initialized twice"
                    )));
                }
                store.track(ObjectKey::Addr(*addr), VisibleObjectState::barrier(*threshold));
            }
            BarrierEnqueue { addr } => {
                let Some(id) = store.object_at_addr(*addr) else {
                    return Ok(ApplyStatus::Disabled);
                };
                match store.current(id)? {
                    VisibleObjectState::Barrier { threshold, arrived } => {
                        let mut arrived = arrived.clone();
                        arrived.push(me);
                        store.record(
                            id,
                            VisibleObjectState::Barrier {
                                threshold: *threshold,
                                arrived,
                            },
                        )?;
                    }
                    _ => return Err(ModelError::InvalidState("barrier object of wrong kind")),
                }
            }
            BarrierWait { .. } => {}
            GlobalRead { addr } => {
                if store.object_at_addr(*addr).is_none() {
                    store.track(
                        ObjectKey::Addr(*addr),
                        VisibleObjectState::GlobalCell { version: 0 },
                    );
                }
            }
            GlobalWrite { addr } => {
                let id = match store.object_at_addr(*addr) {
                    Some(id) => id,
                    None => store.track(
                        ObjectKey::Addr(*addr),
                        VisibleObjectState::GlobalCell { version: 0 },
                    ),
                };
                match store.current(id)? {
                    VisibleObjectState::GlobalCell { version } => {
                        let next = VisibleObjectState::GlobalCell {
                            version: version + 1,
                        };
                        store.record(id, next)?;
                    }
                    _ => return Err(ModelError::InvalidState("global cell of wrong kind")),
                }
            }
            ReachGoal | RequestNewGoal | EnterGoalCritical | ExitGoalCritical => {}
        }
        Ok(ApplyStatus::Exists)
    }

    /// Whether two transitions could be enabled from one common state.
    ///
    /// Lock and unlock of one mutex need opposite lock states, so they
    /// are never co-enabled. Two locks of the same mutex are: any state
    /// with the mutex unlocked enables both. A wait on a semaphore is
    /// only enabled once the post it consumes has retired, so a wait
    /// and a post on one semaphore are never co-enabled either.
    pub fn coenabled_with(&self, other: &Transition) -> bool {
        use TransitionKind::*;
        if self.executor == other.executor {
            return false;
        }
        match (&self.kind, &other.kind) {
            (MutexLock { addr: a }, MutexUnlock { addr: b })
            | (MutexUnlock { addr: a }, MutexLock { addr: b })
            | (SemWait { addr: a }, SemPost { addr: b })
            | (SemPost { addr: a }, SemWait { addr: b }) => a != b,
            _ => true,
        }
    }

    /// Whether two transitions conflict in the DPOR sense.
    pub fn dependent_with(&self, other: &Transition) -> bool {
        use TransitionKind::*;
        if self.executor == other.executor {
            return true;
        }
        // Process exit tears down every thread.
        if matches!(self.kind, Exit { .. }) || matches!(other.kind, Exit { .. }) {
            return true;
        }
        // Creation orders the child's whole existence.
        if let ThreadCreate { child: Some(c), .. } = self.kind {
            if other.executor == c {
                return true;
            }
        }
        if let ThreadCreate { child: Some(c), .. } = other.kind {
            if self.executor == c {
                return true;
            }
        }
        let a = self.footprint();
        let b = other.footprint();
        for &(fam_a, key_a, mut_a) in a.iter().flatten() {
            for &(fam_b, key_b, mut_b) in b.iter().flatten() {
                if fam_a == fam_b && key_a == key_b && (mut_a || mut_b) {
                    return true;
                }
            }
        }
        false
    }

    /// Resources touched, with a mutation flag. Reads of the same global
    /// cell are the one independent same-object pair.
    fn footprint(&self) -> Footprint {
        use TransitionKind::*;
        let me = self.executor as u64;
        match &self.kind {
            ThreadStart | ThreadFinish => [Some((Family::Thread, me, true)), None],
            ThreadCreate { child, .. } => [
                child.map(|c| (Family::Thread, c as u64, true)),
                None,
            ],
            ThreadJoin { target } => [Some((Family::Thread, *target as u64, false)), None],
            Exit { .. } => [None, None],
            MutexInit { addr } | MutexLock { addr } | MutexUnlock { addr } => {
                [Some((Family::Mutex, *addr, true)), None]
            }
            SemInit { addr, .. } | SemPost { addr } | SemEnqueue { addr } | SemWait { addr } => {
                [Some((Family::Sem, *addr, true)), None]
            }
            CondInit { addr } | CondSignal { addr } | CondBroadcast { addr } => {
                [Some((Family::Cond, *addr, true)), None]
            }
            CondEnqueue { cond, mutex } | CondWait { cond, mutex } => [
                Some((Family::Cond, *cond, true)),
                Some((Family::Mutex, *mutex, true)),
            ],
            BarrierInit { addr, .. } | BarrierEnqueue { addr } => {
                [Some((Family::Barrier, *addr, true)), None]
            }
            BarrierWait { addr } => [Some((Family::Barrier, *addr, false)), None],
            GlobalRead { addr } => [Some((Family::Global, *addr, false)), None],
            GlobalWrite { addr } => [Some((Family::Global, *addr, true)), None],
            ReachGoal | RequestNewGoal | EnterGoalCritical | ExitGoalCritical => [None, None],
        }
    }

    /// Whether the inverse of this transition is a pure function of the
    /// transition and the store right after it.
    pub fn is_reversible(&self) -> bool {
        !matches!(self.kind, TransitionKind::ThreadCreate { .. })
    }

    /// Whether this step counts against the per-thread execution-depth
    /// cap. Lifecycle bookends do not.
    pub fn counts_against_depth(&self) -> bool {
        !matches!(
            self.kind,
            TransitionKind::ThreadStart | TransitionKind::ThreadFinish
        )
    }

    /// Whether the runner thread ceases to exist after this step.
    pub fn ends_thread(&self) -> bool {
        matches!(
            self.kind,
            TransitionKind::ThreadFinish | TransitionKind::Exit { .. }
        )
    }

    /// `(address, is_write)` for plain memory accesses.
    pub fn memory_access(&self) -> Option<(u64, bool)> {
        match self.kind {
            TransitionKind::GlobalRead { addr } => Some((addr, false)),
            TransitionKind::GlobalWrite { addr } => Some((addr, true)),
            _ => None,
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use TransitionKind::*;
        write!(f, "thread {}: ", self.executor)?;
        match &self.kind {
            ThreadStart => write!(f, "starts"),
            ThreadFinish => write!(f, "finishes"),
            ThreadCreate { child: Some(c), .. } => write!(f, "creates thread {c}"),
            ThreadCreate { child_handle, .. } => write!(f, "creates thread (0x{child_handle:x})"),
            ThreadJoin { target } => write!(f, "joins thread {target}"),
            Exit { code } => write!(f, "exits process ({code})"),
            MutexInit { addr } => write!(f, "mutex_init(0x{addr:x})"),
            MutexLock { addr } => write!(f, "mutex_lock(0x{addr:x})"),
            MutexUnlock { addr } => write!(f, "mutex_unlock(0x{addr:x})"),
            SemInit { addr, initial } => write!(f, "sem_init(0x{addr:x}, {initial})"),
            SemPost { addr } => write!(f, "sem_post(0x{addr:x})"),
            SemEnqueue { addr } => write!(f, "sem_enqueue(0x{addr:x})"),
            SemWait { addr } => write!(f, "sem_wait(0x{addr:x})"),
            CondInit { addr } => write!(f, "cond_init(0x{addr:x})"),
            CondEnqueue { cond, .. } => write!(f, "cond_enqueue(0x{cond:x})"),
            CondWait { cond, .. } => write!(f, "cond_wait(0x{cond:x})"),
            CondSignal { addr } => write!(f, "cond_signal(0x{addr:x})"),
            CondBroadcast { addr } => write!(f, "cond_broadcast(0x{addr:x})"),
            BarrierInit { addr, threshold } => write!(f, "barrier_init(0x{addr:x}, {threshold})"),
            BarrierEnqueue { addr } => write!(f, "barrier_enqueue(0x{addr:x})"),
            BarrierWait { addr } => write!(f, "barrier_wait(0x{addr:x})"),
            GlobalRead { addr } => write!(f, "read(0x{addr:x})"),
            GlobalWrite { addr } => write!(f, "write(0x{addr:x})"),
            ReachGoal => write!(f, "reaches goal"),
            RequestNewGoal => write!(f, "requests new goal"),
            EnterGoalCritical => write!(f, "enters goal critical section"),
            ExitGoalCritical => write!(f, "exits goal critical section"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock(executor: Tid, addr: u64) -> Transition {
        Transition::new(executor, TransitionKind::MutexLock { addr })
    }

    fn write(executor: Tid, addr: u64) -> Transition {
        Transition::new(executor, TransitionKind::GlobalWrite { addr })
    }

    fn read(executor: Tid, addr: u64) -> Transition {
        Transition::new(executor, TransitionKind::GlobalRead { addr })
    }

    #[test]
    fn same_executor_is_dependent() {
        let a = read(1, 0x10);
        let b = read(1, 0x20);
        assert!(a.dependent_with(&b));
    }

    #[test]
    fn reads_of_same_cell_are_independent() {
        let a = read(0, 0x10);
        let b = read(1, 0x10);
        assert!(!a.dependent_with(&b));
        assert!(!b.dependent_with(&a));
    }

    #[test]
    fn write_pairs_are_dependent() {
        assert!(write(0, 0x10).dependent_with(&write(1, 0x10)));
        assert!(write(0, 0x10).dependent_with(&read(1, 0x10)));
        assert!(!write(0, 0x10).dependent_with(&write(1, 0x20)));
    }

    #[test]
    fn mutex_ops_on_same_mutex_are_dependent() {
        let a = lock(0, 0x100);
        let b = Transition::new(1, TransitionKind::MutexUnlock { addr: 0x100 });
        assert!(a.dependent_with(&b));
        assert!(!a.dependent_with(&lock(1, 0x200)));
    }

    #[test]
    fn cond_enqueue_conflicts_with_mutex_ops() {
        let enq = Transition::new(
            0,
            TransitionKind::CondEnqueue {
                cond: 0x10,
                mutex: 0x20,
            },
        );
        assert!(enq.dependent_with(&lock(1, 0x20)));
        assert!(!enq.dependent_with(&lock(1, 0x30)));
    }

    #[test]
    fn create_is_dependent_with_child_ops() {
        let create = Transition::new(
            0,
            TransitionKind::ThreadCreate {
                child_handle: 0x99,
                child: Some(2),
            },
        );
        assert!(create.dependent_with(&read(2, 0x10)));
        assert!(!create.dependent_with(&read(1, 0x10)));
    }

    #[test]
    fn join_is_dependent_with_finish() {
        let join = Transition::new(0, TransitionKind::ThreadJoin { target: 2 });
        let finish = Transition::new(2, TransitionKind::ThreadFinish);
        assert!(join.dependent_with(&finish));
        let other_finish = Transition::new(1, TransitionKind::ThreadFinish);
        assert!(!join.dependent_with(&other_finish));
    }

    #[test]
    fn two_locks_on_same_mutex_are_coenabled() {
        // An unlocked mutex enables both lockers at once.
        assert!(lock(0, 0x100).coenabled_with(&lock(1, 0x100)));
        assert!(lock(0, 0x100).coenabled_with(&lock(1, 0x200)));
    }

    #[test]
    fn lock_unlock_pair_not_coenabled() {
        let unlock = Transition::new(1, TransitionKind::MutexUnlock { addr: 0x100 });
        assert!(!lock(0, 0x100).coenabled_with(&unlock));
    }

    #[test]
    fn sem_wait_post_pair_not_coenabled() {
        let wait = Transition::new(0, TransitionKind::SemWait { addr: 0x200 });
        let post = Transition::new(1, TransitionKind::SemPost { addr: 0x200 });
        assert!(!wait.coenabled_with(&post));
        assert!(!post.coenabled_with(&wait));

        let other_post = Transition::new(1, TransitionKind::SemPost { addr: 0x300 });
        assert!(wait.coenabled_with(&other_post));
    }

    #[test]
    fn same_thread_never_coenabled() {
        assert!(!read(0, 0x1).coenabled_with(&read(0, 0x2)));
    }

    #[test]
    fn mutex_lock_enabledness() {
        let mut store = VisibleObjectStore::new();
        store.begin_transition(Some(0));
        Transition::new(0, TransitionKind::MutexInit { addr: 0x100 })
            .modify(&mut store)
            .unwrap();

        assert!(lock(0, 0x100).enabled_in(&store.snapshot()));
        store.begin_transition(Some(1));
        lock(0, 0x100).modify(&mut store).unwrap();
        assert!(!lock(1, 0x100).enabled_in(&store.snapshot()));
    }

    #[test]
    fn lock_on_unknown_mutex_is_disabled() {
        let store = VisibleObjectStore::new();
        assert!(!lock(0, 0x500).enabled_in(&store.snapshot()));
    }

    #[test]
    fn double_init_is_undefined_behavior() {
        let mut store = VisibleObjectStore::new();
        store.begin_transition(Some(0));
        let init = Transition::new(0, TransitionKind::MutexInit { addr: 0x100 });
        assert_eq!(init.modify(&mut store).unwrap(), ApplyStatus::Exists);
        store.begin_transition(Some(1));
        assert!(matches!(
            init.modify(&mut store).unwrap(),
            ApplyStatus::UndefinedBehavior(_)
        ));
    }

    #[test]
    fn unlock_by_non_owner_is_undefined_behavior() {
        let mut store = VisibleObjectStore::new();
        store.begin_transition(Some(0));
        Transition::new(0, TransitionKind::MutexInit { addr: 0x100 })
            .modify(&mut store)
            .unwrap();
        store.begin_transition(Some(1));
        lock(0, 0x100).modify(&mut store).unwrap();

        store.begin_transition(Some(2));
        let unlock = Transition::new(1, TransitionKind::MutexUnlock { addr: 0x100 });
        assert!(matches!(
            unlock.modify(&mut store).unwrap(),
            ApplyStatus::UndefinedBehavior(_)
        ));
    }

    #[test]
    fn sem_wait_requires_head_and_count() {
        let mut store = VisibleObjectStore::new();
        store.begin_transition(Some(0));
        Transition::new(0, TransitionKind::SemInit {
            addr: 0x200,
            initial: 0,
        })
        .modify(&mut store)
        .unwrap();

        store.begin_transition(Some(1));
        Transition::new(1, TransitionKind::SemEnqueue { addr: 0x200 })
            .modify(&mut store)
            .unwrap();
        let wait = Transition::new(1, TransitionKind::SemWait { addr: 0x200 });
        // Enqueued but no post yet
        assert!(!wait.enabled_in(&store.snapshot()));

        store.begin_transition(Some(2));
        Transition::new(0, TransitionKind::SemPost { addr: 0x200 })
            .modify(&mut store)
            .unwrap();
        assert!(wait.enabled_in(&store.snapshot()));

        // Another thread behind in the queue stays blocked
        store.begin_transition(Some(3));
        Transition::new(2, TransitionKind::SemEnqueue { addr: 0x200 })
            .modify(&mut store)
            .unwrap();
        let wait2 = Transition::new(2, TransitionKind::SemWait { addr: 0x200 });
        assert!(!wait2.enabled_in(&store.snapshot()));
    }

    #[test]
    fn barrier_wait_enabled_only_when_full() {
        let mut store = VisibleObjectStore::new();
        store.begin_transition(Some(0));
        Transition::new(0, TransitionKind::BarrierInit {
            addr: 0x300,
            threshold: 2,
        })
        .modify(&mut store)
        .unwrap();

        store.begin_transition(Some(1));
        Transition::new(0, TransitionKind::BarrierEnqueue { addr: 0x300 })
            .modify(&mut store)
            .unwrap();
        let wait = Transition::new(0, TransitionKind::BarrierWait { addr: 0x300 });
        assert!(!wait.enabled_in(&store.snapshot()));

        store.begin_transition(Some(2));
        Transition::new(1, TransitionKind::BarrierEnqueue { addr: 0x300 })
            .modify(&mut store)
            .unwrap();
        assert!(wait.enabled_in(&store.snapshot()));
    }

    #[test]
    fn cond_wait_needs_signal_and_mutex() {
        let mut store = VisibleObjectStore::new();
        store.begin_transition(Some(0));
        Transition::new(0, TransitionKind::MutexInit { addr: 0x20 })
            .modify(&mut store)
            .unwrap();
        store.begin_transition(Some(1));
        Transition::new(0, TransitionKind::CondInit { addr: 0x10 })
            .modify(&mut store)
            .unwrap();
        store.begin_transition(Some(2));
        lock(1, 0x20).modify(&mut store).unwrap();
        store.begin_transition(Some(3));
        Transition::new(1, TransitionKind::CondEnqueue {
            cond: 0x10,
            mutex: 0x20,
        })
        .modify(&mut store)
        .unwrap();

        let wait = Transition::new(1, TransitionKind::CondWait {
            cond: 0x10,
            mutex: 0x20,
        });
        // Not signaled yet
        assert!(!wait.enabled_in(&store.snapshot()));

        store.begin_transition(Some(4));
        Transition::new(0, TransitionKind::CondSignal { addr: 0x10 })
            .modify(&mut store)
            .unwrap();
        assert!(wait.enabled_in(&store.snapshot()));

        // If someone holds the mutex the wakeup cannot complete
        store.begin_transition(Some(5));
        lock(2, 0x20).modify(&mut store).unwrap();
        assert!(!wait.enabled_in(&store.snapshot()));
    }
}
