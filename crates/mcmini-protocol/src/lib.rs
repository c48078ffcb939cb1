//! Wire protocol for scheduler <-> runner shared-memory communication.
//!
//! This crate defines the shared memory layout, descriptor kind tags, and
//! payload encoding used between the mcmini scheduler process and the
//! runner threads living in a forked child process.
//!
//! # Transport
//!
//! Communication uses a **shared memory region** mapped at a fixed address
//! in both processes, plus one pair of binary semaphores per thread:
//!
//! 1. A runner thread fills the [`DescriptorSlot`] with the visible
//!    operation it is about to perform
//! 2. The runner posts `scheduler_wakeup[tid]` and waits on
//!    `runner_wakeup[tid]`
//! 3. The scheduler, woken, reads and decodes the slot, decides which
//!    thread may run next, and posts that thread's `runner_wakeup`
//! 4. The resumed runner invokes the real primitive and continues to its
//!    next visible operation
//!
//! The region is mapped with `MAP_FIXED` at [`SHARED_REGION_ADDR`] so that
//! raw addresses embedded in descriptors (mutex addresses, semaphore
//! addresses) mean the same thing on both sides of the fork.
//!
//! Exactly one thread runs between rendezvous, so a single descriptor slot
//! suffices; there is never a concurrent writer.

use std::mem::size_of;

// ═══════════════════════════════════════════════════════════════════════
//  Region geometry
// ═══════════════════════════════════════════════════════════════════════

/// Maximum number of threads a checked program may create.
pub const MAX_THREADS: usize = 64;

/// Fixed virtual address the region is mapped at in every process.
///
/// Chosen low enough to be free in practice; both sides map with
/// `MAP_FIXED` so descriptor-embedded pointers survive the fork.
pub const SHARED_REGION_ADDR: usize = 0x4444000;

/// Scratch space reserved after the descriptor slot for oversized
/// payloads (none of the current kinds need it, shims may).
pub const MAX_SHARED_MEMORY_ALLOCATION: usize = 4096;

/// Total size of the shared region in bytes.
pub const SHARED_REGION_SIZE: usize = size_of::<SharedRegion>();

/// Name of the POSIX shared-memory object backing the region:
/// `/DPOR-<user>-<pid>`.
pub fn shared_region_name(user: &str, pid: u32) -> String {
    format!("/DPOR-{user}-{pid}")
}

/// Sentinel stored in [`TemplateControl::cpid`] when the template process
/// failed to fork.
pub const TEMPLATE_FORK_FAILED: libc::pid_t = -2;

/// Environment variable marking a process as the template-loop process
/// rather than a runner.
pub const ENV_TEMPLATE_LOOP: &str = "libmcmini-template-loop";

// ═══════════════════════════════════════════════════════════════════════
//  Region layout
// ═══════════════════════════════════════════════════════════════════════

/// One binary-semaphore pair per thread.
///
/// `runner_wakeup` is posted by the scheduler to let the thread run;
/// `scheduler_wakeup` is posted by the thread when it parks at its next
/// visible operation. Both live in shared memory and must be initialized
/// with `pshared = 1`.
#[repr(C)]
pub struct ThreadRendezvous {
    pub runner_wakeup: libc::sem_t,
    pub scheduler_wakeup: libc::sem_t,
}

/// Control block for the pre-forked template process.
///
/// The template loop waits on `libmcmini_sem`, forks, publishes the child
/// pid into `cpid` (or [`TEMPLATE_FORK_FAILED`]), and posts
/// `mcmini_process_sem`.
#[repr(C)]
pub struct TemplateControl {
    pub cpid: libc::pid_t,
    _pad: [u8; 4],
    pub libmcmini_sem: libc::sem_t,
    pub mcmini_process_sem: libc::sem_t,
}

/// Maximum payload bytes in a descriptor.
pub const DESCRIPTOR_PAYLOAD_MAX: usize = 56;

/// The single transition-descriptor slot.
///
/// ```text
/// Offset  Size  Field
/// ──────  ────  ─────────────
/// 0x00    4     kind         (one of the KIND_* tags)
/// 0x04    4     executor     (thread id of the parked runner)
/// 0x08    56    payload      (kind-specific, little-endian fields)
/// ```
#[repr(C)]
#[derive(Clone, Copy)]
pub struct DescriptorSlot {
    pub kind: u32,
    pub executor: u32,
    pub payload: [u8; DESCRIPTOR_PAYLOAD_MAX],
}

const _: () = assert!(size_of::<DescriptorSlot>() == 64);

impl DescriptorSlot {
    pub const fn zeroed() -> Self {
        Self {
            kind: 0,
            executor: 0,
            payload: [0; DESCRIPTOR_PAYLOAD_MAX],
        }
    }
}

/// Full fixed layout of the shared region.
#[repr(C)]
pub struct SharedRegion {
    pub rendezvous: [ThreadRendezvous; MAX_THREADS],
    pub template: TemplateControl,
    pub descriptor: DescriptorSlot,
    pub scratch: [u8; MAX_SHARED_MEMORY_ALLOCATION],
}

// ═══════════════════════════════════════════════════════════════════════
//  Descriptor kind tags
// ═══════════════════════════════════════════════════════════════════════

pub const KIND_THREAD_FINISH: u32 = 0x01;
pub const KIND_THREAD_CREATE: u32 = 0x02;
pub const KIND_THREAD_JOIN: u32 = 0x03;
pub const KIND_EXIT: u32 = 0x04;

pub const KIND_MUTEX_INIT: u32 = 0x10;
pub const KIND_MUTEX_LOCK: u32 = 0x11;
pub const KIND_MUTEX_UNLOCK: u32 = 0x12;

pub const KIND_SEM_INIT: u32 = 0x20;
pub const KIND_SEM_POST: u32 = 0x21;
pub const KIND_SEM_ENQUEUE: u32 = 0x22;
pub const KIND_SEM_WAIT: u32 = 0x23;

pub const KIND_COND_INIT: u32 = 0x30;
pub const KIND_COND_ENQUEUE: u32 = 0x31;
pub const KIND_COND_WAIT: u32 = 0x32;
pub const KIND_COND_SIGNAL: u32 = 0x33;
pub const KIND_COND_BROADCAST: u32 = 0x34;

pub const KIND_BARRIER_INIT: u32 = 0x40;
pub const KIND_BARRIER_ENQUEUE: u32 = 0x41;
pub const KIND_BARRIER_WAIT: u32 = 0x42;

pub const KIND_GLOBAL_READ: u32 = 0x50;
pub const KIND_GLOBAL_WRITE: u32 = 0x51;

pub const KIND_REACH_GOAL: u32 = 0x60;
pub const KIND_REQUEST_NEW_GOAL: u32 = 0x61;
pub const KIND_ENTER_GOAL_CRITICAL: u32 = 0x62;
pub const KIND_EXIT_GOAL_CRITICAL: u32 = 0x63;

// ═══════════════════════════════════════════════════════════════════════
//  Decoded descriptor
// ═══════════════════════════════════════════════════════════════════════

/// A visible operation as it crosses the wire, with raw addresses still
/// unresolved. The model layer maps addresses and thread handles onto its
/// own object and thread ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireOp {
    ThreadFinish,
    ThreadCreate { child_handle: u64 },
    ThreadJoin { target_handle: u64 },
    Exit { code: i32 },
    MutexInit { addr: u64, attrs: u32 },
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

/// A decoded descriptor: which thread parked, and on what.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    pub executor: u32,
    pub op: WireOp,
}

/// Errors produced while decoding a descriptor slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The kind tag is not one this protocol version knows.
    UnknownKind(u32),
    /// The payload was shorter than the kind requires.
    TruncatedPayload { kind: u32 },
    /// The executor field is outside `[0, MAX_THREADS)`.
    BadExecutor(u32),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::UnknownKind(k) => write!(f, "unknown descriptor kind 0x{k:x}"),
            ProtocolError::TruncatedPayload { kind } => {
                write!(f, "truncated payload for descriptor kind 0x{kind:x}")
            }
            ProtocolError::BadExecutor(t) => write!(f, "executor {t} out of range"),
        }
    }
}

impl std::error::Error for ProtocolError {}

// Little-endian field readers. All payloads are fixed-layout so plain
// offset arithmetic is enough.

fn read_u64(payload: &[u8], off: usize, kind: u32) -> Result<u64, ProtocolError> {
    payload
        .get(off..off + 8)
        .map(|b| u64::from_le_bytes(b.try_into().unwrap()))
        .ok_or(ProtocolError::TruncatedPayload { kind })
}

fn read_u32(payload: &[u8], off: usize, kind: u32) -> Result<u32, ProtocolError> {
    payload
        .get(off..off + 4)
        .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
        .ok_or(ProtocolError::TruncatedPayload { kind })
}

impl WireOp {
    /// The kind tag written into [`DescriptorSlot::kind`].
    pub fn kind_tag(&self) -> u32 {
        match self {
            WireOp::ThreadFinish => KIND_THREAD_FINISH,
            WireOp::ThreadCreate { .. } => KIND_THREAD_CREATE,
            WireOp::ThreadJoin { .. } => KIND_THREAD_JOIN,
            WireOp::Exit { .. } => KIND_EXIT,
            WireOp::MutexInit { .. } => KIND_MUTEX_INIT,
            WireOp::MutexLock { .. } => KIND_MUTEX_LOCK,
            WireOp::MutexUnlock { .. } => KIND_MUTEX_UNLOCK,
            WireOp::SemInit { .. } => KIND_SEM_INIT,
            WireOp::SemPost { .. } => KIND_SEM_POST,
            WireOp::SemEnqueue { .. } => KIND_SEM_ENQUEUE,
            WireOp::SemWait { .. } => KIND_SEM_WAIT,
            WireOp::CondInit { .. } => KIND_COND_INIT,
            WireOp::CondEnqueue { .. } => KIND_COND_ENQUEUE,
            WireOp::CondWait { .. } => KIND_COND_WAIT,
            WireOp::CondSignal { .. } => KIND_COND_SIGNAL,
            WireOp::CondBroadcast { .. } => KIND_COND_BROADCAST,
            WireOp::BarrierInit { .. } => KIND_BARRIER_INIT,
            WireOp::BarrierEnqueue { .. } => KIND_BARRIER_ENQUEUE,
            WireOp::BarrierWait { .. } => KIND_BARRIER_WAIT,
            WireOp::GlobalRead { .. } => KIND_GLOBAL_READ,
            WireOp::GlobalWrite { .. } => KIND_GLOBAL_WRITE,
            WireOp::ReachGoal => KIND_REACH_GOAL,
            WireOp::RequestNewGoal => KIND_REQUEST_NEW_GOAL,
            WireOp::EnterGoalCritical => KIND_ENTER_GOAL_CRITICAL,
            WireOp::ExitGoalCritical => KIND_EXIT_GOAL_CRITICAL,
        }
    }

    /// Encode this operation into a descriptor slot on behalf of
    /// `executor`. Used by the child-side shim helpers and by tests.
    pub fn encode(&self, executor: u32, slot: &mut DescriptorSlot) {
        slot.kind = self.kind_tag();
        slot.executor = executor;
        slot.payload = [0; DESCRIPTOR_PAYLOAD_MAX];
        let p = &mut slot.payload;
        match *self {
            WireOp::ThreadFinish
            | WireOp::ReachGoal
            | WireOp::RequestNewGoal
            | WireOp::EnterGoalCritical
            | WireOp::ExitGoalCritical => {}
            WireOp::ThreadCreate { child_handle } => {
                p[0..8].copy_from_slice(&child_handle.to_le_bytes());
            }
            WireOp::ThreadJoin { target_handle } => {
                p[0..8].copy_from_slice(&target_handle.to_le_bytes());
            }
            WireOp::Exit { code } => {
                p[0..4].copy_from_slice(&code.to_le_bytes());
            }
            WireOp::MutexInit { addr, attrs } => {
                p[0..8].copy_from_slice(&addr.to_le_bytes());
                p[8..12].copy_from_slice(&attrs.to_le_bytes());
            }
            WireOp::MutexLock { addr }
            | WireOp::MutexUnlock { addr }
            | WireOp::SemPost { addr }
            | WireOp::SemEnqueue { addr }
            | WireOp::SemWait { addr }
            | WireOp::CondInit { addr }
            | WireOp::CondSignal { addr }
            | WireOp::CondBroadcast { addr }
            | WireOp::BarrierEnqueue { addr }
            | WireOp::BarrierWait { addr }
            | WireOp::GlobalRead { addr }
            | WireOp::GlobalWrite { addr } => {
                p[0..8].copy_from_slice(&addr.to_le_bytes());
            }
            WireOp::SemInit { addr, initial } => {
                p[0..8].copy_from_slice(&addr.to_le_bytes());
                p[8..12].copy_from_slice(&initial.to_le_bytes());
            }
            WireOp::BarrierInit { addr, threshold } => {
                p[0..8].copy_from_slice(&addr.to_le_bytes());
                p[8..12].copy_from_slice(&threshold.to_le_bytes());
            }
            WireOp::CondEnqueue { cond, mutex } | WireOp::CondWait { cond, mutex } => {
                p[0..8].copy_from_slice(&cond.to_le_bytes());
                p[8..16].copy_from_slice(&mutex.to_le_bytes());
            }
        }
    }
}

impl Descriptor {
    /// Decode a descriptor slot.
    pub fn decode(slot: &DescriptorSlot) -> Result<Descriptor, ProtocolError> {
        if slot.executor as usize >= MAX_THREADS {
            return Err(ProtocolError::BadExecutor(slot.executor));
        }
        let k = slot.kind;
        let p = &slot.payload[..];
        let op = match k {
            KIND_THREAD_FINISH => WireOp::ThreadFinish,
            KIND_THREAD_CREATE => WireOp::ThreadCreate {
                child_handle: read_u64(p, 0, k)?,
            },
            KIND_THREAD_JOIN => WireOp::ThreadJoin {
                target_handle: read_u64(p, 0, k)?,
            },
            KIND_EXIT => WireOp::Exit {
                code: read_u32(p, 0, k)? as i32,
            },
            KIND_MUTEX_INIT => WireOp::MutexInit {
                addr: read_u64(p, 0, k)?,
                attrs: read_u32(p, 8, k)?,
            },
            KIND_MUTEX_LOCK => WireOp::MutexLock {
                addr: read_u64(p, 0, k)?,
            },
            KIND_MUTEX_UNLOCK => WireOp::MutexUnlock {
                addr: read_u64(p, 0, k)?,
            },
            KIND_SEM_INIT => WireOp::SemInit {
                addr: read_u64(p, 0, k)?,
                initial: read_u32(p, 8, k)?,
            },
            KIND_SEM_POST => WireOp::SemPost {
                addr: read_u64(p, 0, k)?,
            },
            KIND_SEM_ENQUEUE => WireOp::SemEnqueue {
                addr: read_u64(p, 0, k)?,
            },
            KIND_SEM_WAIT => WireOp::SemWait {
                addr: read_u64(p, 0, k)?,
            },
            KIND_COND_INIT => WireOp::CondInit {
                addr: read_u64(p, 0, k)?,
            },
            KIND_COND_ENQUEUE => WireOp::CondEnqueue {
                cond: read_u64(p, 0, k)?,
                mutex: read_u64(p, 8, k)?,
            },
            KIND_COND_WAIT => WireOp::CondWait {
                cond: read_u64(p, 0, k)?,
                mutex: read_u64(p, 8, k)?,
            },
            KIND_COND_SIGNAL => WireOp::CondSignal {
                addr: read_u64(p, 0, k)?,
            },
            KIND_COND_BROADCAST => WireOp::CondBroadcast {
                addr: read_u64(p, 0, k)?,
            },
            KIND_BARRIER_INIT => WireOp::BarrierInit {
                addr: read_u64(p, 0, k)?,
                threshold: read_u32(p, 8, k)?,
            },
            KIND_BARRIER_ENQUEUE => WireOp::BarrierEnqueue {
                addr: read_u64(p, 0, k)?,
            },
            KIND_BARRIER_WAIT => WireOp::BarrierWait {
                addr: read_u64(p, 0, k)?,
            },
            KIND_GLOBAL_READ => WireOp::GlobalRead {
                addr: read_u64(p, 0, k)?,
            },
            KIND_GLOBAL_WRITE => WireOp::GlobalWrite {
                addr: read_u64(p, 0, k)?,
            },
            KIND_REACH_GOAL => WireOp::ReachGoal,
            KIND_REQUEST_NEW_GOAL => WireOp::RequestNewGoal,
            KIND_ENTER_GOAL_CRITICAL => WireOp::EnterGoalCritical,
            KIND_EXIT_GOAL_CRITICAL => WireOp::ExitGoalCritical,
            other => return Err(ProtocolError::UnknownKind(other)),
        };
        Ok(Descriptor {
            executor: slot.executor,
            op,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(op: WireOp) -> Descriptor {
        let mut slot = DescriptorSlot::zeroed();
        op.encode(3, &mut slot);
        Descriptor::decode(&slot).unwrap()
    }

    #[test]
    fn descriptor_slot_is_64_bytes() {
        assert_eq!(size_of::<DescriptorSlot>(), 64);
    }

    #[test]
    fn region_name_format() {
        assert_eq!(shared_region_name("alice", 4321), "/DPOR-alice-4321");
    }

    #[test]
    fn encode_decode_simple_ops() {
        for op in [
            WireOp::ThreadFinish,
            WireOp::ReachGoal,
            WireOp::RequestNewGoal,
            WireOp::EnterGoalCritical,
            WireOp::ExitGoalCritical,
        ] {
            let d = roundtrip(op);
            assert_eq!(d.executor, 3);
            assert_eq!(d.op, op);
        }
    }

    #[test]
    fn encode_decode_addressed_ops() {
        let ops = [
            WireOp::MutexInit {
                addr: 0x7fff_0000_1234,
                attrs: 1,
            },
            WireOp::MutexLock { addr: 0xdead },
            WireOp::SemInit {
                addr: 0xbeef,
                initial: 5,
            },
            WireOp::CondEnqueue {
                cond: 0x10,
                mutex: 0x20,
            },
            WireOp::BarrierInit {
                addr: 0x30,
                threshold: 6,
            },
            WireOp::GlobalWrite { addr: 0x4444_1000 },
            WireOp::ThreadCreate {
                child_handle: u64::MAX,
            },
            WireOp::Exit { code: -1 },
        ];
        for op in ops {
            assert_eq!(roundtrip(op).op, op);
        }
    }

    #[test]
    fn decode_unknown_kind() {
        let mut slot = DescriptorSlot::zeroed();
        slot.kind = 0xFF;
        assert_eq!(
            Descriptor::decode(&slot),
            Err(ProtocolError::UnknownKind(0xFF))
        );
    }

    #[test]
    fn decode_bad_executor() {
        let mut slot = DescriptorSlot::zeroed();
        WireOp::ThreadFinish.encode(0, &mut slot);
        slot.executor = MAX_THREADS as u32;
        assert_eq!(
            Descriptor::decode(&slot),
            Err(ProtocolError::BadExecutor(MAX_THREADS as u32))
        );
    }

    #[test]
    fn cond_ops_carry_both_addresses() {
        let d = roundtrip(WireOp::CondWait {
            cond: 0xAAAA,
            mutex: 0xBBBB,
        });
        match d.op {
            WireOp::CondWait { cond, mutex } => {
                assert_eq!(cond, 0xAAAA);
                assert_eq!(mutex, 0xBBBB);
            }
            other => panic!("decoded {other:?}"),
        }
    }
}
