//! Program model for the mcmini checker.
//!
//! The model reflects the checked program as a sequence of immutable
//! snapshots of *visible objects* (mutexes, semaphores, condition
//! variables, barriers, threads, global cells), advanced one *visible
//! transition* at a time. The [`sequence::StateSequence`] owns the
//! transition stack, the state stack, and the pending next-table that the
//! exploration engine drives.

pub mod clock;
pub mod config;
pub mod objects;
pub mod sequence;
pub mod store;
pub mod transitions;

use thiserror::Error;

/// Dense thread id, assigned in the order threads are first created.
/// Thread 0 is the main thread.
pub type Tid = u32;

/// The main thread's id.
pub const TID_MAIN: Tid = 0;

/// Sentinel for "no thread".
pub const TID_INVALID: Tid = u32::MAX;

/// Dense visible-object id issued by the object store.
pub type ObjId = usize;

/// Errors surfaced by the model layer.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("unknown object id {0}")]
    UnknownObject(ObjId),

    #[error("unknown thread handle 0x{0:x}")]
    UnknownThreadHandle(u64),

    #[error("thread {0} has no pending operation")]
    NoPending(Tid),

    #[error("undefined behavior by thread {executor}: {reason}")]
    UndefinedBehavior { executor: Tid, reason: String },

    #[error("rendezvous protocol violation: {0}")]
    Protocol(String),

    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}
