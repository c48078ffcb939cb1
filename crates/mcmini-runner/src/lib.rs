//! Runner handles: the engine's view of the program under test.
//!
//! The exploration engine never touches processes or semaphores
//! directly; it drives an abstract [`Runner`] that can (re)start the
//! program, advance one thread to its next visible operation, and tear
//! the current execution down. [`forked::ForkedRunner`] is the real
//! implementation over a forked child process and shared memory;
//! [`scripted::ScriptedRunner`] plays back an in-process program
//! description and exists so the engine can be exercised in tests
//! without process plumbing.

pub mod forked;
pub mod scripted;

use mcmini_model::Tid;
use mcmini_protocol::{Descriptor, ProtocolError};
use thiserror::Error;

/// Errors from runner implementations.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("descriptor decode failed: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("descriptor executor {got} does not match scheduled thread {expected}")]
    WrongExecutor { expected: Tid, got: Tid },

    #[error("template process failed to fork")]
    TemplateForkFailed,

    #[error("no execution in progress")]
    NotStarted,

    #[error("thread {0} ran past the end of its script")]
    ScriptExhausted(Tid),

    #[error("runner i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

/// A single-step handle on one execution of the checked program.
///
/// The rendezvous contract: a thread is always parked immediately
/// *before* its pending visible operation. `advance` lets it perform
/// that operation and run to the next park, returning the descriptor it
/// parked on. Thread-ending operations produce no further descriptor,
/// so the engine uses `release` for those.
pub trait Runner {
    /// Begin a fresh execution of the program from the start. Any
    /// execution already in progress is torn down first.
    fn start(&mut self) -> Result<(), RunnerError>;

    /// Let thread `tid` run through its pending operation to its next
    /// visible operation; returns the descriptor for that next
    /// operation.
    fn advance(&mut self, tid: Tid) -> Result<Descriptor, RunnerError>;

    /// Let thread `tid` run through its final operation without waiting
    /// for another park.
    fn release(&mut self, tid: Tid) -> Result<(), RunnerError>;

    /// Tear down the current execution.
    fn kill(&mut self);
}
