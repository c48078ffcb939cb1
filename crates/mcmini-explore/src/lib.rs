//! The DPOR exploration engine.
//!
//! [`engine::Explorer`] drives a [`mcmini_runner::Runner`] through every
//! schedule the dynamic partial-order reduction deems necessary,
//! checking each reached state for deadlocks, data races, and
//! forward-progress violations.

pub mod engine;
pub mod report;
pub mod violations;

use mcmini_model::ModelError;
use mcmini_runner::RunnerError;
use thiserror::Error;

/// Errors that abort exploration.
#[derive(Debug, Error)]
pub enum ExploreError {
    #[error("model error: {0}")]
    Model(#[from] ModelError),

    #[error("runner error: {0}")]
    Runner(#[from] RunnerError),
}
