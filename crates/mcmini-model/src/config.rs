//! Checker configuration, sourced from the environment or the CLI.

use log::warn;

pub const ENV_MAX_THREAD_DEPTH: &str = "MCMINI_MAX_THREAD_DEPTH";
pub const ENV_DEBUG_AT_TRACE: &str = "MCMINI_DEBUG_AT_TRACE";
pub const ENV_PRINT_AT_TRACE: &str = "MCMINI_PRINT_AT_TRACE";
pub const ENV_STOP_AT_FIRST_DEADLOCK: &str = "MCMINI_STOP_AT_FIRST_DEADLOCK";
pub const ENV_CHECK_FORWARD_PROGRESS: &str = "MCMINI_CHECK_FORWARD_PROGRESS";

/// Parameters of one model-checking run.
#[derive(Debug, Clone, Default)]
pub struct CheckerConfig {
    /// Max transitions any single thread may execute; `None` is
    /// unlimited. Threads past the cap have their next transition
    /// artificially disabled.
    pub max_thread_execution_depth: Option<u64>,
    /// Trace id at which an external debugger wants control.
    pub debug_at_trace: Option<u64>,
    /// Trace id at which to dump the transition stack and stop.
    pub print_at_trace: Option<u64>,
    /// Stop exploring at the first deadlock found.
    pub stop_at_first_deadlock: bool,
    /// Extra transitions a thread may run past its last progress goal
    /// before it counts as starving; `None` disables the check.
    pub extra_liveness_transitions: Option<u64>,
    /// Transitions every *other* thread must have run since the starving
    /// thread's last goal before a violation is declared.
    pub min_extra_liveness_transitions: u64,
}

impl CheckerConfig {
    /// Read configuration from the environment variables above.
    pub fn from_env() -> Self {
        let mut config = CheckerConfig::default();
        config.max_thread_execution_depth = parse_u64(ENV_MAX_THREAD_DEPTH);
        config.debug_at_trace = parse_u64(ENV_DEBUG_AT_TRACE);
        config.print_at_trace = parse_u64(ENV_PRINT_AT_TRACE);
        config.stop_at_first_deadlock = std::env::var_os(ENV_STOP_AT_FIRST_DEADLOCK).is_some();
        config.extra_liveness_transitions =
            parse_u64(ENV_CHECK_FORWARD_PROGRESS).filter(|&n| n > 0);
        config
    }
}

fn parse_u64(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    match raw.parse::<u64>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("ignoring {name}={raw}: not an unsigned integer");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_unbounded() {
        let config = CheckerConfig::default();
        assert_eq!(config.max_thread_execution_depth, None);
        assert!(!config.stop_at_first_deadlock);
        assert_eq!(config.extra_liveness_transitions, None);
        assert_eq!(config.min_extra_liveness_transitions, 0);
    }
}
