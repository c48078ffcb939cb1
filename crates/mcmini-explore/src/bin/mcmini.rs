//! Command-line entry point for the mcmini model checker.
//!
//! Launches the target program under the forked-runner rendezvous and
//! explores its schedules. Environment variables provide defaults for
//! every knob so the checker can also be driven without flags:
//!
//! ```bash
//! # Explore a program, stopping at the first deadlock
//! mcmini run --stop-at-first-deadlock -- ./target-program
//!
//! # Bound each thread to 7 transitions, dump trace 12 and stop
//! MCMINI_MAX_THREAD_DEPTH=7 mcmini run --print-at-trace 12 -- ./target-program
//! ```

use clap::{Parser, Subcommand};
use mcmini_explore::engine::{ExplorationReport, Explorer, ExplorerConfig};
use mcmini_explore::report::format_report;
use mcmini_model::config::CheckerConfig;
use mcmini_runner::forked::{ForkedRunner, ForkedRunnerConfig};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "mcmini")]
#[command(about = "Stateless DPOR model checker for pthread programs")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Explore the schedules of a program.
    Run {
        /// Max transitions any single thread may execute.
        #[arg(long)]
        max_depth: Option<u64>,

        /// Stop exploring at the first deadlock.
        #[arg(long)]
        stop_at_first_deadlock: bool,

        /// Dump the transition stack after this trace id and stop.
        #[arg(long)]
        print_at_trace: Option<u64>,

        /// Announce this trace id so an external debugger can attach.
        #[arg(long)]
        debug_at_trace: Option<u64>,

        /// Liveness budget: transitions a thread may run past its last
        /// progress goal (0 disables the check).
        #[arg(long, default_value = "0")]
        check_forward_progress: u64,

        /// Safety limit on the number of traces.
        #[arg(long)]
        max_traces: Option<u64>,

        /// Intercept library preloaded into the target.
        #[arg(long)]
        preload: Option<PathBuf>,

        /// Write the report as JSON to this file.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// The program to check, followed by its arguments.
        #[arg(trailing_var_arg = true, required = true)]
        program: Vec<String>,
    },
}

fn main() -> ExitCode {
    env_logger::init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            max_depth,
            stop_at_first_deadlock,
            print_at_trace,
            debug_at_trace,
            check_forward_progress,
            max_traces,
            preload,
            output,
            program,
        } => {
            // Environment variables are the defaults; flags win.
            let mut checker = CheckerConfig::from_env();
            if max_depth.is_some() {
                checker.max_thread_execution_depth = max_depth;
            }
            if stop_at_first_deadlock {
                checker.stop_at_first_deadlock = true;
            }
            if print_at_trace.is_some() {
                checker.print_at_trace = print_at_trace;
            }
            if debug_at_trace.is_some() {
                checker.debug_at_trace = debug_at_trace;
            }
            if check_forward_progress > 0 {
                checker.extra_liveness_transitions = Some(check_forward_progress);
            }

            let (target, args) = match program.split_first() {
                Some((target, args)) => (PathBuf::from(target), args.to_vec()),
                None => {
                    eprintln!("no program given");
                    return ExitCode::FAILURE;
                }
            };

            let runner = match ForkedRunner::new(ForkedRunnerConfig {
                program: target,
                args,
                preload,
            }) {
                Ok(runner) => runner,
                Err(e) => {
                    eprintln!("failed to launch target: {e}");
                    return ExitCode::FAILURE;
                }
            };

            // The real main thread's identity is only known to the
            // intercept library; thread 0 is addressed by convention.
            let explorer = Explorer::new(
                ExplorerConfig {
                    checker,
                    max_traces,
                },
                runner,
                0,
            );
            let report = match explorer.run() {
                Ok(report) => report,
                Err(e) => {
                    eprintln!("exploration failed: {e}");
                    return ExitCode::FAILURE;
                }
            };

            print!("{}", format_report(&report));
            if let Some(path) = output {
                if let Err(e) = write_json(&path, &report) {
                    eprintln!("failed to write {}: {e}", path.display());
                    return ExitCode::FAILURE;
                }
            }

            if report.has_undefined_behavior() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
    }
}

fn write_json(path: &PathBuf, report: &ExplorationReport) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(report)?;
    std::fs::write(path, json)
}
