use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "cachescope")]
#[command(about = "Post-hoc cache-behavior analyzer for native Linux binaries")]
#[command(version = "0.1.0")]
pub struct Args {
    /// Enable verbose diagnostics (per-unit skip counters, stderr logs)
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    /// Configuration file (default: ./cachescope.toml when present)
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Log file path (default: ./cachescope.log)
    #[arg(long, value_name = "PATH", global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Analyze cache behavior of a binary
    Analyze {
        /// Binary to analyze
        binary: PathBuf,

        /// Arguments passed through to the target
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,

        /// Recorder output file
        #[arg(short = 'o', long, value_name = "PATH")]
        output: Option<PathBuf>,

        /// Sampling event list (default depends on the CPU vendor)
        #[arg(short = 'e', long, value_name = "EVENT")]
        event: Option<String>,

        /// Sample period
        #[arg(short = 'c', long, value_name = "PERIOD")]
        period: Option<u64>,
    },

    /// Dump a recorded allocation-event trace
    Trace {
        /// Trace file written by the preloaded tracker
        trace_file: PathBuf,
    },
}
