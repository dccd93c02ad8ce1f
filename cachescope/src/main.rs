mod args;
mod config;
mod logging;
mod recorder;
mod report;
mod session;

use anyhow::Result;
use args::{Args, Command};
use clap::Parser;
use config::Config;
use session::{AnalyzeSettings, Session};
use std::path::PathBuf;
use tracing::error;

fn main() {
    let args = Args::parse();

    if let Err(e) = logging::initialize_logging(args.log_file.as_deref(), args.verbose) {
        eprintln!("cachescope: failed to initialize logging: {e:#}");
    }

    match run(args) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("fatal: {:#}", e);
            eprintln!("cachescope: {e:#}");
            std::process::exit(1);
        }
    }
}

fn run(args: Args) -> Result<i32> {
    let config = Config::load(args.config.as_deref())?;

    match args.command {
        Command::Analyze {
            binary,
            args: target_args,
            output,
            event,
            period,
        } => {
            // CLI wins over the config file, which wins over defaults.
            let event = event
                .or_else(|| (!config.recorder.event.is_empty()).then(|| config.recorder.event.clone()))
                .unwrap_or_else(|| {
                    recorder::default_event(recorder::detect_cpu_vendor()).to_string()
                });
            let perf_data = output.unwrap_or_else(|| PathBuf::from(&config.recorder.perf_data));
            let sample_period = period.unwrap_or(config.recorder.sample_period);

            let session = Session::new(AnalyzeSettings {
                binary,
                target_args,
                event,
                sample_period,
                perf_data,
                classifier: config.thresholds.to_classifier_config(),
            });
            session.run()
        }
        Command::Trace { trace_file } => session::dump_trace(&trace_file),
    }
}
