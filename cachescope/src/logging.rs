use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

const DEFAULT_LOG_FILE: &str = "cachescope.log";

static INIT_GUARD: OnceLock<()> = OnceLock::new();

pub fn initialize_logging(log_file_path: Option<&Path>, verbose: bool) -> Result<()> {
    if INIT_GUARD.set(()).is_err() {
        // Already initialized elsewhere; do nothing and succeed
        return Ok(());
    }

    // Route log-facade output from dependencies into tracing; ignore
    // 'already set' errors.
    let _ = tracing_log::LogTracer::init();

    let log_path = match log_file_path {
        Some(path) => path.to_path_buf(),
        None => PathBuf::from(DEFAULT_LOG_FILE),
    };

    let maybe_log_file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&log_path);

    match maybe_log_file {
        Ok(log_file) => {
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(log_file)
                .with_target(true)
                .with_ansi(false)
                .with_filter(tracing_subscriber::filter::EnvFilter::from_default_env());

            if verbose {
                // Verbose mode mirrors diagnostics to stderr so the
                // report on stdout stays clean.
                let stderr_layer = tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false)
                    .with_filter(tracing_subscriber::filter::LevelFilter::INFO);
                let _ = tracing_subscriber::registry()
                    .with(file_layer)
                    .with(stderr_layer)
                    .try_init();
            } else {
                let _ = tracing_subscriber::registry().with(file_layer).try_init();
            }
        }
        Err(_) => {
            // Fall back to stderr only if file creation fails
            let _ = tracing_subscriber::fmt()
                .with_writer(std::io::stderr)
                .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
                .try_init();
        }
    }

    Ok(())
}
