//! Analysis session orchestration
//!
//! Composes the pipeline: static extraction, recording, ingest,
//! aggregation, classification, attribution, report. Degraded inputs
//! (no debug info, no unwind info, no allocation trace) lower the
//! report's fidelity but never abort a run that produced samples.

use crate::recorder::{alloc_trace_path, RecorderInvocation};
use crate::report;
use anyhow::{anyhow, Context, Result};
use cachescope_analysis::{
    aggregate, classify, min_sample_ip, read_alloc_events, read_samples, Attributor,
    ClassifierConfig, LiveSet, SampleStats,
};
use cachescope_binary::{BinaryFile, CfaResolver};
use cachescope_dwarf::Extractor;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

pub const EXIT_OK: i32 = 0;
pub const EXIT_RECORDER_FAILURE: i32 = 2;
pub const EXIT_NO_SAMPLES: i32 = 3;
pub const EXIT_NO_DEBUG_INFO: i32 = 4;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_terminate(_signum: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Keep running on the first termination signal: the recorder dies with
/// the process group, the pipe drains, and a partial report goes out.
fn install_signal_handler() {
    let handler = on_terminate as extern "C" fn(libc::c_int) as libc::sighandler_t;
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }
}

#[derive(Debug)]
pub struct AnalyzeSettings {
    pub binary: PathBuf,
    pub target_args: Vec<String>,
    pub event: String,
    pub sample_period: u64,
    pub perf_data: PathBuf,
    pub classifier: ClassifierConfig,
}

pub struct Session {
    settings: AnalyzeSettings,
}

impl Session {
    pub fn new(settings: AnalyzeSettings) -> Self {
        Session { settings }
    }

    /// Run the full pipeline; the returned code is the process exit code.
    pub fn run(&self) -> Result<i32> {
        install_signal_handler();
        let settings = &self.settings;

        if !settings.binary.is_file() {
            return Err(anyhow!(
                "target binary {} does not exist",
                settings.binary.display()
            ));
        }

        // Static model first: it does not depend on the recording and
        // its absence should surface before the expensive run.
        let model = Extractor::extract(&settings.binary)?;
        let binary = BinaryFile::open(&settings.binary)?;

        let resolver = match CfaResolver::from_arc_data(binary.data()) {
            Ok(r) => Some(r),
            Err(e) => {
                warn!("stack attribution disabled: {}", e);
                None
            }
        };

        let invocation = RecorderInvocation {
            target: settings.binary.clone(),
            target_args: settings.target_args.clone(),
            event: settings.event.clone(),
            sample_period: settings.sample_period,
            perf_data: settings.perf_data.clone(),
            alloc_trace: alloc_trace_path(&settings.perf_data),
        };

        if let Err(e) = invocation.record() {
            warn!("recorder failed: {:#}", e);
            eprintln!("cachescope: recorder failed: {e:#}");
            return Ok(EXIT_RECORDER_FAILURE);
        }

        // Stream the post-processor's output straight into ingest.
        let mut script = match invocation.spawn_script() {
            Ok(child) => child,
            Err(e) => {
                eprintln!("cachescope: {e:#}");
                return Ok(EXIT_RECORDER_FAILURE);
            }
        };
        let stdout = script
            .stdout
            .take()
            .context("perf script produced no stdout pipe")?;
        let target_path = settings.binary.to_string_lossy().into_owned();
        let ingest = read_samples(BufReader::new(stdout), &target_path, &binary.basename());
        let status = script.wait().context("failed to await perf script")?;
        if !status.success() {
            warn!("perf script exited with {}", status);
        }

        if INTERRUPTED.load(Ordering::SeqCst) {
            warn!("interrupted; emitting partial report");
        }

        if ingest.samples.is_empty() {
            eprintln!("cachescope: no samples collected");
            return Ok(EXIT_NO_SAMPLES);
        }

        let stats = SampleStats::compute(&ingest.samples);
        info!(
            "aggregating {} samples into cache lines",
            ingest.samples.len()
        );
        let lines = aggregate(&ingest.samples, settings.classifier.min_hot_samples);
        let hot = classify(lines, &settings.classifier);
        info!("{} cache lines pass the false-sharing policy", hot.len());

        // The allocation trace is best-effort: the tracker may not have
        // been preloaded at all.
        let live = match read_alloc_events(&invocation.alloc_trace) {
            Ok(events) => Some(LiveSet::replay(&events)),
            Err(e) => {
                warn!("heap attribution disabled: {:#}", e);
                None
            }
        };

        let biases = resolver
            .as_ref()
            .map(|r| r.bias_candidates(ingest.map_bias, min_sample_ip(&ingest.samples)))
            .unwrap_or_default();
        let attributor = Attributor::new(&model, resolver.as_ref(), biases, live.as_ref());

        report::print_report(&stats, &hot, &ingest.samples, &attributor);

        if !model.has_debug_info() {
            eprintln!("cachescope: {} carries no debug info", settings.binary.display());
            return Ok(EXIT_NO_DEBUG_INFO);
        }
        Ok(EXIT_OK)
    }
}

/// `trace` subcommand: decode and print an allocation-event log.
pub fn dump_trace(path: &std::path::Path) -> Result<i32> {
    let events = read_alloc_events(path)?;
    let mut live = LiveSet::default();
    for ev in &events {
        let what = match (ev.is_free, ev.kind) {
            (true, _) => "free ",
            (false, cachescope_protocol::AllocKind::Heap) => "alloc",
            (false, cachescope_protocol::AllocKind::Mmap) => "mmap ",
        };
        println!(
            "{what} base=0x{:x} size={} callsite=0x{:x} pid={}",
            ev.base, ev.size, ev.callsite_ip, ev.pid
        );
        live.apply(ev);
    }
    println!("{} events, {} regions live at end of trace", events.len(), live.len());
    Ok(EXIT_OK)
}
