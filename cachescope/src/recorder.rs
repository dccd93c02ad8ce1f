//! External recorder invocation
//!
//! The recorder is `perf`: `perf record` samples the target (launched
//! with the tracker preloaded), `perf script` streams the decoded
//! samples with a fixed field list the ingest side depends on.

use anyhow::{anyhow, Context, Result};
use cachescope_protocol::{ENV_ENABLE, ENV_TRACE};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use tracing::{debug, info, warn};

/// Field list handed to `perf script`; ingest depends on this order.
pub const SCRIPT_FIELDS: &str = "tid,pid,cpu,time,event,addr,ip,sym,dso,uregs";

/// Environment override naming the tracker shared object.
const ENV_HOOKS_PATH: &str = "CACHESCOPE_HOOKS";

const HOOKS_SO_NAME: &str = "libcachescope_hooks.so";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuVendor {
    Intel,
    Amd,
    Unknown,
}

/// Sniff the CPU vendor from /proc/cpuinfo.
pub fn detect_cpu_vendor() -> CpuVendor {
    let cpuinfo = fs::read_to_string("/proc/cpuinfo").unwrap_or_default();
    vendor_from_cpuinfo(&cpuinfo)
}

fn vendor_from_cpuinfo(cpuinfo: &str) -> CpuVendor {
    for line in cpuinfo.lines() {
        if line.contains("GenuineIntel") {
            return CpuVendor::Intel;
        }
        if line.contains("AuthenticAMD") {
            return CpuVendor::Amd;
        }
    }
    CpuVendor::Unknown
}

/// Default event list per vendor: precise load/store events on Intel,
/// IBS on AMD, plain cycles anywhere else.
pub fn default_event(vendor: CpuVendor) -> &'static str {
    match vendor {
        CpuVendor::Intel => "mem-loads:pp,mem-stores:pp",
        CpuVendor::Amd => "ibs_op//",
        CpuVendor::Unknown => "cpu-cycles",
    }
}

/// Locate the preloadable tracker object: explicit override first, then
/// next to the running executable.
pub fn find_hooks_object() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os(ENV_HOOKS_PATH) {
        let path = PathBuf::from(path);
        if path.is_file() {
            return Some(path);
        }
        warn!("{} names a missing file: {}", ENV_HOOKS_PATH, path.display());
    }
    let exe_dir = std::env::current_exe().ok()?.parent()?.to_path_buf();
    let candidate = exe_dir.join(HOOKS_SO_NAME);
    candidate.is_file().then_some(candidate)
}

/// Everything needed to drive one recording run.
#[derive(Debug)]
pub struct RecorderInvocation {
    pub target: PathBuf,
    pub target_args: Vec<String>,
    pub event: String,
    pub sample_period: u64,
    pub perf_data: PathBuf,
    pub alloc_trace: PathBuf,
}

impl RecorderInvocation {
    /// Run `perf record` to completion. The target runs with the tracker
    /// preloaded when the shared object could be found.
    pub fn record(&self) -> Result<()> {
        let mut cmd = Command::new("perf");
        cmd.arg("record")
            .arg("-e")
            .arg(&self.event)
            .arg("-c")
            .arg(self.sample_period.to_string())
            .arg("-d")
            .arg("--sample-cpu")
            .arg("--user-regs=sp,bp")
            .arg("-o")
            .arg(&self.perf_data)
            .arg("--")
            .arg(&self.target)
            .args(&self.target_args);

        match find_hooks_object() {
            Some(hooks) => {
                cmd.env("LD_PRELOAD", &hooks)
                    .env(ENV_ENABLE, "1")
                    .env(ENV_TRACE, &self.alloc_trace);
                info!("preloading tracker {}", hooks.display());
            }
            None => {
                warn!("tracker shared object not found; heap attribution disabled");
            }
        }

        info!(
            "recording {} with event '{}' period {}",
            self.target.display(),
            self.event,
            self.sample_period
        );
        debug!("recorder command: {:?}", cmd);

        let status = cmd
            .status()
            .context("failed to launch perf; is it installed?")?;
        if !status.success() {
            return Err(anyhow!("perf record exited with {}", status));
        }
        Ok(())
    }

    /// Spawn `perf script` with the fixed field list, stdout piped for
    /// streaming ingest. Map events are included so the load bias can be
    /// read off directly.
    pub fn spawn_script(&self) -> Result<Child> {
        Command::new("perf")
            .arg("script")
            .arg("-i")
            .arg(&self.perf_data)
            .arg("-F")
            .arg(SCRIPT_FIELDS)
            .arg("--show-mmap-events")
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .context("failed to launch perf script")
    }
}

/// Trace-file path derived from the recorder output path.
pub fn alloc_trace_path(perf_data: &Path) -> PathBuf {
    let mut name = perf_data.file_name().unwrap_or_default().to_os_string();
    name.push(".alloc");
    perf_data.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_detection() {
        assert_eq!(
            vendor_from_cpuinfo("vendor_id\t: GenuineIntel\n"),
            CpuVendor::Intel
        );
        assert_eq!(
            vendor_from_cpuinfo("vendor_id\t: AuthenticAMD\n"),
            CpuVendor::Amd
        );
        assert_eq!(vendor_from_cpuinfo("model name: riscv\n"), CpuVendor::Unknown);
    }

    #[test]
    fn vendor_defaults() {
        assert_eq!(default_event(CpuVendor::Intel), "mem-loads:pp,mem-stores:pp");
        assert_eq!(default_event(CpuVendor::Amd), "ibs_op//");
        assert_eq!(default_event(CpuVendor::Unknown), "cpu-cycles");
    }

    #[test]
    fn alloc_trace_sits_next_to_perf_data() {
        assert_eq!(
            alloc_trace_path(Path::new("/tmp/perf.data")),
            PathBuf::from("/tmp/perf.data.alloc")
        );
    }
}
