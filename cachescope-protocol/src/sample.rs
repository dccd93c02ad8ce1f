//! Memory-access sample records produced by the recorder

use std::fmt;

/// Kind of memory access a sample describes.
///
/// Sources without a reliable load/store split (e.g. AMD IBS) report
/// `Unknown`; downstream analysis treats those as generic accesses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventKind {
    #[default]
    Load,
    Store,
    Unknown,
}

/// One decoded sample from the recorder's per-sample stream.
///
/// Immutable after ingest. `sp`/`bp` carry the sampled user register
/// values when the recorder was asked for them, zero otherwise.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sample {
    pub tid: u32,
    pub pid: u32,
    pub cpu: u32,
    /// Instruction pointer at the moment of the sample.
    pub ip: u64,
    /// Accessed virtual address; zero when the source did not record one.
    pub addr: u64,
    /// Sampled stack pointer.
    pub sp: u64,
    /// Sampled frame pointer.
    pub bp: u64,
    /// Timestamp in integer nanoseconds.
    pub timestamp: u64,
    pub kind: EventKind,
    /// Symbol the IP resolved to, trimmed of `+0x..` offsets.
    pub symbol: String,
    /// DSO the IP belongs to, as reported by the recorder.
    pub dso: String,
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tid={} pid={} cpu={} ip=0x{:x} addr=0x{:x} t={} {}",
            self.tid,
            self.pid,
            self.cpu,
            self.ip,
            self.addr,
            self.timestamp,
            if self.symbol.is_empty() {
                "<unknown>"
            } else {
                &self.symbol
            }
        )
    }
}
