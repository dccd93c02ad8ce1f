//! Per-cache-line aggregate produced by the analyzer

/// Aggregated view of all samples that landed in one 64-byte line.
///
/// `tids` and `addrs` are multisets kept in sample order; the derived
/// fields below them are filled in by the aggregation pass for lines that
/// cross the hot-sample threshold.
#[derive(Debug, Clone, Default)]
pub struct CacheLine {
    /// 64-byte aligned base address.
    pub base_addr: u64,
    pub sample_count: u64,
    pub sample_reads: u64,
    pub sample_writes: u64,
    /// Thread id of every sample, in sample order.
    pub tids: Vec<u32>,
    /// Accessed address of every sample, in sample order.
    pub addrs: Vec<u64>,

    /// Count of adjacent time-ordered touches with differing thread ids.
    pub thread_switches: u64,
    /// `thread_switches / max(1, touches - 1)`, in `[0, 1]`.
    pub bounce_score: f64,
    /// Offsets within the line touched by two or more threads.
    pub shared_offset_count: usize,
    /// Offsets within the line touched by at least one thread.
    pub total_offset_count: usize,
    /// Distinct per-thread favourite offsets.
    pub unique_top_offsets: usize,
    /// `(total - shared) / total` offsets, in `[0, 1]`.
    pub private_offset_fraction: f64,
}

impl CacheLine {
    pub fn new(base_addr: u64) -> Self {
        CacheLine {
            base_addr,
            ..Default::default()
        }
    }

    /// Thread ids deduplicated, sorted.
    pub fn unique_tids(&self) -> Vec<u32> {
        let mut tids = self.tids.clone();
        tids.sort_unstable();
        tids.dedup();
        tids
    }

    /// Line-relative offsets deduplicated, sorted.
    pub fn unique_offsets(&self) -> Vec<u64> {
        let mut offs: Vec<u64> = self.addrs.iter().map(|a| a - self.base_addr).collect();
        offs.sort_unstable();
        offs.dedup();
        offs
    }
}
