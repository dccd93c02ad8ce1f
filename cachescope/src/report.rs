//! Report rendering
//!
//! Stdout carries only the report; diagnostics go through tracing.

use cachescope_analysis::{Attributor, SampleStats};
use cachescope_protocol::{CacheLine, Sample, CACHE_LINE_SIZE};
use std::collections::HashMap;

const MAX_REPORT_LINES: usize = 10;
const MAX_ATTRIBUTIONS_PER_LINE: usize = 3;

pub fn print_report(
    stats: &SampleStats,
    hot_lines: &[CacheLine],
    samples: &[Sample],
    attributor: &Attributor<'_>,
) {
    print!("{stats}");

    println!("\n=== False Sharing Analysis ===\n");
    if hot_lines.is_empty() {
        println!("No suspicious cache lines found.");
        return;
    }

    for (i, line) in hot_lines.iter().take(MAX_REPORT_LINES).enumerate() {
        let unique_tids = line.unique_tids();
        let offsets = line.unique_offsets();
        let min_addr = line.addrs.iter().min().copied().unwrap_or(line.base_addr);
        let max_addr = line.addrs.iter().max().copied().unwrap_or(line.base_addr);

        println!(
            "Cache Line #{}: 0x{:x}\n\
             \x20 Samples: {} (reads={}, writes={})\n\
             \x20 Threads: {}\n\
             \x20 Distinct offsets: {} (shared={}, private_frac={:.2}, top_offsets={})\n\
             \x20 Thread switches: {} (bounce={:.3})\n\
             \x20 Address range: 0x{:x} - 0x{:x} ({} bytes)",
            i + 1,
            line.base_addr,
            line.sample_count,
            line.sample_reads,
            line.sample_writes,
            unique_tids.len(),
            offsets.len(),
            line.shared_offset_count,
            line.private_offset_fraction,
            line.unique_top_offsets,
            line.thread_switches,
            line.bounce_score,
            min_addr,
            max_addr,
            max_addr - min_addr,
        );

        for (name, count) in line_attributions(line, samples, attributor) {
            println!("  Attributed to: {name} ({count} samples)");
        }
        println!();
    }
}

/// Most frequent attributions among the samples landing in `line`.
fn line_attributions(
    line: &CacheLine,
    samples: &[Sample],
    attributor: &Attributor<'_>,
) -> Vec<(String, usize)> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for sample in samples {
        if sample.addr < line.base_addr || sample.addr >= line.base_addr + CACHE_LINE_SIZE {
            continue;
        }
        if let Some(attr) = attributor.attribute(sample) {
            *counts.entry(attr.to_string()).or_insert(0) += 1;
        }
    }
    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    ranked.truncate(MAX_ATTRIBUTIONS_PER_LINE);
    ranked
}
