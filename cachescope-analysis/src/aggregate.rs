//! Cache-line aggregation
//!
//! Pass 1 buckets every address-bearing sample into its 64-byte line.
//! Pass 2 runs only for candidate lines (hot, multi-thread, multi-offset)
//! and derives the time-ordered switching and per-thread offset overlap
//! statistics the classifier feeds on. Ordering touches by timestamp
//! before counting switches avoids inflated switching from cross-CPU
//! interleaving in the recorder's output.

use cachescope_protocol::{CacheLine, EventKind, Sample, CACHE_LINE_SIZE};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy)]
struct Touch {
    t: u64,
    tid: u32,
    off: u8,
}

/// Aggregate samples into per-line statistics.
///
/// Lines meeting `min_hot_samples` with at least two distinct threads
/// and two distinct offsets get the derived fields filled in; everything
/// else keeps them at their zero defaults.
pub fn aggregate(samples: &[Sample], min_hot_samples: u64) -> Vec<CacheLine> {
    let mut lines: HashMap<u64, CacheLine> = HashMap::new();

    // Pass 1: counts, tid and address multisets per line.
    for s in samples {
        if s.addr == 0 {
            continue;
        }
        let base = (s.addr / CACHE_LINE_SIZE) * CACHE_LINE_SIZE;
        let line = lines.entry(base).or_insert_with(|| CacheLine::new(base));
        line.tids.push(s.tid);
        line.addrs.push(s.addr);
        line.sample_count += 1;
        match s.kind {
            EventKind::Load => line.sample_reads += 1,
            EventKind::Store => line.sample_writes += 1,
            EventKind::Unknown => {}
        }
    }

    // Pass 2 candidates: hot lines with real sharing potential.
    let mut seq: HashMap<u64, Vec<Touch>> = HashMap::new();
    for (base, line) in &lines {
        if line.sample_count < min_hot_samples {
            continue;
        }
        if line.unique_tids().len() <= 1 || line.unique_offsets().len() <= 1 {
            continue;
        }
        seq.insert(*base, Vec::with_capacity(line.sample_count as usize));
    }

    if !seq.is_empty() {
        for s in samples {
            if s.addr == 0 {
                continue;
            }
            let base = (s.addr / CACHE_LINE_SIZE) * CACHE_LINE_SIZE;
            if let Some(touches) = seq.get_mut(&base) {
                touches.push(Touch {
                    t: s.timestamp,
                    tid: s.tid,
                    off: (s.addr - base) as u8,
                });
            }
        }

        for (base, mut touches) in seq {
            if let Some(line) = lines.get_mut(&base) {
                derive_line_stats(line, &mut touches);
            }
        }
    }

    lines.into_values().collect()
}

fn derive_line_stats(line: &mut CacheLine, touches: &mut [Touch]) {
    // Sort by timestamp only when the source supplied any; degraded
    // input without timestamps keeps insertion order. Ties keep
    // insertion order either way.
    if touches.iter().any(|t| t.t != 0) {
        touches.sort_by_key(|t| t.t);
    }

    let mut last: Option<u32> = None;
    for touch in touches.iter() {
        if let Some(prev) = last {
            if touch.tid != prev {
                line.thread_switches += 1;
            }
        }
        last = Some(touch.tid);
    }
    if touches.len() > 1 {
        line.bounce_score = line.thread_switches as f64 / (touches.len() - 1) as f64;
    }

    // Per-thread offset histograms over the line's 64 byte positions.
    let mut counts: HashMap<u32, [u32; CACHE_LINE_SIZE as usize]> = HashMap::new();
    for touch in touches.iter() {
        counts.entry(touch.tid).or_insert([0; CACHE_LINE_SIZE as usize])[touch.off as usize] += 1;
    }

    let mut touched_by = [0u16; CACHE_LINE_SIZE as usize];
    for histogram in counts.values() {
        for (i, &n) in histogram.iter().enumerate() {
            if n != 0 {
                touched_by[i] += 1;
            }
        }
    }

    let total = touched_by.iter().filter(|&&n| n > 0).count();
    let shared = touched_by.iter().filter(|&&n| n >= 2).count();
    line.total_offset_count = total;
    line.shared_offset_count = shared;
    line.private_offset_fraction = if total == 0 {
        0.0
    } else {
        (total - shared) as f64 / total as f64
    };

    // Each thread's favourite offset; distinct favourites indicate the
    // threads are not contending for the same word.
    let mut tops: HashSet<u8> = HashSet::new();
    for histogram in counts.values() {
        let mut best = 0u32;
        let mut best_off = 0u8;
        for (i, &n) in histogram.iter().enumerate() {
            if n > best {
                best = n;
                best_off = i as u8;
            }
        }
        if best != 0 {
            tops.insert(best_off);
        }
    }
    line.unique_top_offsets = tops.len();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(tid: u32, addr: u64, ts: u64, kind: EventKind) -> Sample {
        Sample {
            tid,
            addr,
            timestamp: ts,
            kind,
            ..Default::default()
        }
    }

    #[test]
    fn totals_match_address_bearing_samples() {
        let mut samples = Vec::new();
        for i in 0..100u64 {
            let kind = if i % 3 == 0 {
                EventKind::Store
            } else {
                EventKind::Load
            };
            samples.push(sample(1, 0x1000 + (i % 128), i + 1, kind));
        }
        samples.push(sample(1, 0, 1, EventKind::Load)); // no address, not counted

        let lines = aggregate(&samples, 1000);
        let with_addr = samples.iter().filter(|s| s.addr != 0).count() as u64;
        let total: u64 = lines.iter().map(|l| l.sample_count).sum();
        let reads: u64 = lines.iter().map(|l| l.sample_reads).sum();
        let writes: u64 = lines.iter().map(|l| l.sample_writes).sum();
        assert_eq!(total, with_addr);
        assert_eq!(reads + writes, total);
    }

    #[test]
    fn bounce_score_stays_in_bounds() {
        let mut samples = Vec::new();
        for i in 0..64u64 {
            samples.push(sample((i % 4) as u32, 0x2000 + (i % 32), i + 1, EventKind::Store));
        }
        let lines = aggregate(&samples, 8);
        for line in &lines {
            assert!((0.0..=1.0).contains(&line.bounce_score));
            assert!(line.thread_switches <= (line.sample_count.max(1) - 1));
        }
    }

    #[test]
    fn round_robin_threads_switch_every_touch() {
        // Four threads, each hammering its own offset, perfectly
        // interleaved in time.
        let mut samples = Vec::new();
        for i in 0..40u64 {
            let tid = (i % 4) as u32;
            samples.push(sample(tid, 0x4000 + tid as u64 * 8, i + 1, EventKind::Store));
        }
        let lines = aggregate(&samples, 8);
        assert_eq!(lines.len(), 1);
        let line = &lines[0];
        assert_eq!(line.thread_switches, 39);
        assert!((line.bounce_score - 1.0).abs() < 1e-9);
        assert_eq!(line.total_offset_count, 4);
        assert_eq!(line.shared_offset_count, 0);
        assert_eq!(line.unique_top_offsets, 4);
        assert!((line.private_offset_fraction - 1.0).abs() < 1e-9);
    }

    #[test]
    fn zero_timestamps_keep_insertion_order() {
        // Two threads, all of thread 1's touches first: one switch.
        let mut samples = Vec::new();
        for i in 0..10u64 {
            samples.push(sample(1, 0x8000 + i, 0, EventKind::Load));
        }
        for i in 0..10u64 {
            samples.push(sample(2, 0x8010 + i, 0, EventKind::Load));
        }
        let lines = aggregate(&samples, 4);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].thread_switches, 1);
    }

    #[test]
    fn cold_lines_skip_derived_stats() {
        let samples = vec![
            sample(1, 0x1000, 1, EventKind::Load),
            sample(2, 0x1008, 2, EventKind::Load),
        ];
        let lines = aggregate(&samples, 1000);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].thread_switches, 0);
        assert_eq!(lines[0].total_offset_count, 0);
    }
}
