//! Sample ingest: the recorder's textual stream to typed records
//!
//! The post-processor is asked for the fixed field list
//! `tid,pid,cpu,time,event,addr,ip,sym,dso,uregs`, so a sample line looks
//! like
//!
//! ```text
//! worker 4242/4243 [002] 1234.567890123: mem-stores:pp: 7f12ab40 401234 bump_counter+0x12 (/home/u/app) sp: 0x7ffc1000 bp: 0x7ffc1040
//! ```
//!
//! Parsing is positional only where the contract fixes the order (the two
//! hex tokens are `addr ip`); everything else keys off token shape.
//! A malformed line skips that line only.

use cachescope_protocol::{EventKind, Sample};
use std::io::BufRead;
use tracing::{debug, info};

/// Ingest counters, surfaced in verbose output.
#[derive(Debug, Default, Clone)]
pub struct IngestStats {
    pub lines_total: u64,
    pub lines_skipped: u64,
    pub samples_filtered: u64,
}

/// Everything one pass over the recorder output produces.
#[derive(Debug, Default)]
pub struct IngestResult {
    pub samples: Vec<Sample>,
    pub stats: IngestStats,
    /// Load bias of the target derived from memory-map events, if the
    /// recorder reported any.
    pub map_bias: Option<u64>,
}

/// Streaming reader over the recorder's output.
///
/// `target_path`/`target_basename` drive the DSO filter: samples whose
/// non-empty DSO names neither are dropped.
pub fn read_samples(
    reader: impl BufRead,
    target_path: &str,
    target_basename: &str,
) -> IngestResult {
    let mut result = IngestResult::default();

    for line in reader.lines() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                debug!("stopping ingest on read error: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        result.stats.lines_total += 1;

        if line.contains("PERF_RECORD_MMAP") {
            if let Some(start) = parse_mmap_event(&line, target_path, target_basename) {
                if result.map_bias.is_none() && start != 0 {
                    result.map_bias = Some(start);
                }
            }
            continue;
        }

        match parse_perf_line(&line) {
            Some(sample) => {
                if keep_sample(&sample, target_path, target_basename) {
                    result.samples.push(sample);
                } else {
                    result.stats.samples_filtered += 1;
                }
            }
            None => result.stats.lines_skipped += 1,
        }
    }

    info!(
        "ingested {} samples ({} lines, {} skipped, {} filtered by DSO)",
        result.samples.len(),
        result.stats.lines_total,
        result.stats.lines_skipped,
        result.stats.samples_filtered,
    );
    result
}

/// Drop samples that resolved into a foreign DSO.
fn keep_sample(sample: &Sample, target_path: &str, target_basename: &str) -> bool {
    if sample.dso.is_empty() {
        return true;
    }
    sample.dso.contains(target_path)
        || (!target_basename.is_empty() && sample.dso.contains(target_basename))
}

/// Parse one sample line. Returns `None` for anything malformed.
pub fn parse_perf_line(line: &str) -> Option<Sample> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let mut sample = Sample::default();

    // PID/TID is the anchor: the first a/b token with numeric halves.
    // An optional process-name token precedes it and is ignored.
    let mut idx = tokens.iter().position(|t| parse_pid_tid(t).is_some())?;
    let (pid, tid) = parse_pid_tid(tokens[idx])?;
    sample.pid = pid;
    sample.tid = tid;
    idx += 1;

    // CPU is bracketed.
    let cpu_idx = tokens[idx..]
        .iter()
        .position(|t| parse_bracketed_cpu(t).is_some())?
        + idx;
    sample.cpu = parse_bracketed_cpu(tokens[cpu_idx])?;
    idx = cpu_idx + 1;

    // Timestamp: numeric with a decimal point, fraction normalized to
    // nine digits before conversion to nanoseconds.
    let ts_idx = tokens[idx..]
        .iter()
        .position(|t| parse_timestamp(t).is_some())?
        + idx;
    sample.timestamp = parse_timestamp(tokens[ts_idx])?;
    idx = ts_idx + 1;

    // Event label ends with ':'.
    let ev_idx = tokens[idx..].iter().position(|t| t.ends_with(':'))? + idx;
    sample.kind = classify_event(tokens[ev_idx]);
    idx = ev_idx + 1;

    // Two hex tokens follow; the requested field order fixes them as
    // `addr ip`.
    let addr_idx = tokens[idx..]
        .iter()
        .position(|t| parse_hex(t).is_some())?
        + idx;
    sample.addr = parse_hex(tokens[addr_idx])?;
    let ip_idx = tokens[addr_idx + 1..]
        .iter()
        .position(|t| parse_hex(t).is_some())?
        + addr_idx
        + 1;
    sample.ip = parse_hex(tokens[ip_idx])?;
    idx = ip_idx + 1;

    // DSO is the unique token fully enclosed in parentheses; the free
    // text between the ip and the DSO is the symbol.
    let mut dso_idx = None;
    for (i, t) in tokens[idx..].iter().enumerate() {
        if t.starts_with('(') && t.ends_with(')') {
            dso_idx = Some(idx + i);
            break;
        }
        if is_register_token(t) {
            break;
        }
    }

    let sym_end = dso_idx.unwrap_or_else(|| {
        tokens[idx..]
            .iter()
            .position(|t| is_register_token(t))
            .map(|i| idx + i)
            .unwrap_or(tokens.len())
    });
    if sym_end > idx {
        sample.symbol = trim_symbol(&tokens[idx..sym_end].join(" "));
    }
    if let Some(di) = dso_idx {
        sample.dso = tokens[di]
            .trim_start_matches('(')
            .trim_end_matches(')')
            .to_string();
        idx = di + 1;
    } else {
        idx = sym_end;
    }

    // Sampled registers trail the line in `sp:`/`bp:` (or `rbp:`) pairs
    // or as single `sp:0x..` / `sp=0x..` tokens.
    let mut i = idx;
    while i < tokens.len() {
        let tok = tokens[i].to_ascii_lowercase();
        let (name, inline_value) = match tok.split_once(|c| c == ':' || c == '=') {
            Some((n, v)) => (n.to_string(), (!v.is_empty()).then(|| v.to_string())),
            None => {
                i += 1;
                continue;
            }
        };
        let value = match inline_value {
            Some(v) => parse_hex(&v),
            None => tokens.get(i + 1).and_then(|t| parse_hex(t)).map(|v| {
                i += 1;
                v
            }),
        };
        if let Some(v) = value {
            match name.as_str() {
                "sp" => sample.sp = v,
                "bp" | "rbp" => sample.bp = v,
                _ => {}
            }
        }
        i += 1;
    }

    Some(sample)
}

fn parse_pid_tid(token: &str) -> Option<(u32, u32)> {
    let (a, b) = token.split_once('/')?;
    Some((a.parse().ok()?, b.parse().ok()?))
}

fn parse_bracketed_cpu(token: &str) -> Option<u32> {
    let inner = token.strip_prefix('[')?.strip_suffix(']')?;
    if inner.is_empty() || !inner.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    inner.parse().ok()
}

/// Seconds.fraction to integer nanoseconds, fraction zero-padded to nine
/// digits.
fn parse_timestamp(token: &str) -> Option<u64> {
    let token = token.strip_suffix(':').unwrap_or(token);
    let (secs, frac) = token.split_once('.')?;
    if secs.is_empty() || frac.is_empty() {
        return None;
    }
    let secs: u64 = secs.parse().ok()?;
    let mut frac = frac.to_string();
    if !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    while frac.len() < 9 {
        frac.push('0');
    }
    frac.truncate(9);
    let nanos: u64 = frac.parse().ok()?;
    Some(secs * 1_000_000_000 + nanos)
}

/// Store-labelled events are stores, load-labelled are loads, anything
/// else is treated as a generic access (a load for counting purposes).
fn classify_event(label: &str) -> EventKind {
    let label = label.to_ascii_lowercase();
    if label.contains("store") {
        EventKind::Store
    } else {
        EventKind::Load
    }
}

fn parse_hex(token: &str) -> Option<u64> {
    let token = token.strip_prefix("0x").unwrap_or(token);
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u64::from_str_radix(token, 16).ok()
}

fn is_register_token(token: &str) -> bool {
    let t = token.to_ascii_lowercase();
    t.starts_with("sp:") || t.starts_with("sp=") || t == "sp"
        || t.starts_with("bp:") || t.starts_with("bp=") || t == "bp"
        || t.starts_with("rbp:") || t.starts_with("rbp=") || t == "rbp"
}

/// Strip `+0xNN` offsets and a trailing parenthesized signature so the
/// symbol compares equal to the plain function name.
fn trim_symbol(symbol: &str) -> String {
    let mut s = symbol.trim();
    if let Some(pos) = s.rfind("+0x") {
        s = &s[..pos];
    }
    if s.ends_with(')') {
        if let Some(pos) = s.find('(') {
            s = &s[..pos];
        }
    }
    s.trim().to_string()
}

/// Memory-map events give the target's load address directly.
///
/// A map line carries the mapped range as `[0xSTART(0xLEN)` followed by
/// the image path; only events naming the target are interesting.
fn parse_mmap_event(line: &str, target_path: &str, target_basename: &str) -> Option<u64> {
    if !line.contains(target_path)
        && !(!target_basename.is_empty() && line.contains(target_basename))
    {
        return None;
    }
    let start = line.split('[').nth(1)?;
    let hex = start.split(['(', ' ']).next()?;
    parse_hex(hex.trim())
}

/// Lowest IP among samples attributed to the target binary, used to
/// infer a load bias when no map events were seen.
pub fn min_sample_ip(samples: &[Sample]) -> Option<u64> {
    samples
        .iter()
        .filter(|s| s.ip != 0)
        .map(|s| s.ip)
        .min()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format_sample(s: &Sample) -> String {
        let event = match s.kind {
            EventKind::Store => "mem-stores:pp:",
            _ => "mem-loads:pp:",
        };
        format!(
            "worker {}/{} [{:03}] {}.{:09}: {} {:x} {:x} {}+0x12 ({}) sp: 0x{:x} bp: 0x{:x}",
            s.pid,
            s.tid,
            s.cpu,
            s.timestamp / 1_000_000_000,
            s.timestamp % 1_000_000_000,
            event,
            s.addr,
            s.ip,
            s.symbol,
            s.dso,
            s.sp,
            s.bp,
        )
    }

    #[test]
    fn round_trip_formatted_sample() {
        let sample = Sample {
            tid: 4243,
            pid: 4242,
            cpu: 2,
            ip: 0x401234,
            addr: 0x7f12_ab40,
            sp: 0x7ffc_1000,
            bp: 0x7ffc_1040,
            timestamp: 1234_567_890_123,
            kind: EventKind::Store,
            symbol: "bump_counter".to_string(),
            dso: "/home/u/app".to_string(),
        };
        let parsed = parse_perf_line(&format_sample(&sample)).unwrap();
        assert_eq!(parsed, sample);
    }

    #[test]
    fn short_fraction_is_zero_padded() {
        // "1.5" is 1.5 seconds, not 1s + 5ns.
        assert_eq!(parse_timestamp("1.5"), Some(1_500_000_000));
        assert_eq!(parse_timestamp("0.000000001:"), Some(1));
        assert_eq!(parse_timestamp("12"), None);
    }

    #[test]
    fn event_label_classification() {
        assert_eq!(classify_event("mem-stores:pp:"), EventKind::Store);
        assert_eq!(classify_event("mem-loads:pp:"), EventKind::Load);
        assert_eq!(classify_event("ibs_op//:"), EventKind::Load);
        assert_eq!(classify_event("cpu-cycles:"), EventKind::Load);
    }

    #[test]
    fn symbol_with_signature_and_offset_is_trimmed() {
        let line = "app 10/11 [000] 5.000000100: mem-loads:pp: 7fff0040 401000 push_back(int, char**)+0x40 (/usr/bin/app) sp: 0x7ffc0000";
        let s = parse_perf_line(line).unwrap();
        assert_eq!(s.symbol, "push_back");
        assert_eq!(s.dso, "/usr/bin/app");
        assert_eq!(s.sp, 0x7ffc_0000);
        assert_eq!(s.bp, 0);
    }

    #[test]
    fn equals_form_register_tokens() {
        let line = "app 10/11 [001] 5.1: mem-stores:pp: 7fff0040 401000 f (/usr/bin/app) sp=0x1000 rbp=0x2000";
        let s = parse_perf_line(line).unwrap();
        assert_eq!(s.sp, 0x1000);
        assert_eq!(s.bp, 0x2000);
    }

    #[test]
    fn malformed_lines_are_rejected() {
        assert!(parse_perf_line("").is_none());
        assert!(parse_perf_line("not a sample line at all").is_none());
        // Missing the ip hex token.
        assert!(parse_perf_line("app 10/11 [000] 5.1: mem-loads:pp:").is_none());
    }

    #[test]
    fn dso_filter_keeps_target_and_unknown() {
        let target = "/usr/bin/app";
        let mk = |dso: &str| Sample {
            dso: dso.to_string(),
            ..Default::default()
        };
        assert!(keep_sample(&mk(""), target, "app"));
        assert!(keep_sample(&mk("/usr/bin/app"), target, "app"));
        assert!(keep_sample(&mk("app"), target, "app"));
        assert!(!keep_sample(&mk("/usr/lib/libc.so.6"), target, "app"));
    }

    #[test]
    fn read_samples_filters_and_counts() {
        let input = "\
app 10/11 [000] 5.000000100: mem-loads:pp: 7fff0040 401000 f (/usr/bin/app)\n\
garbage line\n\
app 10/11 [000] 5.000000200: mem-loads:pp: 7fff0040 401000 g (/usr/lib/libc.so.6)\n";
        let result = read_samples(input.as_bytes(), "/usr/bin/app", "app");
        assert_eq!(result.samples.len(), 1);
        assert_eq!(result.stats.lines_total, 3);
        assert_eq!(result.stats.lines_skipped, 1);
        assert_eq!(result.stats.samples_filtered, 1);
    }

    #[test]
    fn mmap_event_yields_map_bias() {
        let input = "\
app 10/11 PERF_RECORD_MMAP2 10/11: [0x555555554000(0x2000) @ 0 08:02 123 0]: r-xp /usr/bin/app\n\
app 10/11 [000] 5.000000100: mem-loads:pp: 7fff0040 401000 f (/usr/bin/app)\n";
        let result = read_samples(input.as_bytes(), "/usr/bin/app", "app");
        assert_eq!(result.map_bias, Some(0x5555_5555_4000));
        assert_eq!(result.samples.len(), 1);
    }
}
