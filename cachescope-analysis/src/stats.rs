//! Sample population statistics

use cachescope_protocol::Sample;
use std::collections::HashSet;
use std::fmt;

/// One-pass summary of the ingested sample population.
#[derive(Debug, Default, Clone)]
pub struct SampleStats {
    pub total_samples: usize,
    pub samples_with_addr: usize,
    pub samples_with_ip: usize,
    pub unique_threads: usize,
    pub unique_cpus: usize,
}

impl SampleStats {
    pub fn compute(samples: &[Sample]) -> Self {
        let mut stats = SampleStats {
            total_samples: samples.len(),
            ..Default::default()
        };
        let mut tids = HashSet::new();
        let mut cpus = HashSet::new();

        for sample in samples {
            if sample.addr != 0 {
                stats.samples_with_addr += 1;
            }
            if sample.ip != 0 {
                stats.samples_with_ip += 1;
            }
            tids.insert(sample.tid);
            cpus.insert(sample.cpu);
        }

        stats.unique_threads = tids.len();
        stats.unique_cpus = cpus.len();
        stats
    }
}

impl fmt::Display for SampleStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.total_samples == 0 {
            return write!(f, "\n=== Sample Statistics ===\nNo samples collected\n");
        }
        let pct = |n: usize| 100.0 * n as f64 / self.total_samples as f64;
        write!(
            f,
            "\n=== Sample Statistics ===\n\
             Total samples: {}\n\
             Samples with address: {} ({:.1}%)\n\
             Samples with IP: {} ({:.1}%)\n\
             Unique threads: {}\n\
             Unique CPUs: {}\n",
            self.total_samples,
            self.samples_with_addr,
            pct(self.samples_with_addr),
            self.samples_with_ip,
            pct(self.samples_with_ip),
            self.unique_threads,
            self.unique_cpus,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_addr_ip_threads_cpus() {
        let mut samples = Vec::new();
        for i in 0..4u32 {
            samples.push(Sample {
                tid: 100 + (i % 2),
                cpu: i,
                addr: if i == 0 { 0 } else { 0x1000 + i as u64 },
                ip: 0x400000,
                ..Default::default()
            });
        }
        let stats = SampleStats::compute(&samples);
        assert_eq!(stats.total_samples, 4);
        assert_eq!(stats.samples_with_addr, 3);
        assert_eq!(stats.samples_with_ip, 4);
        assert_eq!(stats.unique_threads, 2);
        assert_eq!(stats.unique_cpus, 4);
    }

    #[test]
    fn empty_population_displays_placeholder() {
        let stats = SampleStats::compute(&[]);
        assert!(stats.to_string().contains("No samples collected"));
    }
}
