//! CacheScope analysis library
//!
//! The offline half of the pipeline: decode the recorder's sample
//! stream, aggregate samples into cache lines, classify false sharing,
//! and attribute hot lines back to source-level variables.

pub mod aggregate;
pub mod attribute;
pub mod classify;
pub mod ingest;
pub mod stats;
pub mod trace;

pub use aggregate::aggregate;
pub use attribute::{attribute_global, attribute_stack, Attribution, Attributor};
pub use classify::{classify, ClassifierConfig};
pub use ingest::{min_sample_ip, parse_perf_line, read_samples, IngestResult, IngestStats};
pub use stats::SampleStats;
pub use trace::{read_alloc_events, LiveAllocation, LiveSet};
